//! Serial chain of actions that fails fast.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, Instrument, Span};

use super::nested::NestedProcessor;
use super::{bond, Action, ActionPipes, Completion, Pipe, ProcessorConfig, ProcessorEvent};

/// Runs a fixed list of sub-actions in order on a private processor.
///
/// Adjacent sub-actions are bonded. The composite's input feeds the first
/// sub-action and the last sub-action's output becomes the composite's
/// output. The first failure stops the chain.
pub struct CompositeAction {
    name: String,
    pipes: ActionPipes,
    actions: Vec<Box<dyn Action>>,
    nested: Option<Arc<NestedProcessor>>,
    action_timeout: Option<Duration>,
    span: Span,
}

impl CompositeAction {
    pub fn new(name: impl Into<String>, actions: Vec<Box<dyn Action>>) -> Self {
        Self {
            name: name.into(),
            pipes: ActionPipes::default(),
            actions,
            nested: None,
            action_timeout: None,
            span: Span::current(),
        }
    }

    /// Run the chain's bookkeeping task inside `span`.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Terminate and fail any sub-action running longer than `timeout`.
    pub fn with_action_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.action_timeout = timeout;
        self
    }

    /// Number of sub-actions not yet handed to the private processor.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl Action for CompositeAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn pipes(&self) -> &ActionPipes {
        &self.pipes
    }

    fn pipes_mut(&mut self) -> &mut ActionPipes {
        &mut self.pipes
    }

    fn perform(&mut self, completion: Completion) {
        let mut actions = std::mem::take(&mut self.actions);
        if actions.is_empty() {
            completion.finish(true);
            return;
        }

        if let (Some(input), Some(first)) = (self.pipes.input.clone(), actions.first_mut()) {
            first.set_in_pipe(input);
        }
        for i in 1..actions.len() {
            let (head, tail) = actions.split_at_mut(i);
            bond(head[i - 1].as_mut(), tail[0].as_mut());
        }
        let last_output = match actions.last_mut() {
            Some(last) => match last.out_pipe() {
                Some(pipe) => pipe.clone(),
                None => {
                    let pipe = Pipe::new();
                    last.set_out_pipe(pipe.clone());
                    pipe
                }
            },
            None => Pipe::new(),
        };

        let output = self.pipes.output.clone();
        let (nested, mut events) = NestedProcessor::new(ProcessorConfig {
            action_timeout: self.action_timeout,
            halt_on_failure: true,
        });
        self.nested = Some(Arc::clone(&nested));
        let name = self.name.clone();

        tokio::spawn(
            async move {
                if nested.launch(actions).is_none() {
                    completion.finish(false);
                    return;
                }

                let success = loop {
                    match events.recv().await {
                        Some(ProcessorEvent::Finished {
                            name: sub,
                            success: false,
                            ..
                        }) => {
                            debug!(composite = %name, action = %sub, "Sub-action failed, abandoning chain");
                            break false;
                        }
                        Some(ProcessorEvent::Done) => break true,
                        Some(ProcessorEvent::Stopped) | None => break false,
                        Some(_) => {}
                    }
                };

                if success {
                    if let (Some(output), Some(contents)) = (output, last_output.contents()) {
                        output.set_contents(contents);
                    }
                }
                completion.finish(success);
            }
            .instrument(self.span.clone()),
        );
    }

    fn terminate(&mut self) {
        if let Some(nested) = &self.nested {
            nested.terminate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionProcessor, PipeContents};
    use crate::testing::{ActionLog, TestAction, TestBehavior};

    async fn run(action: CompositeAction) -> bool {
        let mut action = action;
        let (completion, rx) = Completion::channel();
        action.perform(completion);
        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("composite did not finish")
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_all_success_copies_last_output() {
        let log = ActionLog::new();
        let first = TestAction::new("first", TestBehavior::Succeed, log.clone())
            .with_output(PipeContents::Count(1));
        let second = TestAction::new("second", TestBehavior::Succeed, log.clone())
            .with_output(PipeContents::ReturnCode(0));

        let mut composite = CompositeAction::new("chain", vec![Box::new(first), Box::new(second)]);
        let output = Pipe::new();
        composite.set_out_pipe(output.clone());

        assert!(run(composite).await);
        assert_eq!(log.started(), vec!["first", "second"]);
        assert_eq!(log.inputs_seen("second"), vec![Some(PipeContents::Count(1))]);
        assert_eq!(output.contents(), Some(PipeContents::ReturnCode(0)));
    }

    #[tokio::test]
    async fn test_input_feeds_first_sub_action() {
        let log = ActionLog::new();
        let only = TestAction::new("only", TestBehavior::Succeed, log.clone());
        let mut composite = CompositeAction::new("chain", vec![Box::new(only)]);
        composite.set_in_pipe(Pipe::with_contents(PipeContents::Count(9)));

        assert!(run(composite).await);
        assert_eq!(log.inputs_seen("only"), vec![Some(PipeContents::Count(9))]);
    }

    #[tokio::test]
    async fn test_first_failure_stops_chain() {
        let log = ActionLog::new();
        let s1 = TestAction::new("s1", TestBehavior::Fail, log.clone());
        let s2 = TestAction::new("s2", TestBehavior::Succeed, log.clone())
            .with_output(PipeContents::Count(2));

        let mut composite = CompositeAction::new("chain", vec![Box::new(s1), Box::new(s2)]);
        let output = Pipe::new();
        composite.set_out_pipe(output.clone());

        assert!(!run(composite).await);
        assert_eq!(log.started(), vec!["s1"]);
        assert!(output.contents().is_none());
    }

    #[tokio::test]
    async fn test_empty_chain_succeeds() {
        assert!(run(CompositeAction::new("empty", vec![])).await);
    }

    #[tokio::test]
    async fn test_terminate_aborts_running_sub_action() {
        let log = ActionLog::new();
        let hang = TestAction::new("hang", TestBehavior::Hang, log.clone());
        let after = TestAction::new("after", TestBehavior::Succeed, log.clone());

        let mut composite = CompositeAction::new("chain", vec![Box::new(hang), Box::new(after)]);
        let (completion, rx) = Completion::channel();
        composite.perform(completion);

        log.wait_for_start("hang").await;
        composite.terminate();

        let success = tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
        assert!(!success);
        assert_eq!(log.terminated(), vec!["hang"]);
        assert_eq!(log.started(), vec!["hang"]);
    }

    #[tokio::test]
    async fn test_sub_action_deadline_fails_chain() {
        let log = ActionLog::new();
        let hang = TestAction::new("hang", TestBehavior::Hang, log.clone());
        let after = TestAction::new("after", TestBehavior::Succeed, log.clone());

        let composite = CompositeAction::new("chain", vec![Box::new(hang), Box::new(after)])
            .with_action_timeout(Some(Duration::from_millis(50)));

        assert!(!run(composite).await);
        assert_eq!(log.terminated(), vec!["hang"]);
        assert_eq!(log.started(), vec!["hang"]);
    }

    #[tokio::test]
    async fn test_runs_on_outer_processor() {
        let log = ActionLog::new();
        let processor = ActionProcessor::new();
        let inner = TestAction::new("inner", TestBehavior::Succeed, log.clone());
        let outer_next = TestAction::new("outer_next", TestBehavior::Succeed, log.clone());

        processor.enqueue(Box::new(CompositeAction::new("chain", vec![Box::new(inner)])));
        processor.enqueue(Box::new(outer_next));
        processor.start();
        processor.wait_until_idle().await;

        assert_eq!(log.started(), vec!["inner", "outer_next"]);
        assert_eq!(processor.actions_completed(), 2);
    }
}
