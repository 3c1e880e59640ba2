//! Dynamic fan-out of sub-actions with a policy-defined aggregate result.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, Instrument, Span};

use super::nested::NestedProcessor;
use super::{Action, ActionId, ActionPipes, Completion, Pipe, PipeContents, ProcessorConfig, ProcessorEvent};

/// Outcome of one sub-action of a [`MultiAction`].
#[derive(Debug, Clone, PartialEq)]
pub struct SubActionOutcome {
    pub name: String,
    pub success: bool,
    pub output: Option<PipeContents>,
}

/// Decides what a [`MultiAction`] runs and how its result is computed.
#[async_trait]
pub trait MultiPolicy: Send + 'static {
    /// Build the sub-actions for this run from the multi action's input.
    async fn sub_actions(&mut self, input: Option<PipeContents>) -> Vec<Box<dyn Action>>;

    /// Called when the sub-action at `index` starts.
    async fn sub_action_starting(&mut self, _index: usize) {}

    /// Called when the sub-action at `index` finishes.
    async fn sub_action_finished(&mut self, _index: usize, _outcome: &SubActionOutcome) {}

    /// Compute the overall success and output once every sub-action has
    /// finished. `outcomes` is in sub-action order.
    fn aggregate(
        &mut self,
        input: Option<PipeContents>,
        outcomes: &[SubActionOutcome],
    ) -> (bool, Option<PipeContents>);
}

/// Runs the sub-actions produced by a [`MultiPolicy`] on a private
/// processor and reports a single aggregate result.
///
/// The multi action itself never fails because one sub-action failed; that
/// decision belongs to the policy.
pub struct MultiAction<P: MultiPolicy> {
    name: String,
    pipes: ActionPipes,
    policy: Option<P>,
    nested: Option<Arc<NestedProcessor>>,
    action_timeout: Option<Duration>,
    span: Span,
}

impl<P: MultiPolicy> MultiAction<P> {
    pub fn new(name: impl Into<String>, policy: P) -> Self {
        Self {
            name: name.into(),
            pipes: ActionPipes::default(),
            policy: Some(policy),
            nested: None,
            action_timeout: None,
            span: Span::current(),
        }
    }

    /// Run the fan-out's bookkeeping task inside `span`.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Terminate and fail any sub-action running longer than `timeout`.
    pub fn with_action_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.action_timeout = timeout;
        self
    }
}

impl<P: MultiPolicy> Action for MultiAction<P> {
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
        let Some(policy) = self.policy.take() else {
            debug!(action = %self.name, "Multi action performed twice");
            completion.finish(false);
            return;
        };

        let input = self.pipes.input.as_ref().and_then(Pipe::contents);
        let output = self.pipes.output.clone();
        let (nested, events) = NestedProcessor::new(ProcessorConfig {
            action_timeout: self.action_timeout,
            ..Default::default()
        });
        self.nested = Some(Arc::clone(&nested));

        let run = FanOut {
            name: self.name.clone(),
            policy,
            nested,
            events,
        };
        tokio::spawn(
            async move {
                let success = run.execute(input, output).await;
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

struct FanOut<P> {
    name: String,
    policy: P,
    nested: Arc<NestedProcessor>,
    events: tokio::sync::mpsc::UnboundedReceiver<ProcessorEvent>,
}

impl<P: MultiPolicy> FanOut<P> {
    async fn execute(mut self, input: Option<PipeContents>, output: Option<Pipe>) -> bool {
        let mut actions = tokio::select! {
            actions = self.policy.sub_actions(input.clone()) => actions,
            _ = self.nested.cancelled() => {
                debug!(action = %self.name, "Terminated while preparing sub-actions");
                return false;
            }
        };

        let mut names = Vec::with_capacity(actions.len());
        let mut outputs = Vec::with_capacity(actions.len());
        for action in actions.iter_mut() {
            names.push(action.name().to_string());
            let pipe = match action.out_pipe() {
                Some(pipe) => pipe.clone(),
                None => {
                    let pipe = Pipe::new();
                    action.set_out_pipe(pipe.clone());
                    pipe
                }
            };
            outputs.push(pipe);
        }

        if actions.is_empty() {
            let (success, contents) = self.policy.aggregate(input, &[]);
            publish(output.as_ref(), contents);
            return success;
        }

        debug!(action = %self.name, count = actions.len(), "Launching sub-actions");
        let Some(ids) = self.nested.launch(actions) else {
            return false;
        };
        let index_of = |id: &ActionId| ids.iter().position(|candidate| candidate == id);

        let mut results: Vec<Option<bool>> = vec![None; ids.len()];
        loop {
            match self.events.recv().await {
                Some(ProcessorEvent::Starting { id, .. }) => {
                    if let Some(index) = index_of(&id) {
                        self.policy.sub_action_starting(index).await;
                    }
                }
                Some(ProcessorEvent::Finished { id, success, .. }) => {
                    if let Some(index) = index_of(&id) {
                        results[index] = Some(success);
                        let outcome = SubActionOutcome {
                            name: names[index].clone(),
                            success,
                            output: outputs[index].contents(),
                        };
                        self.policy.sub_action_finished(index, &outcome).await;
                    }
                }
                Some(ProcessorEvent::Done) => break,
                Some(ProcessorEvent::Stopped) | None => {
                    debug!(action = %self.name, "Sub-actions stopped");
                    return false;
                }
                Some(_) => {}
            }
        }

        if self.nested.is_terminated() {
            return false;
        }

        let outcomes: Vec<SubActionOutcome> = names
            .into_iter()
            .zip(outputs.iter())
            .zip(results)
            .map(|((name, pipe), result)| SubActionOutcome {
                name,
                success: result.unwrap_or(false),
                output: pipe.contents(),
            })
            .collect();

        let (success, contents) = self.policy.aggregate(input, &outcomes);
        publish(output.as_ref(), contents);
        success
    }
}

fn publish(output: Option<&Pipe>, contents: Option<PipeContents>) {
    if let (Some(pipe), Some(contents)) = (output, contents) {
        pipe.set_contents(contents);
    }
}
