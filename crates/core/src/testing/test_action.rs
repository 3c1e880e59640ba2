//! Scripted action for exercising processors and composites.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::Span;

use crate::action::{Action, ActionPipes, ActionTask, Completion, PipeContents, ProcessorHandle};

/// How a [`TestAction`] behaves when performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestBehavior {
    /// Finish successfully inside `perform`.
    Succeed,
    /// Finish unsuccessfully inside `perform`.
    Fail,
    /// Finish successfully after a delay.
    SucceedAfter(Duration),
    /// Never finish unless terminated.
    Hang,
}

#[derive(Debug, Default)]
struct LogInner {
    started: Vec<String>,
    finished: Vec<(String, bool)>,
    terminated: Vec<String>,
    inputs: Vec<(String, Option<PipeContents>)>,
    running: usize,
    max_running: usize,
}

/// Shared record of what [`TestAction`]s did.
#[derive(Debug, Clone, Default)]
pub struct ActionLog {
    inner: Arc<Mutex<LogInner>>,
}

impl ActionLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut LogInner) -> R) -> R {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut inner)
    }

    fn record_start(&self, name: &str, input: Option<PipeContents>) {
        self.with(|log| {
            log.started.push(name.to_string());
            log.inputs.push((name.to_string(), input));
            log.running += 1;
            log.max_running = log.max_running.max(log.running);
        });
    }

    fn record_finish(&self, name: &str, success: bool) {
        self.with(|log| {
            log.finished.push((name.to_string(), success));
            log.running = log.running.saturating_sub(1);
        });
    }

    fn record_terminate(&self, name: &str) {
        self.with(|log| {
            log.terminated.push(name.to_string());
            log.running = log.running.saturating_sub(1);
        });
    }

    /// Names of started actions, in start order.
    pub fn started(&self) -> Vec<String> {
        self.with(|log| log.started.clone())
    }

    /// Names and outcomes of actions that finished on their own.
    pub fn finished(&self) -> Vec<(String, bool)> {
        self.with(|log| log.finished.clone())
    }

    pub fn terminated(&self) -> Vec<String> {
        self.with(|log| log.terminated.clone())
    }

    /// Input pipe contents observed by each run of the named action.
    pub fn inputs_seen(&self, name: &str) -> Vec<Option<PipeContents>> {
        self.with(|log| {
            log.inputs
                .iter()
                .filter(|(n, _)| n == name)
                .map(|(_, input)| input.clone())
                .collect()
        })
    }

    /// Highest number of actions observed running at the same time.
    pub fn max_concurrent(&self) -> usize {
        self.with(|log| log.max_running)
    }

    /// Wait until the named action has started.
    pub async fn wait_for_start(&self, name: &str) {
        while !self.with(|log| log.started.iter().any(|n| n == name)) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

/// Action whose outcome is scripted by a [`TestBehavior`].
pub struct TestAction {
    name: String,
    pipes: ActionPipes,
    behavior: TestBehavior,
    output: Option<PipeContents>,
    follow_up: Option<(ProcessorHandle, Box<dyn Action>)>,
    log: ActionLog,
    task: ActionTask,
}

impl TestAction {
    pub fn new(name: impl Into<String>, behavior: TestBehavior, log: ActionLog) -> Self {
        Self {
            name: name.into(),
            pipes: ActionPipes::default(),
            behavior,
            output: None,
            follow_up: None,
            log,
            task: ActionTask::new(),
        }
    }

    /// Write `contents` to the output pipe on success.
    pub fn with_output(mut self, contents: PipeContents) -> Self {
        self.output = Some(contents);
        self
    }

    /// Enqueue `action` on `processor` when performed.
    pub fn enqueue_on_perform(mut self, processor: ProcessorHandle, action: Box<dyn Action>) -> Self {
        self.follow_up = Some((processor, action));
        self
    }
}

impl Action for TestAction {
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
        let input = self.in_pipe().and_then(|pipe| pipe.contents());
        self.log.record_start(&self.name, input);

        if let Some((processor, action)) = self.follow_up.take() {
            processor.enqueue(action);
        }

        let output = self.out_pipe().cloned().zip(self.output.clone());
        match self.behavior {
            TestBehavior::Succeed => {
                if let Some((pipe, contents)) = output {
                    pipe.set_contents(contents);
                }
                self.log.record_finish(&self.name, true);
                completion.finish(true);
            }
            TestBehavior::Fail => {
                self.log.record_finish(&self.name, false);
                completion.finish(false);
            }
            TestBehavior::SucceedAfter(delay) => {
                let log = self.log.clone();
                let name = self.name.clone();
                self.task.spawn(completion, Span::none(), async move {
                    tokio::time::sleep(delay).await;
                    if let Some((pipe, contents)) = output {
                        pipe.set_contents(contents);
                    }
                    log.record_finish(&name, true);
                    true
                });
            }
            TestBehavior::Hang => {
                self.task.spawn(completion, Span::none(), std::future::pending());
            }
        }
    }

    fn terminate(&mut self) {
        self.log.record_terminate(&self.name);
        self.task.abort();
    }
}
