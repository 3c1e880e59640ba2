use std::future::Future;

use tokio::task::JoinHandle;
use tracing::{Instrument, Span};

use super::Completion;

/// Background task carrying out a leaf action's work.
///
/// The future's result is reported through the completion. Aborting the task
/// drops the completion unfinished, which reports failure.
#[derive(Debug, Default)]
pub struct ActionTask {
    handle: Option<JoinHandle<()>>,
}

impl ActionTask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `work` inside `span` and finish `completion` with its result.
    pub fn spawn<F>(&mut self, completion: Completion, span: Span, work: F)
    where
        F: Future<Output = bool> + Send + 'static,
    {
        let handle = tokio::spawn(
            async move {
                let success = work.await;
                completion.finish(success);
            }
            .instrument(span),
        );
        self.handle = Some(handle);
    }

    /// Abort the task if it is still running.
    pub fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}
