use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, Notify};

use super::{Action, ActionId, ActionProcessor, ProcessorConfig, ProcessorEvent};

/// Private processor owned by a composite action.
///
/// Termination can arrive before the composite has finished preparing its
/// sub-actions, so the flag is checked again when they are launched.
pub(crate) struct NestedProcessor {
    processor: ActionProcessor,
    terminated: Mutex<bool>,
    cancelled: Notify,
}

impl NestedProcessor {
    pub(crate) fn new(config: ProcessorConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<ProcessorEvent>) {
        let (processor, events) = ActionProcessor::with_events(config);
        let nested = Arc::new(Self {
            processor,
            terminated: Mutex::new(false),
            cancelled: Notify::new(),
        });
        (nested, events)
    }

    /// Enqueue and start `actions`. Returns `None` if already terminated.
    pub(crate) fn launch(&self, actions: Vec<Box<dyn Action>>) -> Option<Vec<ActionId>> {
        let terminated = self.terminated.lock().unwrap_or_else(PoisonError::into_inner);
        if *terminated {
            return None;
        }
        let ids = actions
            .into_iter()
            .map(|action| self.processor.enqueue(action))
            .collect();
        self.processor.start();
        Some(ids)
    }

    pub(crate) fn terminate(&self) {
        let mut terminated = self.terminated.lock().unwrap_or_else(PoisonError::into_inner);
        *terminated = true;
        self.processor.stop();
        self.cancelled.notify_one();
    }

    pub(crate) fn is_terminated(&self) -> bool {
        *self.terminated.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves once `terminate` has been called.
    pub(crate) async fn cancelled(&self) {
        self.cancelled.notified().await;
    }
}
