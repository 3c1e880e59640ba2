//! Action pipeline execution engine.
//!
//! An [`Action`] is one schedulable unit of asynchronous work. Actions run on
//! an [`ActionProcessor`], strictly one at a time and in FIFO order, and hand
//! data to each other through single-slot [`Pipe`]s:
//!
//! - [`CompositeAction`]: a fixed serial chain that fails fast.
//! - [`MultiAction`]: a dynamic fan-out whose aggregate result is decided by
//!   a [`MultiPolicy`].
//!
//! Both composites own a private processor, so nested pipelines never block
//! the outer queue.
//!
//! # Example
//!
//! ```ignore
//! use keystone_core::action::{ActionProcessor, bond};
//!
//! let processor = ActionProcessor::new();
//! bond(&mut check, &mut prefetch);
//! processor.enqueue(Box::new(check));
//! processor.enqueue(Box::new(prefetch));
//! processor.start();
//! processor.wait_until_idle().await;
//! ```

mod composite;
mod multi;
mod nested;
mod pipe;
mod processor;
mod task;

use std::fmt;

use tokio::sync::{mpsc, oneshot};

pub use composite::CompositeAction;
pub use multi::{MultiAction, MultiPolicy, SubActionOutcome};
pub use pipe::{Pipe, PipeContents};
pub use processor::{ActionProcessor, ProcessorConfig, ProcessorEvent, ProcessorHandle};
pub use task::ActionTask;

use processor::Message;

/// Identifier assigned to an action when it is enqueued on a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionId(pub(crate) u64);

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Input and output pipes owned by an action.
#[derive(Debug, Clone, Default)]
pub struct ActionPipes {
    pub input: Option<Pipe>,
    pub output: Option<Pipe>,
}

/// A unit of asynchronous work.
///
/// `perform` must not block. It either calls [`Completion::finish`] before
/// returning or moves the completion into a task that finishes it later.
/// After `terminate` the action must still complete (as a failure); dropping
/// an unfinished [`Completion`] does exactly that.
pub trait Action: Send + 'static {
    /// Human readable name used in logs and processor events.
    fn name(&self) -> &str;

    fn pipes(&self) -> &ActionPipes;

    fn pipes_mut(&mut self) -> &mut ActionPipes;

    /// Begin the work. Called at most once.
    fn perform(&mut self, completion: Completion);

    /// Request an early abort of the work started by `perform`.
    fn terminate(&mut self) {}

    fn in_pipe(&self) -> Option<&Pipe> {
        self.pipes().input.as_ref()
    }

    fn out_pipe(&self) -> Option<&Pipe> {
        self.pipes().output.as_ref()
    }

    fn set_in_pipe(&mut self, pipe: Pipe) {
        self.pipes_mut().input = Some(pipe);
    }

    fn set_out_pipe(&mut self, pipe: Pipe) {
        self.pipes_mut().output = Some(pipe);
    }
}

/// Connect `upstream`'s output to `downstream`'s input with a fresh pipe.
pub fn bond(upstream: &mut dyn Action, downstream: &mut dyn Action) -> Pipe {
    let pipe = Pipe::new();
    upstream.set_out_pipe(pipe.clone());
    downstream.set_in_pipe(pipe.clone());
    pipe
}

enum Target {
    Processor(mpsc::UnboundedSender<Message>),
    Channel(oneshot::Sender<bool>),
}

/// One-shot completion signal handed to [`Action::perform`].
///
/// Finishing consumes the handle, so an action can only report once. A handle
/// dropped without finishing reports failure.
pub struct Completion {
    id: ActionId,
    target: Option<Target>,
}

impl Completion {
    pub(crate) fn for_processor(id: ActionId, tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id,
            target: Some(Target::Processor(tx)),
        }
    }

    /// A completion that reports into a oneshot channel instead of a
    /// processor. Useful for driving a single action directly.
    pub fn channel() -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        let completion = Self {
            id: ActionId(0),
            target: Some(Target::Channel(tx)),
        };
        (completion, rx)
    }

    /// Id of the action this completion belongs to.
    pub fn id(&self) -> ActionId {
        self.id
    }

    /// Report the outcome of the action.
    pub fn finish(mut self, success: bool) {
        self.signal(success);
    }

    fn signal(&mut self, success: bool) {
        match self.target.take() {
            Some(Target::Processor(tx)) => {
                // The driver is gone only when the processor was dropped.
                let _ = tx.send(Message::Finished {
                    id: self.id,
                    success,
                });
            }
            Some(Target::Channel(tx)) => {
                let _ = tx.send(success);
            }
            None => {}
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if self.target.is_some() {
            tracing::debug!(action = %self.id, "Completion dropped without finishing");
            self.signal(false);
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("id", &self.id)
            .field("pending", &self.target.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop {
        pipes: ActionPipes,
    }

    impl Action for Noop {
        fn name(&self) -> &str {
            "noop"
        }

        fn pipes(&self) -> &ActionPipes {
            &self.pipes
        }

        fn pipes_mut(&mut self) -> &mut ActionPipes {
            &mut self.pipes
        }

        fn perform(&mut self, completion: Completion) {
            completion.finish(true);
        }
    }

    #[tokio::test]
    async fn test_completion_channel_reports_outcome() {
        let (completion, rx) = Completion::channel();
        completion.finish(true);
        assert!(rx.await.unwrap());
    }

    #[tokio::test]
    async fn test_dropped_completion_reports_failure() {
        let (completion, rx) = Completion::channel();
        drop(completion);
        assert!(!rx.await.unwrap());
    }

    #[test]
    fn test_bond_shares_pipe() {
        let mut upstream = Noop {
            pipes: ActionPipes::default(),
        };
        let mut downstream = Noop {
            pipes: ActionPipes::default(),
        };

        let pipe = bond(&mut upstream, &mut downstream);

        assert!(upstream.out_pipe().unwrap().same_pipe(&pipe));
        assert!(downstream.in_pipe().unwrap().same_pipe(&pipe));
        assert!(upstream.in_pipe().is_none());
    }

    #[test]
    fn test_action_id_display() {
        assert_eq!(ActionId(7).to_string(), "#7");
    }
}
