//! Single-slot data handoff between two actions.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use crate::update::UpdateInfo;

/// Value carried by a [`Pipe`] from one pipeline stage to the next.
#[derive(Debug, Clone, PartialEq)]
pub enum PipeContents {
    /// Available updates (check and prefetch stages).
    Updates(Vec<UpdateInfo>),
    /// Number of sub-actions enqueued (update stages).
    Count(usize),
    /// Location of a downloaded payload.
    Path(PathBuf),
    /// Exit status of an installer.
    ReturnCode(i32),
}

impl PipeContents {
    /// Returns the updates if this is an `Updates` value.
    pub fn as_updates(&self) -> Option<&[UpdateInfo]> {
        match self {
            PipeContents::Updates(updates) => Some(updates),
            _ => None,
        }
    }

    /// Consumes the value, returning the updates if this is an `Updates` value.
    pub fn into_updates(self) -> Option<Vec<UpdateInfo>> {
        match self {
            PipeContents::Updates(updates) => Some(updates),
            _ => None,
        }
    }
}

/// Handle to a single-slot pipe.
///
/// Clones share the same slot. The upstream action writes when it finishes and
/// the downstream action reads when it starts; the processor runs one action
/// at a time, so the mutex is never contended in practice.
#[derive(Debug, Clone, Default)]
pub struct Pipe {
    slot: Arc<Mutex<Option<PipeContents>>>,
}

impl Pipe {
    /// Create an empty pipe.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pipe already holding `contents`.
    pub fn with_contents(contents: PipeContents) -> Self {
        let pipe = Self::new();
        pipe.set_contents(contents);
        pipe
    }

    /// Replace the contents of the pipe.
    pub fn set_contents(&self, contents: PipeContents) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(contents);
    }

    /// Returns a copy of the current contents.
    pub fn contents(&self) -> Option<PipeContents> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Removes and returns the current contents.
    pub fn take_contents(&self) -> Option<PipeContents> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Whether two handles refer to the same slot.
    pub fn same_pipe(&self, other: &Pipe) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_pipe_is_empty() {
        let pipe = Pipe::new();
        assert!(pipe.contents().is_none());
    }

    #[test]
    fn test_clones_share_slot() {
        let producer = Pipe::new();
        let consumer = producer.clone();

        producer.set_contents(PipeContents::Count(3));

        assert_eq!(consumer.contents(), Some(PipeContents::Count(3)));
        assert!(producer.same_pipe(&consumer));
        assert!(!producer.same_pipe(&Pipe::new()));
    }

    #[test]
    fn test_take_contents_empties_slot() {
        let pipe = Pipe::with_contents(PipeContents::ReturnCode(0));
        assert_eq!(pipe.take_contents(), Some(PipeContents::ReturnCode(0)));
        assert!(pipe.contents().is_none());
    }

    #[test]
    fn test_as_updates() {
        let contents = PipeContents::Updates(vec![]);
        assert_eq!(contents.as_updates().map(|u| u.len()), Some(0));
        assert!(PipeContents::Count(1).as_updates().is_none());
        assert!(PipeContents::Count(1).into_updates().is_none());
    }
}
