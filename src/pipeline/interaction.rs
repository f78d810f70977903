//! Interaction ids and the shared staleness counter.
//!
//! Every finalized candidate utterance mints a new id. Work started for an older id
//! keeps running until its next checkpoint, where `is_current` tells it to stop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type InteractionId = u64;

/// Session-wide counter of candidate utterances.
///
/// Cloning shares the same counter. Only the owning session mints; pipeline tasks
/// only compare.
#[derive(Debug, Clone, Default)]
pub struct InteractionClock {
    current: Arc<AtomicU64>,
}

impl InteractionClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance to a new interaction and return its id.
    pub fn mint(&self) -> InteractionId {
        self.current.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current(&self) -> InteractionId {
        self.current.load(Ordering::SeqCst)
    }

    pub fn is_current(&self, id: InteractionId) -> bool {
        self.current() == id
    }
}
