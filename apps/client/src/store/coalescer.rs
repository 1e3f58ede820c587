//! Per-key write coalescing.
//!
//! Rapid saves to one key collapse into the most recent serialized snapshot.
//! Each staged value gets a generation number; a delayed flush only writes if
//! nothing newer was staged since it was scheduled.

use std::sync::{Mutex, PoisonError};

#[derive(Debug, Default)]
struct Pending {
    text: Option<String>,
    generation: u64,
}

#[derive(Debug, Default)]
pub struct WriteCoalescer {
    pending: Mutex<Pending>,
}

impl WriteCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut Pending) -> R) -> R {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut pending)
    }

    /// Replace whatever is pending. Returns the new generation.
    pub fn stage(&self, text: String) -> u64 {
        self.with(|p| {
            p.generation += 1;
            p.text = Some(text);
            p.generation
        })
    }

    /// Take the pending value regardless of generation.
    pub fn take(&self) -> Option<String> {
        self.with(|p| p.text.take())
    }

    /// Take the pending value only if `generation` is still the latest.
    pub fn take_if_current(&self, generation: u64) -> Option<String> {
        self.with(|p| {
            if p.generation == generation {
                p.text.take()
            } else {
                None
            }
        })
    }

    pub fn peek(&self) -> Option<String> {
        self.with(|p| p.text.clone())
    }

    pub fn has_pending(&self) -> bool {
        self.with(|p| p.text.is_some())
    }
}
