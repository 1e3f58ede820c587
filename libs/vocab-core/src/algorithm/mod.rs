//! Spaced repetition scheduling.

pub mod sm2;

use crate::types::{CardState, Quality, SchedulingMode};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

pub use sm2::Sm2;

/// Result of scheduling a card after review.
#[derive(Debug, Clone)]
pub struct SchedulingResult {
    pub new_state: CardState,
    pub next_due: DateTime<Utc>,
}

/// Trait for spaced repetition algorithms.
pub trait Scheduler: Send + Sync {
    /// Algorithm identifier.
    fn name(&self) -> &'static str;

    /// Calculate next review state after a review.
    fn schedule(&self, state: &CardState, quality: Quality, now: DateTime<Utc>) -> SchedulingResult;
}

/// Scheduler configured for a scheduling preset.
pub fn scheduler_for(mode: SchedulingMode) -> Sm2 {
    Sm2::with_modifier(mode.interval_modifier())
}

/// Schedule one review with an explicit interval modifier.
pub fn schedule(
    card: &CardState,
    quality: Quality,
    interval_modifier: f64,
    now: DateTime<Utc>,
) -> CardState {
    Sm2::with_modifier(interval_modifier)
        .schedule(card, quality, now)
        .new_state
}

/// Items whose next review is due, earliest first.
pub fn due_items(progress: &BTreeMap<String, CardState>, now: DateTime<Utc>) -> Vec<&CardState> {
    let mut due: Vec<&CardState> = progress.values().filter(|c| c.is_due(now)).collect();
    due.sort_by(|a, b| {
        a.next_review_at
            .cmp(&b.next_review_at)
            .then_with(|| a.item_id.cmp(&b.item_id))
    });
    due
}
