//! SM-2 spaced repetition algorithm.
//!
//! Based on SuperMemo 2 on a 0-5 quality scale, with an interval modifier
//! taken from the learner's scheduling preset.

use super::{SchedulingResult, Scheduler};
use crate::types::{CardState, Quality, MAX_EASE_FACTOR, MAX_INTERVAL_DAYS, MIN_EASE_FACTOR};
use chrono::{DateTime, Duration, Utc};

/// SM-2 algorithm with configurable parameters.
#[derive(Debug, Clone)]
pub struct Sm2 {
    pub minimum_ease: f64,
    pub maximum_ease: f64,
    pub lapse_penalty: f64,
    pub first_interval: u32,
    pub second_interval: u32,
    pub interval_modifier: f64,
    pub maximum_interval: u32,
}

impl Default for Sm2 {
    fn default() -> Self {
        Self {
            minimum_ease: MIN_EASE_FACTOR,
            maximum_ease: MAX_EASE_FACTOR,
            lapse_penalty: 0.2,
            first_interval: 1,
            second_interval: 6,
            interval_modifier: 1.0,
            maximum_interval: MAX_INTERVAL_DAYS,
        }
    }
}

impl Sm2 {
    pub fn with_modifier(interval_modifier: f64) -> Self {
        Self {
            interval_modifier,
            ..Self::default()
        }
    }

    fn clamp_ease(&self, ease: f64) -> f64 {
        ease.clamp(self.minimum_ease, self.maximum_ease)
    }

    /// Returns (repetitions, interval, ease) after a successful recall.
    fn schedule_success(&self, state: &CardState, quality: u8) -> (u32, u32, f64) {
        let repetitions = state.repetitions.saturating_add(1);
        let miss = f64::from(5 - quality);
        let ease = self.clamp_ease(state.ease_factor + (0.1 - miss * (0.08 + miss * 0.02)));

        let interval = match repetitions {
            1 => self.first_interval,
            2 => self.second_interval,
            _ => {
                let grown = (f64::from(state.interval) * ease * self.interval_modifier).round();
                // `as` saturates, so an absurd product still lands on the cap below.
                (grown as u32).max(1)
            }
        };

        (repetitions, interval.min(self.maximum_interval), ease)
    }
}

impl Scheduler for Sm2 {
    fn name(&self) -> &'static str {
        "sm2"
    }

    fn schedule(&self, state: &CardState, quality: Quality, now: DateTime<Utc>) -> SchedulingResult {
        let q = quality.value();

        let (repetitions, interval, ease_factor, max_repetitions) = if quality.is_success() {
            let (reps, interval, ease) = self.schedule_success(state, q);
            (reps, interval, ease, state.max_repetitions.max(reps))
        } else {
            // Lapse: start over, keep the high-water mark
            (
                0,
                self.first_interval,
                self.clamp_ease(state.ease_factor - self.lapse_penalty),
                state.max_repetitions,
            )
        };

        let next_due = now + Duration::days(i64::from(interval));

        SchedulingResult {
            new_state: CardState {
                item_id: state.item_id.clone(),
                ease_factor,
                interval,
                repetitions,
                max_repetitions,
                next_review_at: next_due,
                last_reviewed_at: Some(now),
                last_quality: q,
                times_reviewed: state.times_reviewed.saturating_add(1),
                times_correct: state
                    .times_correct
                    .saturating_add(u32::from(quality.is_success())),
            },
            next_due,
        }
    }
}
