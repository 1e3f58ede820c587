//! Session and progress orchestration.
//!
//! Glue between the scheduler, the persistent store and the sync queue: every
//! mutation updates the in-memory snapshot, stages a debounced save and, when
//! a queue is attached, enqueues a `progress` write of the whole snapshot.

use crate::config::ProgressConfig;
use crate::store::PersistentStore;
use crate::sync::{OperationKind, SyncPayload, SyncQueue};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vocab_core::algorithm::{scheduler_for, Scheduler};
use vocab_core::clock::{date_key, Clock};
use vocab_core::types::{level_for_xp, CardState, Quality, SessionRecord, Settings, Snapshot};
use vocab_core::QualityError;

/// Remote collection receiving progress snapshots.
pub const PROGRESS_COLLECTION: &str = "progress";

/// When `longestStreak >= streak` is enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreakPolicy {
    /// Raise `longestStreak` at every mutation.
    #[default]
    Strict,
    /// Leave it to the sanitizer on the next load.
    Lenient,
}

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error(transparent)]
    Quality(#[from] QualityError),

    #[error("item id must not be empty")]
    EmptyItemId,
}

/// What a single review changed.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewOutcome {
    pub card: CardState,
    pub xp_gained: u32,
    pub level_up: bool,
    /// First successful recall of this item.
    pub newly_learned: bool,
}

pub struct ProgressService {
    store: PersistentStore,
    queue: Option<SyncQueue>,
    clock: Arc<dyn Clock>,
    config: ProgressConfig,
    snapshot: Snapshot,
}

impl ProgressService {
    /// Load the learner snapshot, or start from defaults if nothing usable is stored.
    pub fn open(
        store: PersistentStore,
        queue: Option<SyncQueue>,
        clock: Arc<dyn Clock>,
        config: ProgressConfig,
    ) -> Self {
        let snapshot = match store.load(&config.store_key) {
            Some(snapshot) => snapshot,
            None => {
                info!(key = %config.store_key, "starting with a fresh snapshot");
                Snapshot::default()
            }
        };
        let mut service = Self {
            store,
            queue,
            clock,
            config,
            snapshot,
        };
        service.expire_streak();
        service
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Cards due now, earliest first.
    pub fn due_items(&self) -> Vec<CardState> {
        vocab_core::due_items(&self.snapshot.progress, self.clock.now())
            .into_iter()
            .cloned()
            .collect()
    }

    // === Reviews ===

    /// Schedule one review of `item_id` and record it everywhere.
    ///
    /// Unknown items start from a fresh card.
    pub async fn submit_review(
        &mut self,
        item_id: &str,
        quality: u8,
    ) -> Result<ReviewOutcome, ReviewError> {
        if item_id.is_empty() {
            return Err(ReviewError::EmptyItemId);
        }
        let quality = Quality::new(quality)?;
        let now = self.clock.now();

        let previous = self
            .snapshot
            .progress
            .get(item_id)
            .cloned()
            .unwrap_or_else(|| CardState::new(item_id, now));
        let scheduler = scheduler_for(self.snapshot.settings.scheduling_mode);
        let card = scheduler.schedule(&previous, quality, now).new_state;
        let newly_learned = !previous.has_been_learned() && card.has_been_learned();

        let xp_gained = if quality.is_success() {
            self.config.xp_per_correct
        } else {
            self.config.xp_per_review
        };

        self.record_study_day(newly_learned);

        let stats = &mut self.snapshot.stats;
        stats.total_reviews = stats.total_reviews.saturating_add(1);
        if quality.is_success() {
            stats.correct_reviews = stats.correct_reviews.saturating_add(1);
        }
        let level_up = self.add_xp(xp_gained);

        if let Some(session) = self.snapshot.active_session.as_mut() {
            session.cards_reviewed = session.cards_reviewed.saturating_add(1);
            if quality.is_success() {
                session.cards_correct = session.cards_correct.saturating_add(1);
            }
        }

        self.snapshot.progress.insert(item_id.to_string(), card.clone());
        debug!(
            item_id,
            quality = quality.value(),
            interval = card.interval,
            ease = card.ease_factor,
            "review scheduled"
        );
        self.commit().await;

        Ok(ReviewOutcome {
            card,
            xp_gained,
            level_up,
            newly_learned,
        })
    }

    /// Count today's review and advance the streak on the first review of a day.
    fn record_study_day(&mut self, newly_learned: bool) {
        let today = self.clock.today();
        let key = date_key(today);
        let first_today = self
            .snapshot
            .study_history
            .get(&key)
            .map_or(true, |day| day.reviews == 0);

        let day = self.snapshot.study_history.entry(key).or_default();
        day.reviews = day.reviews.saturating_add(1);
        if newly_learned {
            day.words_learned = day.words_learned.saturating_add(1);
        }

        if first_today {
            let yesterday = date_key(today - Duration::days(1));
            let continued = self
                .snapshot
                .study_history
                .get(&yesterday)
                .is_some_and(|day| day.reviews > 0);
            let stats = &mut self.snapshot.stats;
            stats.streak = if continued { stats.streak.saturating_add(1) } else { 1 };
            self.enforce_streak();
        }
    }

    /// A streak not continued yesterday or today is over.
    fn expire_streak(&mut self) {
        if self.snapshot.stats.streak == 0 {
            return;
        }
        let today = self.clock.today();
        let active = [today, today - Duration::days(1)].iter().any(|day| {
            self.snapshot
                .study_history
                .get(&date_key(*day))
                .is_some_and(|d| d.reviews > 0)
        });
        if !active {
            info!(streak = self.snapshot.stats.streak, "study streak expired");
            self.snapshot.stats.streak = 0;
        }
    }

    fn enforce_streak(&mut self) {
        let stats = &mut self.snapshot.stats;
        if self.config.streak_policy == StreakPolicy::Strict && stats.longest_streak < stats.streak {
            stats.longest_streak = stats.streak;
        }
    }

    /// Returns true on level up.
    fn add_xp(&mut self, amount: u32) -> bool {
        let stats = &mut self.snapshot.stats;
        let before = stats.level;
        stats.xp = stats.xp.saturating_add(u64::from(amount));
        stats.level = level_for_xp(stats.xp);
        if let Some(session) = self.snapshot.active_session.as_mut() {
            session.xp_earned = session.xp_earned.saturating_add(amount);
        }
        stats.level > before
    }

    // === Other mutations ===

    /// Grant bonus xp. Returns true on level up.
    pub async fn award_xp(&mut self, amount: u32) -> bool {
        let level_up = self.add_xp(amount);
        if level_up {
            info!(level = self.snapshot.stats.level, "level up");
        }
        self.commit().await;
        level_up
    }

    /// Returns false if the achievement was already unlocked.
    pub async fn unlock_achievement(&mut self, id: &str) -> bool {
        if !self.snapshot.stats.achievements.insert(id.to_string()) {
            return false;
        }
        info!(achievement = id, "achievement unlocked");
        self.commit().await;
        true
    }

    pub async fn update_settings(&mut self, update: impl FnOnce(&mut Settings)) {
        update(&mut self.snapshot.settings);
        self.commit().await;
    }

    /// Start a session, or resume the open one when `resumeSessions` is set.
    pub async fn start_session(&mut self) -> SessionRecord {
        let now = self.clock.now();
        if let Some(active) = &self.snapshot.active_session {
            if self.snapshot.settings.resume_sessions {
                debug!(session_id = %active.id, "resuming session");
                return active.clone();
            }
            self.close_active(now);
        }
        let session = SessionRecord::start(Uuid::new_v4().to_string(), now);
        self.snapshot.active_session = Some(session.clone());
        self.commit().await;
        session
    }

    /// Finish the active session and move it into history.
    pub async fn end_session(&mut self) -> Option<SessionRecord> {
        let now = self.clock.now();
        let finished = self.close_active(now)?;
        self.commit().await;
        Some(finished)
    }

    fn close_active(&mut self, now: DateTime<Utc>) -> Option<SessionRecord> {
        let mut session = self.snapshot.active_session.take()?;
        session.ended_at = Some(now);
        info!(
            session_id = %session.id,
            reviewed = session.cards_reviewed,
            correct = session.cards_correct,
            "session ended"
        );
        self.snapshot.push_session(session.clone());
        Some(session)
    }

    /// Write staged snapshots now. Returns false if a write was dropped.
    pub fn flush(&self) -> bool {
        self.store.flush()
    }

    // === Persistence ===

    /// Stage the snapshot locally, then queue it for sync without waiting
    /// on the remote.
    async fn commit(&mut self) {
        self.store.save(&self.config.store_key, &self.snapshot);
        let Some(queue) = &self.queue else {
            return;
        };
        match serde_json::to_value(&self.snapshot) {
            Ok(document) => {
                let payload = SyncPayload {
                    user_id: self.config.user_id.clone(),
                    collection: PROGRESS_COLLECTION.to_string(),
                    document,
                };
                if let Err(e) = queue
                    .enqueue_write_detached(OperationKind::Progress, payload)
                    .await
                {
                    warn!(error = %e, "progress not queued for sync");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize snapshot for sync"),
        }
        let status = queue.status().await;
        self.snapshot.pending_sync_count = u32::try_from(status.queue_length).unwrap_or(u32::MAX);
        if status.last_success_at.is_some() {
            self.snapshot.last_synced_at = status.last_success_at;
        }
        self.store.save(&self.config.store_key, &self.snapshot);
    }
}
