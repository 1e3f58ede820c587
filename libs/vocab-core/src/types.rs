//! Core types for persisted learner state.

use crate::error::QualityError;
use crate::migration::CURRENT_SCHEMA_VERSION;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const MIN_EASE_FACTOR: f64 = 1.3;
pub const MAX_EASE_FACTOR: f64 = 3.0;
pub const DEFAULT_EASE_FACTOR: f64 = 2.5;
pub const MAX_INTERVAL_DAYS: u32 = 36_500;
pub const MAX_QUALITY: u8 = 5;

/// Number of finished sessions kept in `sessionHistory`.
pub const SESSION_HISTORY_LIMIT: usize = 30;

/// Self-assessed recall quality for one review (0 = blackout, 5 = perfect).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Quality(u8);

impl Quality {
    pub fn new(value: u8) -> Result<Self, QualityError> {
        if value <= MAX_QUALITY {
            Ok(Self(value))
        } else {
            Err(QualityError(value))
        }
    }

    pub fn value(self) -> u8 {
        self.0
    }

    /// Qualities of 3 and above count as a successful recall.
    pub fn is_success(self) -> bool {
        self.0 >= 3
    }
}

impl TryFrom<u8> for Quality {
    type Error = QualityError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Quality> for u8 {
    fn from(quality: Quality) -> Self {
        quality.0
    }
}

/// Scheduling presets that scale interval growth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingMode {
    Aggressive,
    #[default]
    Normal,
    Relaxed,
}

impl SchedulingMode {
    /// Multiplier applied to interval growth for mature cards.
    pub fn interval_modifier(self) -> f64 {
        match self {
            Self::Aggressive => 0.8,
            Self::Normal => 1.0,
            Self::Relaxed => 1.3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aggressive => "aggressive",
            Self::Normal => "normal",
            Self::Relaxed => "relaxed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "aggressive" => Some(Self::Aggressive),
            "normal" => Some(Self::Normal),
            "relaxed" => Some(Self::Relaxed),
            _ => None,
        }
    }
}

/// Spaced-repetition trajectory of one vocabulary item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardState {
    pub item_id: String,
    pub ease_factor: f64,
    /// Days until the next review.
    pub interval: u32,
    /// Consecutive successful reviews since the last lapse.
    pub repetitions: u32,
    /// High-water mark of `repetitions`; survives lapses.
    pub max_repetitions: u32,
    pub next_review_at: DateTime<Utc>,
    pub last_reviewed_at: Option<DateTime<Utc>>,
    pub last_quality: u8,
    pub times_reviewed: u32,
    pub times_correct: u32,
}

impl CardState {
    /// A never-reviewed card, due immediately.
    pub fn new(item_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            item_id: item_id.into(),
            ease_factor: DEFAULT_EASE_FACTOR,
            interval: 0,
            repetitions: 0,
            max_repetitions: 0,
            next_review_at: now,
            last_reviewed_at: None,
            last_quality: 0,
            times_reviewed: 0,
            times_correct: 0,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_review_at <= now
    }

    /// Whether the item was ever recalled successfully, even if it lapsed since.
    pub fn has_been_learned(&self) -> bool {
        self.max_repetitions > 0
    }
}

/// Aggregate learner counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearnerStats {
    pub xp: u64,
    pub level: u32,
    pub streak: u32,
    pub longest_streak: u32,
    pub achievements: BTreeSet<String>,
    pub total_reviews: u64,
    pub correct_reviews: u64,
}

impl Default for LearnerStats {
    fn default() -> Self {
        Self {
            xp: 0,
            level: 1,
            streak: 0,
            longest_streak: 0,
            achievements: BTreeSet::new(),
            total_reviews: 0,
            correct_reviews: 0,
        }
    }
}

/// Level reached with `xp` experience points. Starts at 1 and never decreases as xp grows.
pub fn level_for_xp(xp: u64) -> u32 {
    ((xp as f64 / 100.0).sqrt().floor() as u32).saturating_add(1)
}

/// Activity recorded for one calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudyDay {
    pub reviews: u32,
    pub words_learned: u32,
}

/// One study session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub cards_reviewed: u32,
    pub cards_correct: u32,
    pub xp_earned: u32,
}

impl SessionRecord {
    pub fn start(id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            started_at: now,
            ended_at: None,
            cards_reviewed: 0,
            cards_correct: 0,
            xp_earned: 0,
        }
    }
}

/// Learner-facing study settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub selected_tiers: Vec<u8>,
    pub selected_categories: Vec<String>,
    pub scheduling_mode: SchedulingMode,
    pub sound_enabled: bool,
    pub show_hints: bool,
    pub daily_goal: u32,
    pub resume_sessions: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            selected_tiers: vec![1],
            selected_categories: Vec::new(),
            scheduling_mode: SchedulingMode::default(),
            sound_enabled: true,
            show_hints: true,
            daily_goal: 20,
            resume_sessions: true,
        }
    }
}

/// Full persisted state of one learner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Snapshot {
    pub stats: LearnerStats,
    pub progress: BTreeMap<String, CardState>,
    pub study_history: BTreeMap<String, StudyDay>,
    pub session_history: Vec<SessionRecord>,
    pub active_session: Option<SessionRecord>,
    pub settings: Settings,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub pending_sync_count: u32,
    pub schema_version: u32,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            stats: LearnerStats::default(),
            progress: BTreeMap::new(),
            study_history: BTreeMap::new(),
            session_history: Vec::new(),
            active_session: None,
            settings: Settings::default(),
            last_synced_at: None,
            pending_sync_count: 0,
            schema_version: CURRENT_SCHEMA_VERSION,
        }
    }
}

impl Snapshot {
    /// Append a finished session, keeping only the most recent ones.
    pub fn push_session(&mut self, record: SessionRecord) {
        self.session_history.push(record);
        let excess = self
            .session_history
            .len()
            .saturating_sub(SESSION_HISTORY_LIMIT);
        if excess > 0 {
            self.session_history.drain(..excess);
        }
    }
}

/// Envelope written to the local store: `{ "state": ..., "version": n }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub state: Snapshot,
    pub version: u32,
}

impl PersistedState {
    pub fn new(state: Snapshot) -> Self {
        let version = state.schema_version;
        Self { state, version }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_rejects_values_above_five() {
        assert!(Quality::new(5).is_ok());
        assert_eq!(Quality::new(6), Err(QualityError(6)));
    }

    #[test]
    fn level_grows_with_xp() {
        assert_eq!(level_for_xp(0), 1);
        assert_eq!(level_for_xp(99), 1);
        assert_eq!(level_for_xp(100), 2);
        assert_eq!(level_for_xp(400), 3);
        let mut last = 0;
        for xp in (0..10_000).step_by(37) {
            let level = level_for_xp(xp);
            assert!(level >= last);
            last = level;
        }
    }

    #[test]
    fn session_history_is_bounded() {
        let now = Utc::now();
        let mut snapshot = Snapshot::default();
        for i in 0..35 {
            snapshot.push_session(SessionRecord::start(format!("s{i}"), now));
        }
        assert_eq!(snapshot.session_history.len(), SESSION_HISTORY_LIMIT);
        assert_eq!(snapshot.session_history[0].id, "s5");
    }

    #[test]
    fn card_state_uses_camel_case_keys() {
        let card = CardState::new("logos", Utc::now());
        let json = serde_json::to_value(&card).unwrap();
        assert!(json.get("easeFactor").is_some());
        assert!(json.get("maxRepetitions").is_some());
        assert_eq!(json["lastReviewedAt"], serde_json::Value::Null);
    }
}
