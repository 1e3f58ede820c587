//! Field-level sanitization of raw persisted records.
//!
//! Every sanitizer is total: any JSON value goes in, a valid typed value comes
//! out. Each field is defaulted on its own when missing or mistyped, then
//! clamped into range. Running a sanitizer on its own (re-serialized) output
//! yields the same value.
//!
//! The `*_with_report` variants also return the list of fields that had to be
//! repaired.

use crate::clock::parse_date_key;
use crate::error::{value_kind, DecodeError};
use crate::types::{
    level_for_xp, CardState, LearnerStats, SchedulingMode, SessionRecord, Settings, Snapshot,
    StudyDay, DEFAULT_EASE_FACTOR, MAX_EASE_FACTOR, MAX_INTERVAL_DAYS, MAX_QUALITY,
    MIN_EASE_FACTOR, SESSION_HISTORY_LIMIT,
};
use chrono::{DateTime, Datelike, Utc};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

const MAX_DAILY_GOAL: u32 = 1_000;

static NULL: Value = Value::Null;

fn field<'v>(state: &'v Value, name: &str) -> &'v Value {
    state.get(name).unwrap_or(&NULL)
}

/// What was wrong with a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Problem {
    Missing,
    WrongType(&'static str),
    OutOfRange,
    InvalidDate,
    Dropped,
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => write!(f, "missing"),
            Self::WrongType(found) => write!(f, "wrong type ({found})"),
            Self::OutOfRange => write!(f, "out of range"),
            Self::InvalidDate => write!(f, "not a valid date"),
            Self::Dropped => write!(f, "dropped"),
        }
    }
}

/// A repaired field, addressed by its dotted path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldIssue {
    pub field: String,
    pub problem: Problem,
}

impl fmt::Display for FieldIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.problem)
    }
}

/// A sanitized value plus the repairs made to produce it.
#[derive(Debug, Clone, PartialEq)]
pub struct Sanitized<T> {
    pub value: T,
    pub issues: Vec<FieldIssue>,
}

/// Reads fields of one JSON object, recording every repair.
struct FieldReader<'a> {
    obj: Option<&'a Map<String, Value>>,
    prefix: String,
    issues: Vec<FieldIssue>,
}

impl<'a> FieldReader<'a> {
    fn new(raw: &'a Value, prefix: impl Into<String>) -> Self {
        Self {
            obj: raw.as_object(),
            prefix: prefix.into(),
            issues: Vec::new(),
        }
    }

    fn path(&self, name: &str) -> String {
        if name.is_empty() {
            self.prefix.clone()
        } else if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.prefix, name)
        }
    }

    fn report(&mut self, name: &str, problem: Problem) {
        let field = self.path(name);
        self.issues.push(FieldIssue { field, problem });
    }

    fn get(&self, name: &str) -> Option<&'a Value> {
        self.obj.and_then(|o| o.get(name))
    }

    /// A finite number, or `None` after recording why not.
    fn number(&mut self, name: &str) -> Option<f64> {
        match self.get(name) {
            None => {
                self.report(name, Problem::Missing);
                None
            }
            Some(Value::Number(n)) => n.as_f64().filter(|f| f.is_finite()),
            Some(other) => {
                self.report(name, Problem::WrongType(value_kind(other)));
                None
            }
        }
    }

    fn count_capped(&mut self, name: &str, max: u64) -> u64 {
        let Some(value) = self.number(name) else {
            return 0;
        };
        let rounded = value.round();
        if rounded < 0.0 {
            self.report(name, Problem::OutOfRange);
            0
        } else if rounded > max as f64 {
            self.report(name, Problem::OutOfRange);
            max
        } else {
            rounded as u64
        }
    }

    fn count(&mut self, name: &str) -> u32 {
        self.count_capped(name, u64::from(u32::MAX)) as u32
    }

    fn count64(&mut self, name: &str) -> u64 {
        // Largest integer an f64 represents exactly.
        self.count_capped(name, 1 << 53)
    }

    fn float_in(&mut self, name: &str, default: f64, min: f64, max: f64) -> f64 {
        match self.number(name) {
            None => default,
            Some(v) if v < min || v > max => {
                self.report(name, Problem::OutOfRange);
                v.clamp(min, max)
            }
            Some(v) => v,
        }
    }

    fn boolean(&mut self, name: &str, default: bool) -> bool {
        match self.get(name) {
            Some(Value::Bool(b)) => *b,
            None => {
                self.report(name, Problem::Missing);
                default
            }
            Some(other) => {
                self.report(name, Problem::WrongType(value_kind(other)));
                default
            }
        }
    }

    fn string(&mut self, name: &str) -> Option<String> {
        match self.get(name) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            None => {
                self.report(name, Problem::Missing);
                None
            }
            Some(other) => {
                self.report(name, Problem::WrongType(value_kind(other)));
                None
            }
        }
    }

    fn required_date(&mut self, name: &str, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.get(name) {
            None => {
                self.report(name, Problem::Missing);
                now
            }
            Some(value) => parse_timestamp(value).unwrap_or_else(|| {
                self.report(name, Problem::InvalidDate);
                now
            }),
        }
    }

    fn optional_date(&mut self, name: &str) -> Option<DateTime<Utc>> {
        match self.get(name) {
            None | Some(Value::Null) => None,
            Some(value) => {
                let parsed = parse_timestamp(value);
                if parsed.is_none() {
                    self.report(name, Problem::InvalidDate);
                }
                parsed
            }
        }
    }

    fn finish<T>(self, value: T) -> Sanitized<T> {
        Sanitized {
            value,
            issues: self.issues,
        }
    }
}

/// Coerce a stored timestamp: RFC 3339 strings or Unix milliseconds.
///
/// Years outside 0000-9999 are rejected; RFC 3339 cannot write them back.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let parsed = match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_f64()
            .filter(|f| f.is_finite())
            .and_then(|ms| DateTime::from_timestamp_millis(ms as i64)),
        _ => None,
    };
    parsed.filter(|dt| (0..=9999).contains(&dt.year()))
}

pub fn sanitize_card(raw: &Value, item_id: &str, now: DateTime<Utc>) -> CardState {
    sanitize_card_with_report(raw, item_id, now).value
}

pub fn sanitize_card_with_report(
    raw: &Value,
    item_id: &str,
    now: DateTime<Utc>,
) -> Sanitized<CardState> {
    let mut r = FieldReader::new(raw, format!("progress.{item_id}"));
    if r.obj.is_none() {
        r.report("", Problem::WrongType(value_kind(raw)));
    }

    let ease_factor = r.float_in("easeFactor", DEFAULT_EASE_FACTOR, MIN_EASE_FACTOR, MAX_EASE_FACTOR);
    let interval = r.count("interval");
    let interval = if interval > MAX_INTERVAL_DAYS {
        r.report("interval", Problem::OutOfRange);
        MAX_INTERVAL_DAYS
    } else {
        interval
    };
    let repetitions = r.count("repetitions");
    let max_repetitions = r.count("maxRepetitions");
    let next_review_at = r.required_date("nextReviewAt", now);
    let last_reviewed_at = r.optional_date("lastReviewedAt");
    let last_quality = r.count_capped("lastQuality", u64::from(MAX_QUALITY)) as u8;
    let times_reviewed = r.count("timesReviewed");
    let mut times_correct = r.count("timesCorrect");
    if times_correct > times_reviewed {
        r.report("timesCorrect", Problem::OutOfRange);
        times_correct = times_reviewed;
    }

    r.finish(CardState {
        item_id: item_id.to_string(),
        ease_factor,
        interval,
        repetitions,
        max_repetitions,
        next_review_at,
        last_reviewed_at,
        last_quality,
        times_reviewed,
        times_correct,
    })
}

/// Lenient bulk form: entries that are not objects are dropped.
pub fn sanitize_progress(raw: &Value, now: DateTime<Utc>) -> Sanitized<BTreeMap<String, CardState>> {
    let mut progress = BTreeMap::new();
    let mut issues = Vec::new();
    let Some(entries) = raw.as_object() else {
        if !raw.is_null() {
            issues.push(FieldIssue {
                field: "progress".to_string(),
                problem: Problem::WrongType(value_kind(raw)),
            });
        }
        return Sanitized {
            value: progress,
            issues,
        };
    };

    for (item_id, entry) in entries {
        if !entry.is_object() {
            issues.push(FieldIssue {
                field: format!("progress.{item_id}"),
                problem: Problem::Dropped,
            });
            continue;
        }
        let card = sanitize_card_with_report(entry, item_id, now);
        issues.extend(card.issues);
        progress.insert(item_id.clone(), card.value);
    }

    Sanitized {
        value: progress,
        issues,
    }
}

/// Strict bulk form: fails if the container or any entry has the wrong shape.
pub fn try_sanitize_progress(
    raw: &Value,
    now: DateTime<Utc>,
) -> Result<BTreeMap<String, CardState>, DecodeError> {
    let entries = raw.as_object().ok_or_else(|| DecodeError::WrongType {
        path: "progress".to_string(),
        expected: "an object",
        found: value_kind(raw),
    })?;

    entries
        .iter()
        .map(|(item_id, entry)| {
            if entry.is_object() {
                Ok((item_id.clone(), sanitize_card(entry, item_id, now)))
            } else {
                Err(DecodeError::MalformedEntry {
                    path: "progress".to_string(),
                    key: item_id.clone(),
                    found: value_kind(entry),
                })
            }
        })
        .collect()
}

pub fn sanitize_stats(raw: &Value) -> LearnerStats {
    sanitize_stats_with_report(raw).value
}

pub fn sanitize_stats_with_report(raw: &Value) -> Sanitized<LearnerStats> {
    let mut r = FieldReader::new(raw, "stats");
    if r.obj.is_none() {
        r.report("", Problem::WrongType(value_kind(raw)));
    }

    let xp = r.count64("xp");
    let streak = r.count("streak");
    let mut longest_streak = r.count("longestStreak");
    if longest_streak < streak {
        r.report("longestStreak", Problem::OutOfRange);
        longest_streak = streak;
    }
    let total_reviews = r.count64("totalReviews");
    let mut correct_reviews = r.count64("correctReviews");
    if correct_reviews > total_reviews {
        r.report("correctReviews", Problem::OutOfRange);
        correct_reviews = total_reviews;
    }

    let achievements = match r.get("achievements") {
        Some(Value::Array(items)) => {
            let kept: BTreeSet<String> = items
                .iter()
                .filter_map(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if kept.len() < items.len() {
                r.report("achievements", Problem::Dropped);
            }
            kept
        }
        None => {
            r.report("achievements", Problem::Missing);
            BTreeSet::new()
        }
        Some(other) => {
            r.report("achievements", Problem::WrongType(value_kind(other)));
            BTreeSet::new()
        }
    };

    r.finish(LearnerStats {
        xp,
        level: level_for_xp(xp),
        streak,
        longest_streak,
        achievements,
        total_reviews,
        correct_reviews,
    })
}

/// Strict form: fails when `stats` is not an object at all.
pub fn try_sanitize_stats(raw: &Value) -> Result<LearnerStats, DecodeError> {
    if raw.is_object() {
        Ok(sanitize_stats(raw))
    } else {
        Err(DecodeError::WrongType {
            path: "stats".to_string(),
            expected: "an object",
            found: value_kind(raw),
        })
    }
}

pub fn sanitize_study_history(raw: &Value) -> BTreeMap<String, StudyDay> {
    sanitize_study_history_with_report(raw).value
}

/// Keys that are not strict `YYYY-MM-DD` dates are dropped.
pub fn sanitize_study_history_with_report(raw: &Value) -> Sanitized<BTreeMap<String, StudyDay>> {
    let mut history = BTreeMap::new();
    let mut issues = Vec::new();
    let Some(days) = raw.as_object() else {
        return Sanitized {
            value: history,
            issues,
        };
    };

    for (key, day) in days {
        if parse_date_key(key).is_none() || !day.is_object() {
            issues.push(FieldIssue {
                field: format!("studyHistory.{key}"),
                problem: Problem::Dropped,
            });
            continue;
        }
        let mut r = FieldReader::new(day, format!("studyHistory.{key}"));
        let reviews = r.count("reviews");
        let words_learned = r.count("wordsLearned");
        issues.extend(r.issues);
        history.insert(
            key.clone(),
            StudyDay {
                reviews,
                words_learned,
            },
        );
    }

    Sanitized {
        value: history,
        issues,
    }
}

fn sanitize_session(
    raw: &Value,
    fallback_id: String,
    path: String,
    now: DateTime<Utc>,
) -> Sanitized<SessionRecord> {
    let mut r = FieldReader::new(raw, path);
    let id = r.string("id").unwrap_or(fallback_id);
    let started_at = r.required_date("startedAt", now);
    let ended_at = r.optional_date("endedAt");
    let cards_reviewed = r.count("cardsReviewed");
    let mut cards_correct = r.count("cardsCorrect");
    if cards_correct > cards_reviewed {
        r.report("cardsCorrect", Problem::OutOfRange);
        cards_correct = cards_reviewed;
    }
    let xp_earned = r.count("xpEarned");

    r.finish(SessionRecord {
        id,
        started_at,
        ended_at,
        cards_reviewed,
        cards_correct,
        xp_earned,
    })
}

pub fn sanitize_session_history(raw: &Value, now: DateTime<Utc>) -> Vec<SessionRecord> {
    sanitize_session_history_with_report(raw, now).value
}

/// Non-object entries are dropped and only the most recent sessions are kept.
pub fn sanitize_session_history_with_report(
    raw: &Value,
    now: DateTime<Utc>,
) -> Sanitized<Vec<SessionRecord>> {
    let mut sessions = Vec::new();
    let mut issues = Vec::new();
    let Some(entries) = raw.as_array() else {
        return Sanitized {
            value: sessions,
            issues,
        };
    };

    for (index, entry) in entries.iter().enumerate() {
        let path = format!("sessionHistory[{index}]");
        if !entry.is_object() {
            issues.push(FieldIssue {
                field: path,
                problem: Problem::Dropped,
            });
            continue;
        }
        let session = sanitize_session(entry, format!("session-{index}"), path, now);
        issues.extend(session.issues);
        sessions.push(session.value);
    }

    let excess = sessions.len().saturating_sub(SESSION_HISTORY_LIMIT);
    if excess > 0 {
        sessions.drain(..excess);
        issues.push(FieldIssue {
            field: "sessionHistory".to_string(),
            problem: Problem::OutOfRange,
        });
    }

    Sanitized {
        value: sessions,
        issues,
    }
}

pub fn sanitize_active_session(raw: &Value, now: DateTime<Utc>) -> Option<SessionRecord> {
    raw.is_object().then(|| {
        sanitize_session(raw, "active".to_string(), "activeSession".to_string(), now).value
    })
}

pub fn sanitize_settings(raw: &Value) -> Settings {
    sanitize_settings_with_report(raw).value
}

pub fn sanitize_settings_with_report(raw: &Value) -> Sanitized<Settings> {
    let defaults = Settings::default();
    let mut r = FieldReader::new(raw, "settings");

    let selected_tiers = match r.get("selectedTiers") {
        Some(Value::Array(items)) => {
            let mut tiers: Vec<u8> = Vec::with_capacity(items.len());
            for tier in items.iter().filter_map(Value::as_u64) {
                if let Ok(tier) = u8::try_from(tier) {
                    if !tiers.contains(&tier) {
                        tiers.push(tier);
                    }
                }
            }
            if tiers.len() < items.len() {
                r.report("selectedTiers", Problem::Dropped);
            }
            tiers
        }
        _ => {
            r.report("selectedTiers", Problem::Missing);
            defaults.selected_tiers.clone()
        }
    };

    let selected_categories = match r.get("selectedCategories") {
        Some(Value::Array(items)) => {
            let mut categories: Vec<String> = Vec::with_capacity(items.len());
            for category in items.iter().filter_map(Value::as_str) {
                if !category.is_empty() && !categories.iter().any(|c| c == category) {
                    categories.push(category.to_string());
                }
            }
            if categories.len() < items.len() {
                r.report("selectedCategories", Problem::Dropped);
            }
            categories
        }
        _ => {
            r.report("selectedCategories", Problem::Missing);
            defaults.selected_categories.clone()
        }
    };

    let scheduling_mode = match r.get("schedulingMode") {
        Some(Value::String(mode)) => SchedulingMode::parse(mode).unwrap_or_else(|| {
            r.report("schedulingMode", Problem::OutOfRange);
            defaults.scheduling_mode
        }),
        None => {
            r.report("schedulingMode", Problem::Missing);
            defaults.scheduling_mode
        }
        Some(other) => {
            r.report("schedulingMode", Problem::WrongType(value_kind(other)));
            defaults.scheduling_mode
        }
    };

    let sound_enabled = r.boolean("soundEnabled", defaults.sound_enabled);
    let show_hints = r.boolean("showHints", defaults.show_hints);
    let resume_sessions = r.boolean("resumeSessions", defaults.resume_sessions);
    let daily_goal = match r.get("dailyGoal") {
        None => {
            r.report("dailyGoal", Problem::Missing);
            defaults.daily_goal
        }
        Some(Value::Number(_)) => r.count("dailyGoal").clamp(1, MAX_DAILY_GOAL),
        Some(other) => {
            r.report("dailyGoal", Problem::WrongType(value_kind(other)));
            defaults.daily_goal
        }
    };

    r.finish(Settings {
        selected_tiers,
        selected_categories,
        scheduling_mode,
        sound_enabled,
        show_hints,
        daily_goal,
        resume_sessions,
    })
}

/// Sanitize a whole `state` object.
pub fn sanitize_snapshot(state: &Value, now: DateTime<Utc>) -> Sanitized<Snapshot> {
    let mut issues = Vec::new();
    let stats = sanitize_stats_with_report(field(state, "stats"));
    issues.extend(stats.issues);
    let progress = sanitize_progress(field(state, "progress"), now);
    issues.extend(progress.issues);
    let history = sanitize_study_history_with_report(field(state, "studyHistory"));
    issues.extend(history.issues);
    let sessions = sanitize_session_history_with_report(field(state, "sessionHistory"), now);
    issues.extend(sessions.issues);
    let settings = sanitize_settings_with_report(field(state, "settings"));
    issues.extend(settings.issues);

    let mut r = FieldReader::new(state, "");
    let last_synced_at = r.optional_date("lastSyncedAt");
    let pending_sync_count = r.count("pendingSyncCount");
    let schema_version = r.count("schemaVersion");
    issues.extend(r.issues);

    Sanitized {
        value: Snapshot {
            stats: stats.value,
            progress: progress.value,
            study_history: history.value,
            session_history: sessions.value,
            active_session: sanitize_active_session(field(state, "activeSession"), now),
            settings: settings.value,
            last_synced_at,
            pending_sync_count,
            schema_version,
        },
        issues,
    }
}
