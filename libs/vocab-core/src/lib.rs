//! Core vocabulary progress library shared by the client runtime and tools.
//!
//! Provides:
//! - Shared types (CardState, LearnerStats, Snapshot, Settings, etc.)
//! - SM-2 spaced repetition scheduling with interval presets
//! - Sanitization, validation and corruption detection for stored state
//! - Versioned schema migrations
//! - Recovery of damaged snapshots with loss reporting
//!
//! Everything here is pure: no I/O, no logging. Outcomes are reported through
//! return values.

pub mod algorithm;
pub mod clock;
pub mod error;
pub mod export;
pub mod migration;
pub mod recovery;
pub mod sanitize;
pub mod types;
pub mod validate;

pub use algorithm::{due_items, schedule, scheduler_for, Scheduler, SchedulingResult, Sm2};
pub use clock::{date_key, Clock, FixedClock, SystemClock};
pub use error::{DecodeError, QualityError};
pub use export::{export_snapshot, import_snapshot};
pub use migration::{migrate, MigrationOutcome, MigrationResult, CURRENT_SCHEMA_VERSION};
pub use recovery::{recover, repair_json, LostData, RecoveryResult};
pub use sanitize::{FieldIssue, Problem, Sanitized};
pub use types::{
    level_for_xp, CardState, LearnerStats, PersistedState, Quality, SchedulingMode,
    SessionRecord, Settings, Snapshot, StudyDay,
};
pub use validate::{detect_data_issues, validate, ValidationReport};
