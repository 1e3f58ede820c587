//! Versioned schema migrations for persisted snapshots.
//!
//! Each step upgrades from one version to the next by adding missing fields
//! with safe defaults. Steps never remove a field or change what an existing
//! field means. The only structural substitution is replacing a `state` (or a
//! container a step writes into) that is not an object at all.

use crate::error::value_kind;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::panic::{self, AssertUnwindSafe};

/// Schema version written by this build.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Fields dropped from the schema; removed on load.
pub const DEPRECATED_FIELDS: &[&str] = &["reviewQueue", "dueCountCache", "syncInFlight"];

/// Summary of one migration run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationResult {
    /// False only if a step aborted the run.
    pub success: bool,
    pub version: u32,
    pub migrations_applied: Vec<String>,
    pub errors: Vec<String>,
}

/// Migrated data plus the run summary.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationOutcome {
    pub data: Value,
    pub result: MigrationResult,
}

type StepFn = fn(&mut Map<String, Value>) -> Result<(), String>;

/// One upgrade step from `from` to `from + 1`.
#[derive(Clone, Copy)]
pub(crate) struct Migration {
    pub from: u32,
    pub name: &'static str,
    pub apply: StepFn,
    /// Best-effort fallback used when `apply` reports an error.
    pub defaults: fn(&mut Map<String, Value>),
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        from: 0,
        name: "v0->v1: cloud sync tracking",
        apply: add_cloud_sync_tracking,
        defaults: cloud_sync_defaults,
    },
    Migration {
        from: 1,
        name: "v1->v2: session persistence",
        apply: add_session_persistence,
        defaults: session_persistence_defaults,
    },
];

fn add_cloud_sync_tracking(state: &mut Map<String, Value>) -> Result<(), String> {
    cloud_sync_defaults(state);
    Ok(())
}

fn cloud_sync_defaults(state: &mut Map<String, Value>) {
    state.entry("lastSyncedAt").or_insert(Value::Null);
    state.entry("pendingSyncCount").or_insert(json!(0));
}

fn add_session_persistence(state: &mut Map<String, Value>) -> Result<(), String> {
    state.entry("sessionHistory").or_insert_with(|| json!([]));
    state.entry("activeSession").or_insert(Value::Null);
    match state.entry("settings").or_insert_with(|| json!({})) {
        Value::Object(settings) => {
            settings.entry("resumeSessions").or_insert(json!(true));
            Ok(())
        }
        other => Err(format!("`settings` is {}, not an object", value_kind(other))),
    }
}

fn session_persistence_defaults(state: &mut Map<String, Value>) {
    state.entry("sessionHistory").or_insert_with(|| json!([]));
    state.entry("activeSession").or_insert(Value::Null);
    if !state.get("settings").is_some_and(Value::is_object) {
        state.insert("settings".to_string(), json!({ "resumeSessions": true }));
    }
}

/// Stored schema version: `state.schemaVersion`, then the envelope `version`, else 0.
pub fn detect_version(raw: &Value) -> u32 {
    raw.get("state")
        .and_then(|s| s.get("schemaVersion"))
        .and_then(Value::as_u64)
        .or_else(|| raw.get("version").and_then(Value::as_u64))
        .map_or(0, |v| u32::try_from(v).unwrap_or(u32::MAX))
}

/// Remove deprecated top-level `state` fields, returning their names.
pub fn strip_deprecated(raw: &mut Value) -> Vec<String> {
    let Some(state) = raw.get_mut("state").and_then(Value::as_object_mut) else {
        return Vec::new();
    };
    DEPRECATED_FIELDS
        .iter()
        .filter(|field| state.remove(**field).is_some())
        .map(|field| field.to_string())
        .collect()
}

/// Upgrade `raw` to [`CURRENT_SCHEMA_VERSION`]. Never panics or fails; anomalies
/// are listed in `result.errors`.
pub fn migrate(raw: Value, from_version: Option<u32>) -> MigrationOutcome {
    migrate_with(MIGRATIONS, raw, from_version)
}

pub(crate) fn migrate_with(
    steps: &[Migration],
    raw: Value,
    from_version: Option<u32>,
) -> MigrationOutcome {
    let mut errors = Vec::new();
    let from = from_version.unwrap_or_else(|| detect_version(&raw));

    let mut root = match raw {
        Value::Object(map) => map,
        other => {
            errors.push(format!(
                "persisted data is {}, not an object; starting from defaults",
                value_kind(&other)
            ));
            Map::new()
        }
    };

    match root.get("state") {
        Some(Value::Object(_)) => {}
        None => {
            errors.push("missing `state`; starting from defaults".to_string());
            root.insert("state".to_string(), json!({}));
        }
        Some(other) => {
            errors.push(format!(
                "`state` is {}, not an object; starting from defaults",
                value_kind(other)
            ));
            root.insert("state".to_string(), json!({}));
        }
    }

    let mut version = from;
    let mut applied = Vec::new();
    let mut success = true;

    let mut pending: Vec<&Migration> = steps
        .iter()
        .filter(|m| m.from >= from && m.from < CURRENT_SCHEMA_VERSION)
        .collect();
    pending.sort_by_key(|m| m.from);

    for step in pending {
        let Some(state) = root.get_mut("state").and_then(Value::as_object_mut) else {
            break;
        };
        match panic::catch_unwind(AssertUnwindSafe(|| (step.apply)(state))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                errors.push(format!("{}: {e}; applied defaults", step.name));
                (step.defaults)(state);
            }
            Err(_) => {
                errors.push(format!("{}: step aborted", step.name));
                success = false;
                break;
            }
        }
        applied.push(step.name.to_string());
        version = step.from + 1;
    }

    stamp_version(&mut root, version);

    MigrationOutcome {
        data: Value::Object(root),
        result: MigrationResult {
            success,
            version,
            migrations_applied: applied,
            errors,
        },
    }
}

fn stamp_version(root: &mut Map<String, Value>, version: u32) {
    if let Some(state) = root.get_mut("state").and_then(Value::as_object_mut) {
        state.insert("schemaVersion".to_string(), json!(version));
    }
    root.insert("version".to_string(), json!(version));
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn v0_snapshot() -> Value {
        json!({
            "state": {
                "stats": {"xp": 120, "streak": 3},
                "progress": {"logos": {"easeFactor": 2.2, "interval": 4}},
                "settings": {"soundEnabled": false},
                "customFlag": "kept"
            }
        })
    }

    #[test]
    fn upgrades_v0_to_current() {
        let outcome = migrate(v0_snapshot(), None);
        assert!(outcome.result.success);
        assert_eq!(outcome.result.version, CURRENT_SCHEMA_VERSION);
        assert_eq!(outcome.result.migrations_applied.len(), 2);
        assert!(outcome.result.errors.is_empty());

        let state = &outcome.data["state"];
        assert_eq!(state["lastSyncedAt"], Value::Null);
        assert_eq!(state["pendingSyncCount"], json!(0));
        assert_eq!(state["sessionHistory"], json!([]));
        assert_eq!(state["settings"]["resumeSessions"], json!(true));
        assert_eq!(state["schemaVersion"], json!(2));
        assert_eq!(outcome.data["version"], json!(2));
    }

    #[test]
    fn existing_fields_are_preserved() {
        let before = v0_snapshot();
        let after = migrate(before.clone(), None).data;
        for (key, value) in before["state"].as_object().unwrap() {
            if key == "settings" {
                assert_eq!(after["state"]["settings"]["soundEnabled"], json!(false));
            } else {
                assert_eq!(&after["state"][key], value, "field {key} changed");
            }
        }
    }

    #[test]
    fn steps_do_not_overwrite_values() {
        let raw = json!({"state": {"pendingSyncCount": 7, "sessionHistory": [{"id": "s1"}]}, "version": 0});
        let data = migrate(raw, None).data;
        assert_eq!(data["state"]["pendingSyncCount"], json!(7));
        assert_eq!(data["state"]["sessionHistory"], json!([{"id": "s1"}]));
    }

    #[test]
    fn migration_is_idempotent() {
        for raw in [v0_snapshot(), json!(5), json!({"state": "x"}), json!({"state": {"settings": 3}})] {
            let once = migrate(raw, None);
            let twice = migrate(once.data.clone(), None);
            assert_eq!(once.data, twice.data);
            assert!(twice.result.migrations_applied.is_empty());
        }
    }

    #[test]
    fn current_data_is_untouched() {
        let raw = json!({"state": {"schemaVersion": 2, "stats": {}}, "version": 2});
        let outcome = migrate(raw.clone(), None);
        assert_eq!(outcome.data, raw);
        assert!(outcome.result.migrations_applied.is_empty());
    }

    #[test]
    fn newer_versions_are_not_downgraded() {
        let raw = json!({"state": {"schemaVersion": 9}, "version": 9});
        let outcome = migrate(raw.clone(), None);
        assert_eq!(outcome.result.version, 9);
        assert_eq!(outcome.data, raw);
    }

    #[test]
    fn explicit_from_version_wins() {
        let outcome = migrate(json!({"state": {}}), Some(1));
        assert_eq!(outcome.result.migrations_applied, vec!["v1->v2: session persistence"]);
        assert!(outcome.data["state"].get("pendingSyncCount").is_none());
    }

    #[test]
    fn primitive_state_gets_structural_defaults() {
        let outcome = migrate(json!({"state": 42, "version": 0}), None);
        assert!(outcome.result.success);
        assert_eq!(outcome.result.errors.len(), 1);
        assert!(outcome.data["state"].is_object());
        assert_eq!(outcome.result.version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn failing_step_falls_back_to_defaults() {
        let outcome = migrate(json!({"state": {"settings": "broken"}, "version": 1}), None);
        assert!(outcome.result.success);
        assert_eq!(outcome.result.errors.len(), 1);
        assert_eq!(outcome.data["state"]["settings"], json!({"resumeSessions": true}));
        assert_eq!(outcome.result.version, 2);
    }

    #[test]
    fn aborted_step_marks_failure_but_returns_data() {
        fn explode(_: &mut Map<String, Value>) -> Result<(), String> {
            panic!("boom")
        }
        let steps = [
            Migration {
                from: 0,
                name: "ok",
                apply: add_cloud_sync_tracking,
                defaults: cloud_sync_defaults,
            },
            Migration {
                from: 1,
                name: "explode",
                apply: explode,
                defaults: |_| {},
            },
        ];
        let outcome = migrate_with(&steps, json!({"state": {}}), None);
        assert!(!outcome.result.success);
        assert_eq!(outcome.result.version, 1);
        assert_eq!(outcome.data["state"]["pendingSyncCount"], json!(0));
    }

    #[test]
    fn strips_deprecated_fields() {
        let mut raw = json!({"state": {"reviewQueue": [], "stats": {}}});
        assert_eq!(strip_deprecated(&mut raw), vec!["reviewQueue"]);
        assert!(raw["state"].get("reviewQueue").is_none());
    }
}
