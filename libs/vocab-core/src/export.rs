//! Export file format.
//!
//! An export is the persisted envelope plus a little provenance. Importing is
//! recovery over the file contents, so the extra fields are simply ignored on
//! the way back in.

use crate::recovery::{recover, RecoveryResult};
use crate::types::Snapshot;
use chrono::{DateTime, Utc};
use serde::Serialize;

pub const EXPORT_APP_NAME: &str = "vocab-sync";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument<'a> {
    pub state: &'a Snapshot,
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    pub app: &'static str,
}

/// Serialize a snapshot as a pretty-printed export document.
pub fn export_snapshot(snapshot: &Snapshot, now: DateTime<Utc>) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&ExportDocument {
        state: snapshot,
        version: snapshot.schema_version,
        exported_at: now,
        app: EXPORT_APP_NAME,
    })
}

/// Read an export back through the recovery pipeline.
pub fn import_snapshot(text: &str, now: DateTime<Utc>) -> RecoveryResult {
    recover(text, now)
}
