//! SQLite schema definitions.

/// Single table of whole-value entries. Each writer owns its keys and always
/// replaces the full value.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;
