//! Persisted records for backup plans, backups, rebuilds and imports.
//!
//! These map to SQLite tables via `sqlx::FromRow` and serialize as JSON via
//! `serde`. Status columns are raw integers on the rows; decode them through
//! the typed accessors, never by hand.

pub mod backup;
pub mod import;
pub mod plan;
pub mod rebuild;
pub mod status;
