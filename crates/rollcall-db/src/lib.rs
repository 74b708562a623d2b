//! rollcall-db — SQLite persistence for the student roster and attendance log.

pub mod db;
pub mod import;

pub use db::{AttendanceDb, DbError};
pub use import::{import_roster, ImportDefaults, ImportReport};
