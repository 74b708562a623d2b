//! SQLite-backed student roster and attendance log.
//!
//! One database file holds both tables. The attendance table is guarded by
//! triggers that abort any UPDATE or DELETE, so history is append-only even
//! for writers that bypass this crate.

use chrono::NaiveDateTime;
use rollcall_core::attendance::TIMESTAMP_FORMAT;
use rollcall_core::{
    AttendanceEvent, AttendanceLog, AttendanceRow, AttendanceStatus, LogError, RosterError,
    Student, StudentRoster,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS students (
    id      TEXT PRIMARY KEY,
    name    TEXT NOT NULL,
    program TEXT NOT NULL DEFAULT '',
    branch  TEXT NOT NULL DEFAULT '',
    mobile  TEXT NOT NULL DEFAULT '',
    email   TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_students_name ON students (lower(name));

CREATE TABLE IF NOT EXISTS attendance (
    seq        INTEGER PRIMARY KEY AUTOINCREMENT,
    student_id TEXT NOT NULL,
    name       TEXT NOT NULL,
    program    TEXT NOT NULL DEFAULT '',
    branch     TEXT NOT NULL DEFAULT '',
    mobile     TEXT NOT NULL DEFAULT '',
    status     TEXT NOT NULL,
    timestamp  TEXT NOT NULL,
    lecture    TEXT NOT NULL DEFAULT '',
    section    TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_attendance_student_ts ON attendance (student_id, timestamp);

CREATE TRIGGER IF NOT EXISTS attendance_no_update BEFORE UPDATE ON attendance
BEGIN
    SELECT RAISE(ABORT, 'attendance log is append-only');
END;
CREATE TRIGGER IF NOT EXISTS attendance_no_delete BEFORE DELETE ON attendance
BEGIN
    SELECT RAISE(ABORT, 'attendance log is append-only');
END;
";

#[derive(Error, Debug)]
pub enum DbError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to create database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("roster CSV has no {0} column")]
    MissingColumn(&'static str),
    #[error("name {name} already belongs to student {existing_id}")]
    DuplicateName { name: String, existing_id: String },
}

/// Roster + attendance log over one SQLite connection.
pub struct AttendanceDb {
    conn: Connection,
}

impl std::fmt::Debug for AttendanceDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttendanceDb")
            .field("path", &self.conn.path())
            .finish_non_exhaustive()
    }
}

impl AttendanceDb {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        tracing::info!(path = %path.display(), "attendance database opened");
        Self::with_connection(conn)
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, DbError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Insert or overwrite a student by id.
    ///
    /// Names stay unique ignoring case: a name held by a different id is
    /// rejected with [`DbError::DuplicateName`].
    pub fn upsert_student(&self, student: &Student) -> Result<(), DbError> {
        let tx = self.conn.unchecked_transaction()?;
        let holder: Option<String> = tx
            .query_row(
                "SELECT id FROM students WHERE lower(name) = lower(?1) AND id != ?2
                 ORDER BY id LIMIT 1",
                params![student.name, student.id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(existing_id) = holder {
            return Err(DbError::DuplicateName {
                name: student.name.clone(),
                existing_id,
            });
        }

        tx.execute(
            "INSERT OR REPLACE INTO students (id, name, program, branch, mobile, email)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                student.id,
                student.name,
                student.program,
                student.branch,
                student.mobile,
                student.email
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    /// All students, ordered by id.
    pub fn students(&self) -> Result<Vec<Student>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, program, branch, mobile, email FROM students ORDER BY id",
        )?;
        let students = stmt
            .query_map([], student_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(students)
    }

    fn find_student(&self, clause: &str, value: &str) -> rusqlite::Result<Option<Student>> {
        let sql = format!(
            "SELECT id, name, program, branch, mobile, email FROM students WHERE {clause} ORDER BY id LIMIT 1"
        );
        self.conn
            .query_row(&sql, params![value], student_from_row)
            .optional()
    }

    fn latest_event(&self, student_id: &str) -> rusqlite::Result<Option<AttendanceEvent>> {
        self.conn
            .query_row(
                "SELECT student_id, status, timestamp, lecture, section FROM attendance
                 WHERE student_id = ?1
                 ORDER BY timestamp DESC, seq DESC LIMIT 1",
                params![student_id],
                |row| {
                    Ok(AttendanceEvent {
                        student_id: row.get(0)?,
                        status: status_column(row, 1)?,
                        timestamp: timestamp_column(row, 2)?,
                        lecture: row.get(3)?,
                        section: row.get(4)?,
                    })
                },
            )
            .optional()
    }

    fn all_rows(&self) -> rusqlite::Result<Vec<AttendanceRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT student_id, name, program, branch, mobile, status, timestamp, lecture, section
             FROM attendance ORDER BY seq",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(AttendanceRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    program: row.get(2)?,
                    branch: row.get(3)?,
                    mobile: row.get(4)?,
                    status: status_column(row, 5)?,
                    timestamp: timestamp_column(row, 6)?,
                    lecture: row.get(7)?,
                    section: row.get(8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn student_from_row(row: &Row<'_>) -> rusqlite::Result<Student> {
    Ok(Student {
        id: row.get(0)?,
        name: row.get(1)?,
        program: row.get(2)?,
        branch: row.get(3)?,
        mobile: row.get(4)?,
        email: row.get(5)?,
    })
}

fn status_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<AttendanceStatus> {
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDateTime> {
    let raw: String = row.get(idx)?;
    NaiveDateTime::parse_from_str(&raw, TIMESTAMP_FORMAT)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn roster_err(e: rusqlite::Error) -> RosterError {
    RosterError::Backend(e.to_string())
}

fn log_err(e: rusqlite::Error) -> LogError {
    LogError::Backend(e.to_string())
}

impl StudentRoster for AttendanceDb {
    fn lookup_by_name(&self, name: &str) -> Result<Option<Student>, RosterError> {
        self.find_student("name = ?1", name).map_err(roster_err)
    }

    fn lookup_by_id(&self, id: &str) -> Result<Option<Student>, RosterError> {
        self.find_student("id = ?1", id).map_err(roster_err)
    }

    fn insert(&self, student: &Student) -> Result<(), RosterError> {
        let tx = self.conn.unchecked_transaction().map_err(roster_err)?;
        let taken: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM students WHERE id = ?1 OR lower(name) = lower(?2))",
                params![student.id, student.name],
                |row| row.get(0),
            )
            .map_err(roster_err)?;
        if taken {
            return Err(RosterError::DuplicateIdentity(format!(
                "{} ({})",
                student.name, student.id
            )));
        }

        tx.execute(
            "INSERT INTO students (id, name, program, branch, mobile, email)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                student.id,
                student.name,
                student.program,
                student.branch,
                student.mobile,
                student.email
            ],
        )
        .map_err(roster_err)?;
        tx.commit().map_err(roster_err)
    }

    fn remove(&self, id: &str) -> Result<bool, RosterError> {
        let removed = self
            .conn
            .execute("DELETE FROM students WHERE id = ?1", params![id])
            .map_err(roster_err)?;
        Ok(removed > 0)
    }
}

impl AttendanceLog for AttendanceDb {
    fn latest_for(&self, student_id: &str) -> Result<Option<AttendanceEvent>, LogError> {
        self.latest_event(student_id).map_err(log_err)
    }

    fn append(&self, student: &Student, event: &AttendanceEvent) -> Result<(), LogError> {
        let timestamp = event.timestamp.format(TIMESTAMP_FORMAT).to_string();
        self.conn
            .execute(
                "INSERT INTO attendance
                 (student_id, name, program, branch, mobile, status, timestamp, lecture, section)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    event.student_id,
                    student.name,
                    student.program,
                    student.branch,
                    student.mobile,
                    event.status.as_str(),
                    timestamp,
                    event.lecture,
                    event.section
                ],
            )
            .map_err(log_err)?;
        Ok(())
    }

    fn rows(&self) -> Result<Vec<AttendanceRow>, LogError> {
        self.all_rows().map_err(log_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rollcall_core::matcher::BestMatch;
    use rollcall_core::{AttendanceRecorder, LectureContext, RecorderConfig};

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 14)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn student(id: &str, name: &str) -> Student {
        Student {
            id: id.into(),
            name: name.into(),
            program: "B.Tech".into(),
            branch: "CSE".into(),
            mobile: "999".into(),
            email: format!("{}@example.com", name.to_lowercase()),
        }
    }

    fn event(id: &str, status: AttendanceStatus, ts: NaiveDateTime) -> AttendanceEvent {
        AttendanceEvent {
            student_id: id.into(),
            status,
            timestamp: ts,
            lecture: "DBMS".into(),
            section: "C".into(),
        }
    }

    #[test]
    fn test_roster_lookup_and_duplicates() {
        let db = AttendanceDb::open_in_memory().unwrap();
        db.insert(&student("7", "Bob")).unwrap();

        assert_eq!(db.lookup_by_id("7").unwrap().unwrap().name, "Bob");
        assert_eq!(db.lookup_by_name("Bob").unwrap().unwrap().id, "7");
        assert!(db.lookup_by_name("bob").unwrap().is_none());

        let same_id = db.insert(&student("7", "Robert")).unwrap_err();
        assert!(matches!(same_id, RosterError::DuplicateIdentity(_)));
        let same_name = db.insert(&student("8", "BOB")).unwrap_err();
        assert!(matches!(same_name, RosterError::DuplicateIdentity(_)));

        assert!(db.remove("7").unwrap());
        assert!(!db.remove("7").unwrap());
        assert!(db.lookup_by_id("7").unwrap().is_none());
    }

    #[test]
    fn test_latest_for_orders_by_timestamp() {
        let db = AttendanceDb::open_in_memory().unwrap();
        let bob = student("7", "Bob");

        db.append(&bob, &event("7", AttendanceStatus::ReMarked, at(10, 5, 0))).unwrap();
        db.append(&bob, &event("7", AttendanceStatus::Present, at(10, 0, 0))).unwrap();
        db.append(&student("8", "Amy"), &event("8", AttendanceStatus::Present, at(11, 0, 0)))
            .unwrap();

        let latest = db.latest_for("7").unwrap().unwrap();
        assert_eq!(latest.timestamp, at(10, 5, 0));
        assert_eq!(latest.status, AttendanceStatus::ReMarked);
        assert!(db.latest_for("9").unwrap().is_none());
    }

    #[test]
    fn test_rows_are_denormalized_in_insert_order() {
        let db = AttendanceDb::open_in_memory().unwrap();
        let bob = student("7", "Bob");
        db.append(&bob, &event("7", AttendanceStatus::Present, at(9, 0, 0))).unwrap();
        db.append(&bob, &event("7", AttendanceStatus::ReMarked, at(9, 30, 0))).unwrap();

        let rows = db.rows().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "Bob");
        assert_eq!(rows[0].program, "B.Tech");
        assert_eq!(rows[0].mobile, "999");
        assert_eq!(rows[1].status, AttendanceStatus::ReMarked);
        assert_eq!(rows[1].lecture, "DBMS");
    }

    #[test]
    fn test_attendance_is_append_only() {
        let db = AttendanceDb::open_in_memory().unwrap();
        db.append(&student("7", "Bob"), &event("7", AttendanceStatus::Present, at(9, 0, 0)))
            .unwrap();

        assert!(db.conn.execute("UPDATE attendance SET status = 'Unknown'", []).is_err());
        assert!(db.conn.execute("DELETE FROM attendance", []).is_err());
        assert_eq!(db.rows().unwrap().len(), 1);
    }

    #[test]
    fn test_upsert_and_list_students() {
        let db = AttendanceDb::open_in_memory().unwrap();
        db.upsert_student(&student("2", "Zoe")).unwrap();
        db.upsert_student(&student("1", "Yan")).unwrap();
        let mut moved = student("2", "Zoe");
        moved.branch = "ECE".into();
        db.upsert_student(&moved).unwrap();

        let all = db.students().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, "1");
        assert_eq!(all[1].branch, "ECE");
    }

    #[test]
    fn test_upsert_rejects_name_held_by_another_id() {
        let db = AttendanceDb::open_in_memory().unwrap();
        db.upsert_student(&student("1", "Yan")).unwrap();

        let err = db.upsert_student(&student("2", "YAN")).unwrap_err();
        assert!(matches!(err, DbError::DuplicateName { ref existing_id, .. } if existing_id == "1"));
        assert_eq!(db.students().unwrap().len(), 1);
        assert_eq!(db.lookup_by_name("Yan").unwrap().unwrap().id, "1");
    }

    #[test]
    fn test_recorder_over_sqlite_bob_scenario() {
        let db = AttendanceDb::open_in_memory().unwrap();
        db.insert(&student("7", "Bob")).unwrap();
        let recorder = AttendanceRecorder::new(RecorderConfig::default());
        let best = BestMatch {
            name: Some("Bob".into()),
            score: 0.9,
        };
        let ctx = LectureContext::default();

        let statuses: Vec<_> = [at(10, 0, 0), at(10, 1, 0), at(10, 3, 0)]
            .into_iter()
            .map(|now| recorder.record(&db, &db, &best, now, &ctx).unwrap().status)
            .collect();

        assert_eq!(
            statuses,
            vec![
                AttendanceStatus::Present,
                AttendanceStatus::AlreadyMarked,
                AttendanceStatus::ReMarked
            ]
        );
        assert_eq!(db.rows().unwrap().len(), 2);
    }

    #[test]
    fn test_open_file_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("rollcall.db");
        {
            let db = AttendanceDb::open(&path).unwrap();
            db.insert(&student("7", "Bob")).unwrap();
        }
        let db = AttendanceDb::open(&path).unwrap();
        assert!(db.lookup_by_id("7").unwrap().is_some());
    }
}
