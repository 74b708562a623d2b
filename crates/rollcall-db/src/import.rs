//! Bulk roster import from registration-form CSV exports.
//!
//! The export headers are free text ("CU - I'D", "CONTACT NO.", ...). Each
//! header is matched against known aliases after trimming and lowercasing.
//! Rows are upserted by id. Rows without an id or name, and rows the
//! database rejects, are reported and skipped without stopping the import.

use crate::db::{AttendanceDb, DbError};
use rollcall_core::Student;
use std::io::Read;

pub const DEFAULT_PROGRAM: &str = "B.Tech";
pub const DEFAULT_BRANCH: &str = "CSE";

const ID_ALIASES: &[&str] = &["cu - i'd", "cu - id", "id", "student_id", "student id"];
const NAME_ALIASES: &[&str] = &["name", "student name"];
const MOBILE_ALIASES: &[&str] = &["contact no.", "contact no", "mobile", "phone"];
const EMAIL_ALIASES: &[&str] = &["email address", "email", "gmail"];
const PROGRAM_ALIASES: &[&str] = &["program", "programme"];
const BRANCH_ALIASES: &[&str] = &["branch", "department"];

/// Values applied to rows whose CSV has no program/branch column, or an
/// empty cell.
#[derive(Debug, Clone)]
pub struct ImportDefaults {
    pub program: String,
    pub branch: String,
}

impl Default for ImportDefaults {
    fn default() -> Self {
        Self {
            program: DEFAULT_PROGRAM.to_string(),
            branch: DEFAULT_BRANCH.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub imported: usize,
    /// `(line, reason)` for every skipped row. Lines are 1-based and count
    /// the header.
    pub skipped: Vec<(u64, String)>,
}

struct Columns {
    id: usize,
    name: usize,
    mobile: Option<usize>,
    email: Option<usize>,
    program: Option<usize>,
    branch: Option<usize>,
}

impl Columns {
    fn resolve(headers: &csv::StringRecord) -> Result<Self, DbError> {
        let find = |aliases: &[&str]| {
            headers
                .iter()
                .position(|h| aliases.contains(&h.trim().to_lowercase().as_str()))
        };
        Ok(Self {
            id: find(ID_ALIASES).ok_or(DbError::MissingColumn("id"))?,
            name: find(NAME_ALIASES).ok_or(DbError::MissingColumn("name"))?,
            mobile: find(MOBILE_ALIASES),
            email: find(EMAIL_ALIASES),
            program: find(PROGRAM_ALIASES),
            branch: find(BRANCH_ALIASES),
        })
    }
}

fn cell(record: &csv::StringRecord, idx: Option<usize>) -> &str {
    idx.and_then(|i| record.get(i)).unwrap_or("").trim()
}

fn or_default(value: &str, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}

/// Read a roster CSV and upsert every valid row into `db`.
pub fn import_roster<R: Read>(
    db: &AttendanceDb,
    reader: R,
    defaults: &ImportDefaults,
) -> Result<ImportReport, DbError> {
    let mut csv = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);
    let columns = Columns::resolve(csv.headers()?)?;

    let mut report = ImportReport::default();
    for record in csv.records() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                let line = e.position().map(|p| p.line()).unwrap_or(0);
                tracing::warn!(line, error = %e, "unreadable roster row");
                report.skipped.push((line, e.to_string()));
                continue;
            }
        };
        let line = record.position().map(|p| p.line()).unwrap_or(0);

        let id = cell(&record, Some(columns.id));
        let name = cell(&record, Some(columns.name));
        if id.is_empty() || name.is_empty() {
            report.skipped.push((line, "missing id or name".to_string()));
            continue;
        }

        let student = Student {
            id: id.to_string(),
            name: name.to_string(),
            program: or_default(cell(&record, columns.program), &defaults.program),
            branch: or_default(cell(&record, columns.branch), &defaults.branch),
            mobile: cell(&record, columns.mobile).to_string(),
            email: cell(&record, columns.email).to_string(),
        };
        match db.upsert_student(&student) {
            Ok(()) => report.imported += 1,
            Err(e) => {
                tracing::warn!(line, id = %student.id, error = %e, "roster row rejected");
                report.skipped.push((line, e.to_string()));
            }
        }
    }

    tracing::info!(
        imported = report.imported,
        skipped = report.skipped.len(),
        "roster import finished"
    );
    Ok(report)
}
