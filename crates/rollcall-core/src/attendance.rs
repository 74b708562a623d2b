//! Attendance recording: turns a best match into an append-only attendance event.
//!
//! Per detected face:
//!
//! ```text
//! score < threshold ─────────────────────────────► Unknown        (no write)
//! accepted, no roster entry ─────────────────────► Not Found      (no write)
//! accepted, no previous event ───────────────────► Present        (append)
//! accepted, last event < interval ago ───────────► Already Marked (no write)
//! accepted, last event ≥ interval ago ───────────► Re-Marked      (append)
//! ```

use crate::matcher::BestMatch;
use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use thiserror::Error;

/// Timestamp layout used in attendance rows and the SQLite log.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Default minimum cosine similarity for accepting a match.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.5;

/// Default minimum gap between two recorded events for one student.
pub const DEFAULT_REATTENDANCE_MINUTES: i64 = 2;

#[derive(Error, Debug)]
pub enum RosterError {
    #[error("duplicate identity: {0}")]
    DuplicateIdentity(String),
    #[error("roster backend error: {0}")]
    Backend(String),
}

#[derive(Error, Debug)]
pub enum LogError {
    #[error("attendance log backend error: {0}")]
    Backend(String),
}

#[derive(Error, Debug)]
pub enum RecordError {
    #[error(transparent)]
    Roster(#[from] RosterError),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error("attendance recorder lock poisoned")]
    Poisoned,
}

#[derive(Error, Debug)]
#[error("unknown attendance status: {0:?}")]
pub struct ParseStatusError(String);

/// Attendance outcome for one detected face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttendanceStatus {
    Present,
    #[serde(rename = "Re-Marked")]
    ReMarked,
    #[serde(rename = "Already Marked")]
    AlreadyMarked,
    Unknown,
    #[serde(rename = "Not Found")]
    NotFound,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "Present",
            AttendanceStatus::ReMarked => "Re-Marked",
            AttendanceStatus::AlreadyMarked => "Already Marked",
            AttendanceStatus::Unknown => "Unknown",
            AttendanceStatus::NotFound => "Not Found",
        }
    }

    /// Whether this status corresponds to a newly appended log row.
    pub fn is_new_record(&self) -> bool {
        matches!(self, AttendanceStatus::Present | AttendanceStatus::ReMarked)
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttendanceStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Present" => Ok(AttendanceStatus::Present),
            "Re-Marked" => Ok(AttendanceStatus::ReMarked),
            "Already Marked" => Ok(AttendanceStatus::AlreadyMarked),
            "Unknown" => Ok(AttendanceStatus::Unknown),
            "Not Found" => Ok(AttendanceStatus::NotFound),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// Serde adapter rendering `NaiveDateTime` as [`TIMESTAMP_FORMAT`].
pub mod timestamp {
    use super::TIMESTAMP_FORMAT;
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &NaiveDateTime, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&ts.format(TIMESTAMP_FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveDateTime::parse_from_str(&raw, TIMESTAMP_FORMAT).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::TIMESTAMP_FORMAT;
        use chrono::NaiveDateTime;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            ts: &Option<NaiveDateTime>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            match ts {
                Some(ts) => s.collect_str(&ts.format(TIMESTAMP_FORMAT)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<NaiveDateTime>, D::Error> {
            Option::<String>::deserialize(d)?
                .map(|raw| {
                    NaiveDateTime::parse_from_str(&raw, TIMESTAMP_FORMAT)
                        .map_err(serde::de::Error::custom)
                })
                .transpose()
        }
    }
}

/// Roster entry for an attendance-eligible student.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Student {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub program: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub mobile: String,
    #[serde(default)]
    pub email: String,
}

/// Lecture and section a batch of photos belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LectureContext {
    pub lecture: String,
    pub section: String,
}

/// One append-only attendance log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceEvent {
    pub student_id: String,
    pub status: AttendanceStatus,
    pub timestamp: NaiveDateTime,
    pub lecture: String,
    pub section: String,
}

/// Denormalized report row handed to report/email consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRow {
    pub id: String,
    pub name: String,
    pub program: String,
    pub branch: String,
    pub mobile: String,
    pub status: AttendanceStatus,
    #[serde(with = "timestamp")]
    pub timestamp: NaiveDateTime,
    pub lecture: String,
    pub section: String,
}

impl AttendanceRow {
    pub fn new(student: &Student, event: &AttendanceEvent) -> Self {
        Self {
            id: student.id.clone(),
            name: student.name.clone(),
            program: student.program.clone(),
            branch: student.branch.clone(),
            mobile: student.mobile.clone(),
            status: event.status,
            timestamp: event.timestamp,
            lecture: event.lecture.clone(),
            section: event.section.clone(),
        }
    }
}

/// Student metadata owned outside the embedding store.
pub trait StudentRoster {
    fn lookup_by_name(&self, name: &str) -> Result<Option<Student>, RosterError>;
    fn lookup_by_id(&self, id: &str) -> Result<Option<Student>, RosterError>;
    /// Add a student, failing with `DuplicateIdentity` if the id or the
    /// (case-insensitive) name is already taken.
    fn insert(&self, student: &Student) -> Result<(), RosterError>;
    /// Remove a student by id. Only used to undo a failed enrollment.
    fn remove(&self, id: &str) -> Result<bool, RosterError>;
}

/// Append-only attendance history.
pub trait AttendanceLog {
    /// Most recent event for `student_id`, by timestamp.
    fn latest_for(&self, student_id: &str) -> Result<Option<AttendanceEvent>, LogError>;
    fn append(&self, student: &Student, event: &AttendanceEvent) -> Result<(), LogError>;
    /// Every recorded row, oldest first.
    fn rows(&self) -> Result<Vec<AttendanceRow>, LogError>;
}

/// What to do with an accepted, rostered match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Append a new event with this status (`Present` or `Re-Marked`).
    Append(AttendanceStatus),
    /// Suppress: an event was recorded at this time, inside the interval.
    AlreadyMarked(NaiveDateTime),
}

/// Decide between a fresh event, a re-attendance and a duplicate.
pub fn decide(last: Option<&AttendanceEvent>, now: NaiveDateTime, interval: Duration) -> Decision {
    match last {
        None => Decision::Append(AttendanceStatus::Present),
        Some(last) if now - last.timestamp < interval => Decision::AlreadyMarked(last.timestamp),
        Some(_) => Decision::Append(AttendanceStatus::ReMarked),
    }
}

/// Recorder settings.
#[derive(Debug, Clone, Copy)]
pub struct RecorderConfig {
    pub match_threshold: f32,
    pub reattendance_interval: Duration,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            reattendance_interval: Duration::minutes(DEFAULT_REATTENDANCE_MINUTES),
        }
    }
}

/// Result of recording one face.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordOutcome {
    pub status: AttendanceStatus,
    /// Resolved roster entry, if the match was accepted and rostered.
    pub student: Option<Student>,
    /// New event time for `Present`/`Re-Marked`, previous event time for `Already Marked`.
    pub timestamp: Option<NaiveDateTime>,
    /// The row written to the log, if any.
    pub row: Option<AttendanceRow>,
}

impl RecordOutcome {
    fn unwritten(status: AttendanceStatus) -> Self {
        Self {
            status,
            student: None,
            timestamp: None,
            row: None,
        }
    }
}

/// Applies the threshold and re-attendance rules, appending to the log.
pub struct AttendanceRecorder {
    config: RecorderConfig,
    /// Serializes read-latest / append so the latest read is never stale.
    append_lock: Mutex<()>,
}

impl AttendanceRecorder {
    pub fn new(config: RecorderConfig) -> Self {
        Self {
            config,
            append_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn record<R, L>(
        &self,
        roster: &R,
        log: &L,
        best: &BestMatch,
        now: NaiveDateTime,
        context: &LectureContext,
    ) -> Result<RecordOutcome, RecordError>
    where
        R: StudentRoster + ?Sized,
        L: AttendanceLog + ?Sized,
    {
        let Some(name) = best.accepted(self.config.match_threshold) else {
            return Ok(RecordOutcome::unwritten(AttendanceStatus::Unknown));
        };

        let Some(student) = roster.lookup_by_name(name)? else {
            tracing::warn!(name, score = best.score, "matched identity has no roster entry");
            return Ok(RecordOutcome::unwritten(AttendanceStatus::NotFound));
        };

        let _guard = self.append_lock.lock().map_err(|_| RecordError::Poisoned)?;

        let last = log.latest_for(&student.id)?;
        match decide(last.as_ref(), now, self.config.reattendance_interval) {
            Decision::AlreadyMarked(at) => {
                tracing::debug!(student_id = %student.id, last = %at, "already marked inside interval");
                Ok(RecordOutcome {
                    status: AttendanceStatus::AlreadyMarked,
                    student: Some(student),
                    timestamp: Some(at),
                    row: None,
                })
            }
            Decision::Append(status) => {
                let event = AttendanceEvent {
                    student_id: student.id.clone(),
                    status,
                    timestamp: now,
                    lecture: context.lecture.clone(),
                    section: context.section.clone(),
                };
                log.append(&student, &event)?;
                tracing::info!(
                    student_id = %student.id,
                    status = %status,
                    score = best.score,
                    "attendance recorded"
                );

                let row = AttendanceRow::new(&student, &event);
                Ok(RecordOutcome {
                    status,
                    student: Some(student),
                    timestamp: Some(now),
                    row: Some(row),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{at, MemoryLog, MemoryRoster};

    fn bob() -> Student {
        Student {
            id: "7".into(),
            name: "Bob".into(),
            program: "B.Tech".into(),
            branch: "CSE".into(),
            mobile: "555".into(),
            email: "bob@example.com".into(),
        }
    }

    fn matched(name: &str, score: f32) -> BestMatch {
        BestMatch {
            name: Some(name.into()),
            score,
        }
    }

    fn ctx() -> LectureContext {
        LectureContext {
            lecture: "Math".into(),
            section: "A".into(),
        }
    }

    #[test]
    fn test_status_strings() {
        for status in [
            AttendanceStatus::Present,
            AttendanceStatus::ReMarked,
            AttendanceStatus::AlreadyMarked,
            AttendanceStatus::Unknown,
            AttendanceStatus::NotFound,
        ] {
            assert_eq!(status.as_str().parse::<AttendanceStatus>().unwrap(), status);
            assert_eq!(
                serde_json::to_string(&status).unwrap(),
                format!("\"{}\"", status.as_str())
            );
        }
        assert!("present".parse::<AttendanceStatus>().is_err());
    }

    #[test]
    fn test_decide_boundaries() {
        let interval = Duration::minutes(2);
        let last = AttendanceEvent {
            student_id: "7".into(),
            status: AttendanceStatus::Present,
            timestamp: at("10:00:00"),
            lecture: String::new(),
            section: String::new(),
        };

        assert_eq!(
            decide(None, at("10:00:00"), interval),
            Decision::Append(AttendanceStatus::Present)
        );
        assert_eq!(
            decide(Some(&last), at("10:01:59"), interval),
            Decision::AlreadyMarked(at("10:00:00"))
        );
        assert_eq!(
            decide(Some(&last), at("10:02:00"), interval),
            Decision::Append(AttendanceStatus::ReMarked)
        );
        // Clock went backwards: treat as a duplicate
        assert_eq!(
            decide(Some(&last), at("09:59:00"), interval),
            Decision::AlreadyMarked(at("10:00:00"))
        );
    }

    #[test]
    fn test_below_threshold_is_unknown() {
        let roster = MemoryRoster::with(vec![bob()]);
        let log = MemoryLog::default();
        let recorder = AttendanceRecorder::new(RecorderConfig::default());

        let out = recorder
            .record(&roster, &log, &matched("Bob", 0.49), at("10:00:00"), &ctx())
            .unwrap();
        assert_eq!(out.status, AttendanceStatus::Unknown);
        assert!(log.events().is_empty());
    }

    #[test]
    fn test_empty_store_match_is_unknown() {
        let roster = MemoryRoster::default();
        let log = MemoryLog::default();
        let recorder = AttendanceRecorder::new(RecorderConfig::default());

        let out = recorder
            .record(&roster, &log, &BestMatch::none(), at("10:00:00"), &ctx())
            .unwrap();
        assert_eq!(out.status, AttendanceStatus::Unknown);
        assert_eq!(out.timestamp, None);
    }

    #[test]
    fn test_unrostered_match_is_not_found() {
        let roster = MemoryRoster::default();
        let log = MemoryLog::default();
        let recorder = AttendanceRecorder::new(RecorderConfig::default());

        let out = recorder
            .record(&roster, &log, &matched("Ghost", 0.9), at("10:00:00"), &ctx())
            .unwrap();
        assert_eq!(out.status, AttendanceStatus::NotFound);
        assert!(log.events().is_empty());
    }

    #[test]
    fn test_bob_scenario() {
        let roster = MemoryRoster::with(vec![bob()]);
        let log = MemoryLog::default();
        let recorder = AttendanceRecorder::new(RecorderConfig::default());
        let bob_match = matched("Bob", 0.93);

        let first = recorder
            .record(&roster, &log, &bob_match, at("10:00:00"), &ctx())
            .unwrap();
        assert_eq!(first.status, AttendanceStatus::Present);
        assert_eq!(first.row.as_ref().unwrap().id, "7");
        assert_eq!(first.row.as_ref().unwrap().lecture, "Math");

        let second = recorder
            .record(&roster, &log, &bob_match, at("10:01:00"), &ctx())
            .unwrap();
        assert_eq!(second.status, AttendanceStatus::AlreadyMarked);
        assert_eq!(second.timestamp, Some(at("10:00:00")));
        assert!(second.row.is_none());
        assert_eq!(log.events().len(), 1);

        let third = recorder
            .record(&roster, &log, &bob_match, at("10:03:00"), &ctx())
            .unwrap();
        assert_eq!(third.status, AttendanceStatus::ReMarked);
        assert_eq!(third.timestamp, Some(at("10:03:00")));

        let events = log.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].status, AttendanceStatus::ReMarked);
    }

    #[test]
    fn test_written_events_respect_interval() {
        let roster = MemoryRoster::with(vec![bob()]);
        let log = MemoryLog::default();
        let recorder = AttendanceRecorder::new(RecorderConfig::default());
        let bob_match = matched("Bob", 0.8);

        // One scan every 30 seconds for ten minutes
        let start = at("10:00:00");
        for i in 0..20 {
            let now = start + Duration::seconds(30 * i);
            recorder.record(&roster, &log, &bob_match, now, &ctx()).unwrap();
        }

        let events = log.events();
        assert!(events.len() > 1);
        for pair in events.windows(2) {
            assert!(pair[1].timestamp - pair[0].timestamp >= Duration::minutes(2));
        }
    }

    #[test]
    fn test_custom_threshold_and_interval() {
        let roster = MemoryRoster::with(vec![bob()]);
        let log = MemoryLog::default();
        let recorder = AttendanceRecorder::new(RecorderConfig {
            match_threshold: 0.9,
            reattendance_interval: Duration::seconds(10),
        });

        let weak = recorder
            .record(&roster, &log, &matched("Bob", 0.85), at("10:00:00"), &ctx())
            .unwrap();
        assert_eq!(weak.status, AttendanceStatus::Unknown);

        recorder
            .record(&roster, &log, &matched("Bob", 0.95), at("10:00:00"), &ctx())
            .unwrap();
        let later = recorder
            .record(&roster, &log, &matched("Bob", 0.95), at("10:00:10"), &ctx())
            .unwrap();
        assert_eq!(later.status, AttendanceStatus::ReMarked);
    }

    #[test]
    fn test_row_serializes_timestamp_format() {
        let event = AttendanceEvent {
            student_id: "7".into(),
            status: AttendanceStatus::ReMarked,
            timestamp: at("10:03:00"),
            lecture: "Math".into(),
            section: "A".into(),
        };
        let row = AttendanceRow::new(&bob(), &event);
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["timestamp"], "2025-03-14 10:03:00");
        assert_eq!(json["status"], "Re-Marked");

        let back: AttendanceRow = serde_json::from_value(json).unwrap();
        assert_eq!(back, row);
    }
}
