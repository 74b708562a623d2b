//! In-memory collaborators for unit tests.

use crate::attendance::{
    AttendanceEvent, AttendanceLog, AttendanceRow, LogError, RosterError, Student, StudentRoster,
};
use crate::session::{DetectorError, FaceDetector};
use crate::types::{BoundingBox, Detection};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use image::RgbImage;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::Cursor;

/// `HH:MM:SS` on a fixed test day.
pub fn at(time: &str) -> NaiveDateTime {
    let date = NaiveDate::from_ymd_opt(2025, 3, 14).unwrap();
    let time = NaiveTime::parse_from_str(time, "%H:%M:%S").unwrap();
    NaiveDateTime::new(date, time)
}

/// Small solid-color PNG.
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, image::Rgb([90, 120, 150]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png).unwrap();
    out.into_inner()
}

pub fn detection(x: f32, y: f32, size: f32, embedding: &[f32]) -> Detection {
    Detection {
        bbox: BoundingBox {
            x,
            y,
            width: size,
            height: size,
            confidence: 0.9,
            landmarks: None,
        },
        embedding: embedding.to_vec(),
    }
}

#[derive(Default)]
pub struct MemoryRoster {
    students: RefCell<Vec<Student>>,
}

impl MemoryRoster {
    pub fn with(students: Vec<Student>) -> Self {
        Self {
            students: RefCell::new(students),
        }
    }

    pub fn students(&self) -> Vec<Student> {
        self.students.borrow().clone()
    }
}

impl StudentRoster for MemoryRoster {
    fn lookup_by_name(&self, name: &str) -> Result<Option<Student>, RosterError> {
        Ok(self.students.borrow().iter().find(|s| s.name == name).cloned())
    }

    fn lookup_by_id(&self, id: &str) -> Result<Option<Student>, RosterError> {
        Ok(self.students.borrow().iter().find(|s| s.id == id).cloned())
    }

    fn insert(&self, student: &Student) -> Result<(), RosterError> {
        let mut students = self.students.borrow_mut();
        let taken = students
            .iter()
            .any(|s| s.id == student.id || s.name.to_lowercase() == student.name.to_lowercase());
        if taken {
            return Err(RosterError::DuplicateIdentity(student.name.clone()));
        }
        students.push(student.clone());
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<bool, RosterError> {
        let mut students = self.students.borrow_mut();
        let before = students.len();
        students.retain(|s| s.id != id);
        Ok(students.len() != before)
    }
}

#[derive(Default)]
pub struct MemoryLog {
    entries: RefCell<Vec<(Student, AttendanceEvent)>>,
    pub fail_appends: bool,
}

impl MemoryLog {
    pub fn events(&self) -> Vec<AttendanceEvent> {
        self.entries.borrow().iter().map(|(_, e)| e.clone()).collect()
    }
}

impl AttendanceLog for MemoryLog {
    fn latest_for(&self, student_id: &str) -> Result<Option<AttendanceEvent>, LogError> {
        Ok(self
            .entries
            .borrow()
            .iter()
            .filter(|(_, e)| e.student_id == student_id)
            .max_by_key(|(_, e)| e.timestamp)
            .map(|(_, e)| e.clone()))
    }

    fn append(&self, student: &Student, event: &AttendanceEvent) -> Result<(), LogError> {
        if self.fail_appends {
            return Err(LogError::Backend("disk full".into()));
        }
        self.entries.borrow_mut().push((student.clone(), event.clone()));
        Ok(())
    }

    fn rows(&self) -> Result<Vec<AttendanceRow>, LogError> {
        Ok(self
            .entries
            .borrow()
            .iter()
            .map(|(s, e)| AttendanceRow::new(s, e))
            .collect())
    }
}

/// Detector returning queued detections, one list per call.
#[derive(Default)]
pub struct ScriptedDetector {
    pub responses: VecDeque<Result<Vec<Detection>, DetectorError>>,
    pub calls: usize,
}

impl ScriptedDetector {
    pub fn new(responses: Vec<Result<Vec<Detection>, DetectorError>>) -> Self {
        Self {
            responses: responses.into(),
            calls: 0,
        }
    }
}

impl FaceDetector for ScriptedDetector {
    fn detect(&mut self, _image: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
        self.calls += 1;
        self.responses.pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }
}
