use rollcall_core::{EnrollOutcome, LectureContext, SessionReport, Student};
use zbus::interface;

use crate::engine::{EngineError, EngineHandle};

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    engine: EngineHandle,
}

impl AttendanceService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

fn failed(e: EngineError) -> zbus::fdo::Error {
    tracing::warn!(error = %e, "request failed");
    zbus::fdo::Error::Failed(e.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn required_name(name: &str) -> zbus::fdo::Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(zbus::fdo::Error::InvalidArgs("name must not be empty".into()));
    }
    Ok(name.to_string())
}

fn enrolled_message(outcome: &EnrollOutcome) -> String {
    let action = if outcome.merged { "Updated" } else { "Enrolled" };
    format!(
        "{action} {} ({} face(s) in photo)",
        outcome.name, outcome.faces_detected
    )
}

/// Pull the annotated JPEGs out of `report`, one slot per input image.
///
/// Images without an annotation get an empty byte array so indices line up.
fn take_annotations(report: &mut SessionReport) -> Vec<Vec<u8>> {
    report
        .images
        .iter_mut()
        .map(|img| img.annotated.take().unwrap_or_default())
        .collect()
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Register a student (JSON object with id, name, program, branch,
    /// mobile, email) together with their first photo.
    async fn enroll_student(&self, student_json: &str, image: Vec<u8>) -> zbus::fdo::Result<String> {
        let student: Student = serde_json::from_str(student_json)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("student JSON: {e}")))?;
        tracing::info!(id = %student.id, name = %student.name, bytes = image.len(), "enroll requested");

        let outcome = self
            .engine
            .enroll_student(student, image)
            .await
            .map_err(failed)?;
        Ok(enrolled_message(&outcome))
    }

    /// Add another photo for an already enrolled student.
    async fn add_sample(&self, name: &str, image: Vec<u8>) -> zbus::fdo::Result<String> {
        let name = required_name(name)?;
        tracing::info!(%name, bytes = image.len(), "add_sample requested");
        let outcome = self.engine.add_sample(name, image).await.map_err(failed)?;
        Ok(enrolled_message(&outcome))
    }

    /// Store-only enrollment of several photos of one person, without a
    /// roster entry. The photos are averaged into one sample.
    ///
    /// Returns JSON with `name`, `merged`, `samples` and `skipped`
    /// (`[index, reason]` pairs).
    async fn encode_faces(&self, name: &str, images: Vec<Vec<u8>>) -> zbus::fdo::Result<String> {
        let name = required_name(name)?;
        tracing::info!(%name, images = images.len(), "encode_faces requested");
        let outcome = self.engine.encode_faces(name, images).await.map_err(failed)?;
        to_json(&outcome)
    }

    /// Re-read the embedding store from disk.
    async fn reload_store(&self) -> zbus::fdo::Result<String> {
        self.engine.reload_store().await.map_err(failed)
    }

    /// Mark attendance from a batch of classroom photos.
    ///
    /// Returns the session report as JSON and one annotated JPEG per input
    /// image (empty when annotation is off or the image was unreadable).
    async fn mark_attendance(
        &self,
        images: Vec<Vec<u8>>,
        lecture: &str,
        section: &str,
    ) -> zbus::fdo::Result<(String, Vec<Vec<u8>>)> {
        tracing::info!(images = images.len(), lecture, section, "mark_attendance requested");
        let context = LectureContext {
            lecture: lecture.trim().to_string(),
            section: section.trim().to_string(),
        };
        let mut report = self.engine.mark(images, context).await.map_err(failed)?;
        let annotated = take_annotations(&mut report);
        Ok((to_json(&report)?, annotated))
    }

    /// Every attendance row recorded so far, oldest first.
    async fn attendance_rows(&self) -> zbus::fdo::Result<String> {
        let rows = self.engine.rows().await.map_err(failed)?;
        to_json(&rows)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(failed)?;
        to_json(&status)
    }
}
