//! rollcall-core — Embedding store, matching and attendance engine.
//!
//! Faces detected in uploaded photos are matched against one normalized
//! embedding per enrolled student, and repeated sightings are folded into a
//! single attendance event per re-attendance interval.

pub mod annotate;
pub mod attendance;
pub mod enroll;
pub mod matcher;
pub mod session;
pub mod store;
pub mod types;

#[cfg(test)]
mod testing;

pub use attendance::{
    AttendanceEvent, AttendanceLog, AttendanceRecorder, AttendanceRow, AttendanceStatus,
    LectureContext, LogError, RecordError, RecorderConfig, RosterError, Student, StudentRoster,
};
pub use enroll::{
    add_sample, enroll_image, enroll_images, enroll_student, EncodeOutcome, EnrollError,
    EnrollOutcome,
};
pub use matcher::{BestMatch, CosineMatcher, Matcher};
pub use session::{
    DetectorError, FaceDetector, FaceResult, ImageResult, SessionOrchestrator, SessionReport,
};
pub use store::{EmbeddingStore, Identities, LoadStatus, StoreCorrupted, StoreError};
pub use types::{BoundingBox, Detection, Embedding, EmbeddingError};
