//! Batch processing of uploaded photos: detect → match → record for every face.

use crate::annotate;
use crate::attendance::{
    timestamp, AttendanceLog, AttendanceRecorder, AttendanceRow, AttendanceStatus,
    LectureContext, StudentRoster,
};
use crate::matcher::{CosineMatcher, Matcher, NO_MATCH_SCORE};
use crate::store::EmbeddingStore;
use crate::types::{BoundingBox, Detection, Embedding};
use chrono::NaiveDateTime;
use image::RgbImage;
use serde::Serialize;
use thiserror::Error;

/// Name shown for faces that did not clear the match threshold.
pub const UNKNOWN_NAME: &str = "Unknown";

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detector unavailable: {0}")]
    Unavailable(String),
    #[error("detection failed: {0}")]
    Failed(String),
}

/// External face detection + embedding capability.
///
/// Must return an empty list, not an error, for a valid image without faces.
pub trait FaceDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, DetectorError>;
}

/// Outcome for one detected face.
#[derive(Debug, Clone, Serialize)]
pub struct FaceResult {
    pub name: String,
    pub status: AttendanceStatus,
    pub confidence: f32,
    #[serde(with = "timestamp::option", skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<NaiveDateTime>,
    pub bbox: BoundingBox,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome for one uploaded image.
#[derive(Debug, Clone, Serialize)]
pub struct ImageResult {
    pub index: usize,
    pub faces: Vec<FaceResult>,
    /// JPEG copy with face boxes drawn; shipped separately from the JSON.
    #[serde(skip)]
    pub annotated: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Everything produced by one upload.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionReport {
    pub images: Vec<ImageResult>,
    /// Rows appended during this batch (`Present` / `Re-Marked` only).
    pub session_attendance: Vec<AttendanceRow>,
}

/// Coordinates the store, matcher and recorder over a batch of images.
pub struct SessionOrchestrator<'a> {
    store: &'a EmbeddingStore,
    recorder: &'a AttendanceRecorder,
    matcher: CosineMatcher,
    annotate: bool,
}

impl<'a> SessionOrchestrator<'a> {
    pub fn new(store: &'a EmbeddingStore, recorder: &'a AttendanceRecorder) -> Self {
        Self {
            store,
            recorder,
            matcher: CosineMatcher,
            annotate: true,
        }
    }

    /// Enable or disable rendering of annotated copies.
    pub fn annotate(mut self, enabled: bool) -> Self {
        self.annotate = enabled;
        self
    }

    /// Process every image in `images` with a single batch timestamp `now`.
    ///
    /// Never fails as a whole: undecodable images, detector errors and
    /// per-face errors are reported in the corresponding result entry.
    pub fn run<D, R, L>(
        &self,
        detector: &mut D,
        roster: &R,
        log: &L,
        images: &[Vec<u8>],
        context: &LectureContext,
        now: NaiveDateTime,
    ) -> SessionReport
    where
        D: FaceDetector + ?Sized,
        R: StudentRoster + ?Sized,
        L: AttendanceLog + ?Sized,
    {
        let mut report = SessionReport::default();

        for (index, bytes) in images.iter().enumerate() {
            let image = match image::load_from_memory(bytes) {
                Ok(img) => img.to_rgb8(),
                Err(e) => {
                    tracing::warn!(index, error = %e, "skipping undecodable image");
                    report.images.push(ImageResult::failed(index, format!("decode: {e}")));
                    continue;
                }
            };

            let detections = match detector.detect(&image) {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(index, error = %e, "detector failed on image");
                    report.images.push(ImageResult::failed(index, e.to_string()));
                    continue;
                }
            };
            tracing::debug!(index, faces = detections.len(), "image processed by detector");

            let mut faces = Vec::with_capacity(detections.len());
            let mut marks = Vec::with_capacity(detections.len());
            for detection in detections {
                let (face, accepted) =
                    self.process_face(roster, log, detection, context, now, &mut report);
                marks.push(annotate::FaceMark {
                    bbox: face.bbox.clone(),
                    accepted,
                    label: format!("{} ({:.2})", face.name, face.confidence),
                });
                faces.push(face);
            }

            let annotated = if self.annotate {
                match annotate::render(&image, &marks) {
                    Ok(jpeg) => Some(jpeg),
                    Err(e) => {
                        tracing::warn!(index, error = %e, "failed to render annotated image");
                        None
                    }
                }
            } else {
                None
            };

            report.images.push(ImageResult {
                index,
                faces,
                annotated,
                error: None,
            });
        }

        tracing::info!(
            images = images.len(),
            recorded = report.session_attendance.len(),
            "attendance batch complete"
        );
        report
    }

    /// Match and record one detection. Returns the face result and whether
    /// the match cleared the threshold.
    fn process_face<R, L>(
        &self,
        roster: &R,
        log: &L,
        detection: Detection,
        context: &LectureContext,
        now: NaiveDateTime,
        report: &mut SessionReport,
    ) -> (FaceResult, bool)
    where
        R: StudentRoster + ?Sized,
        L: AttendanceLog + ?Sized,
    {
        let Detection { bbox, embedding } = detection;

        let query = match Embedding::normalize(&embedding) {
            Ok(q) => q,
            Err(e) => {
                tracing::warn!(error = %e, "detector returned an unusable embedding");
                let face = FaceResult {
                    name: UNKNOWN_NAME.to_string(),
                    status: AttendanceStatus::Unknown,
                    confidence: NO_MATCH_SCORE,
                    timestamp: None,
                    bbox,
                    error: Some(e.to_string()),
                };
                return (face, false);
            }
        };

        let identities = self.store.snapshot();
        let best = self.matcher.find_best_match(&query, &identities);
        let threshold = self.recorder.config().match_threshold;
        let accepted = best.accepted(threshold).map(str::to_string);
        let name = accepted.clone().unwrap_or_else(|| UNKNOWN_NAME.to_string());

        let face = match self.recorder.record(roster, log, &best, now, context) {
            Ok(outcome) => {
                if let Some(row) = outcome.row {
                    report.session_attendance.push(row);
                }
                FaceResult {
                    name,
                    status: outcome.status,
                    confidence: best.score,
                    timestamp: outcome.timestamp,
                    bbox,
                    error: None,
                }
            }
            Err(e) => {
                tracing::error!(name = %name, error = %e, "failed to record attendance");
                FaceResult {
                    name,
                    status: AttendanceStatus::Unknown,
                    confidence: best.score,
                    timestamp: None,
                    bbox,
                    error: Some(e.to_string()),
                }
            }
        };

        (face, accepted.is_some())
    }
}

impl ImageResult {
    fn failed(index: usize, error: String) -> Self {
        Self {
            index,
            faces: Vec::new(),
            annotated: None,
            error: Some(error),
        }
    }
}
