//! rollcall-vision — SCRFD detection and ArcFace embeddings via ONNX Runtime.
//!
//! [`FacePipeline`] is the production [`rollcall_core::FaceDetector`]: it finds
//! every face in a colour photo and returns each one with its raw embedding.

pub mod alignment;
pub mod detector;
pub mod recognizer;

pub use detector::ScrfdDetector;
pub use recognizer::{ArcFaceRecognizer, EMBEDDING_DIM};

use image::RgbImage;
use rollcall_core::{Detection, DetectorError, FaceDetector};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DETECTOR_MODEL: &str = "det_10g.onnx";
pub const RECOGNIZER_MODEL: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum VisionError {
    #[error("model file not found: {} (download the InsightFace buffalo_l pack)", .0.display())]
    ModelNotFound(PathBuf),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

impl From<VisionError> for DetectorError {
    fn from(e: VisionError) -> Self {
        match &e {
            VisionError::ModelNotFound(_) => DetectorError::Unavailable(e.to_string()),
            _ => DetectorError::Failed(e.to_string()),
        }
    }
}

/// Detector + recognizer pair loaded from one model directory.
pub struct FacePipeline {
    detector: ScrfdDetector,
    recognizer: ArcFaceRecognizer,
}

impl FacePipeline {
    /// Load `det_10g.onnx` and `w600k_r50.onnx` from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, VisionError> {
        let detector = ScrfdDetector::load(&model_dir.join(DETECTOR_MODEL))?;
        let recognizer = ArcFaceRecognizer::load(&model_dir.join(RECOGNIZER_MODEL))?;
        Ok(Self {
            detector,
            recognizer,
        })
    }
}

impl FaceDetector for FacePipeline {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
        let boxes = self.detector.detect(image)?;

        let mut detections = Vec::with_capacity(boxes.len());
        for bbox in boxes {
            // Landmarks are required for alignment; a head without keypoints
            // yields nothing usable.
            let Some(landmarks) = bbox.landmarks else {
                tracing::debug!(confidence = bbox.confidence, "face without landmarks skipped");
                continue;
            };
            let embedding = self.recognizer.embed(image, &landmarks)?;
            detections.push(Detection { bbox, embedding });
        }
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_models_are_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let err = FacePipeline::load(dir.path()).err().unwrap();
        assert!(matches!(err, VisionError::ModelNotFound(ref p) if p.ends_with(DETECTOR_MODEL)));

        let mapped: DetectorError = err.into();
        assert!(matches!(mapped, DetectorError::Unavailable(_)));
    }

    #[test]
    fn test_inference_errors_map_to_failed() {
        let mapped: DetectorError = VisionError::Inference("bad shape".into()).into();
        assert!(matches!(mapped, DetectorError::Failed(ref m) if m.contains("bad shape")));
    }
}
