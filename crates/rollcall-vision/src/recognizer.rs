//! ArcFace embedding extraction.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::VisionError;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 127.5;
pub const EMBEDDING_DIM: usize = 512;

pub struct ArcFaceRecognizer {
    session: Session,
}

impl ArcFaceRecognizer {
    pub fn load(model_path: &Path) -> Result<Self, VisionError> {
        if !model_path.exists() {
            return Err(VisionError::ModelNotFound(model_path.to_path_buf()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;
        tracing::info!(path = %model_path.display(), "ArcFace model loaded");
        Ok(Self { session })
    }

    /// Raw (unnormalized) embedding of the face at `landmarks`.
    pub fn embed(
        &mut self,
        image: &RgbImage,
        landmarks: &[(f32, f32); 5],
    ) -> Result<Vec<f32>, VisionError> {
        let crop = alignment::align_face(image, landmarks);
        let input = to_tensor(&crop);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, values) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| VisionError::Inference(format!("embedding output: {e}")))?;
        if values.len() != EMBEDDING_DIM {
            return Err(VisionError::Inference(format!(
                "expected {EMBEDDING_DIM}-dim embedding, got {}",
                values.len()
            )));
        }
        Ok(values.to_vec())
    }
}

fn to_tensor(crop: &RgbImage) -> Array4<f32> {
    let side = ALIGNED_SIZE as usize;
    Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
        (crop.get_pixel(x as u32, y as u32)[c] as f32 - PIXEL_MEAN) / PIXEL_STD
    })
}
