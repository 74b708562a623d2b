//! SCRFD face detector over colour photos.
//!
//! The photo is letterboxed into a 640x640 RGB tensor, each of the three
//! stride heads is decoded from anchor-free offsets and the union is
//! thinned with NMS.

use crate::VisionError;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::{DynValue, TensorRef};
use rollcall_core::BoundingBox;
use std::path::Path;

const INPUT_SIZE: u32 = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 128.0;
const SCORE_THRESHOLD: f32 = 0.5;
const NMS_IOU_THRESHOLD: f32 = 0.4;
const STRIDES: [u32; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;
const OUTPUTS_PER_STRIDE: usize = 3;

/// Maps letterboxed tensor coordinates back onto the source photo.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    new_w: u32,
    new_h: u32,
    pad_x: u32,
    pad_y: u32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> Self {
        let scale = (INPUT_SIZE as f32 / width as f32).min(INPUT_SIZE as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
        let new_h = ((height as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
        Self {
            scale,
            new_w,
            new_h,
            pad_x: (INPUT_SIZE - new_w) / 2,
            pad_y: (INPUT_SIZE - new_h) / 2,
        }
    }

    fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.pad_x
            && y >= self.pad_y
            && x < self.pad_x + self.new_w
            && y < self.pad_y + self.new_h
    }

    fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }
}

/// Score, bbox and keypoint tensor positions for one stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeadOutputs {
    score: usize,
    bbox: usize,
    kps: usize,
}

/// Raw head tensors for one stride.
struct HeadTensors<'a> {
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

pub struct ScrfdDetector {
    session: Session,
    heads: [HeadOutputs; 3],
}

impl ScrfdDetector {
    pub fn load(model_path: &Path) -> Result<Self, VisionError> {
        if !model_path.exists() {
            return Err(VisionError::ModelNotFound(model_path.to_path_buf()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();
        if names.len() < STRIDES.len() * OUTPUTS_PER_STRIDE {
            return Err(VisionError::Inference(format!(
                "SCRFD needs {} outputs (score/bbox/kps per stride), model has {}",
                STRIDES.len() * OUTPUTS_PER_STRIDE,
                names.len()
            )));
        }

        let heads = head_outputs(&names);
        tracing::info!(path = %model_path.display(), outputs = ?names, ?heads, "SCRFD model loaded");
        Ok(Self { session, heads })
    }

    /// Faces in `image`, highest confidence first.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, VisionError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Ok(Vec::new());
        }

        let letterbox = Letterbox::fit(width, height);
        let input = to_tensor(image, &letterbox);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (head, &stride) in self.heads.iter().zip(STRIDES.iter()) {
            let tensors = HeadTensors {
                scores: head_tensor(&outputs[head.score], "scores", stride)?,
                bboxes: head_tensor(&outputs[head.bbox], "bboxes", stride)?,
                kps: head_tensor(&outputs[head.kps], "keypoints", stride)?,
            };
            candidates.extend(decode_head(&tensors, stride, &letterbox, SCORE_THRESHOLD));
        }

        let faces = non_max_suppression(candidates, NMS_IOU_THRESHOLD);
        tracing::debug!(width, height, faces = faces.len(), "SCRFD pass complete");
        Ok(faces)
    }
}

fn head_tensor<'a>(value: &'a DynValue, what: &str, stride: u32) -> Result<&'a [f32], VisionError> {
    value
        .try_extract_tensor::<f32>()
        .map(|(_, data)| data)
        .map_err(|e| VisionError::Inference(format!("{what} stride {stride}: {e}")))
}

/// Letterbox `image` into a normalized 1x3x640x640 tensor.
///
/// Padding is filled with the mean so it normalizes to zero.
fn to_tensor(image: &RgbImage, letterbox: &Letterbox) -> Array4<f32> {
    let resized = imageops::resize(image, letterbox.new_w, letterbox.new_h, FilterType::Triangle);
    let side = INPUT_SIZE as usize;

    Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
        let (x, y) = (x as u32, y as u32);
        let value = if letterbox.contains(x, y) {
            resized.get_pixel(x - letterbox.pad_x, y - letterbox.pad_y)[c] as f32
        } else {
            PIXEL_MEAN
        };
        (value - PIXEL_MEAN) / PIXEL_STD
    })
}

/// Locate each stride's score/bbox/kps tensors.
///
/// Exports that name their heads `score_8`, `bbox_16`, `kps_32`, ... are
/// mapped by name. Anything else is assumed to use the stock InsightFace
/// order: all scores, then all boxes, then all keypoints.
fn head_outputs(names: &[String]) -> [HeadOutputs; 3] {
    let by_name = |kind: &str, stride: u32| {
        let wanted = format!("{kind}_{stride}");
        names.iter().position(|n| *n == wanted)
    };
    let named = |stride: u32| {
        Some(HeadOutputs {
            score: by_name("score", stride)?,
            bbox: by_name("bbox", stride)?,
            kps: by_name("kps", stride)?,
        })
    };

    match (named(STRIDES[0]), named(STRIDES[1]), named(STRIDES[2])) {
        (Some(s8), Some(s16), Some(s32)) => [s8, s16, s32],
        _ => {
            tracing::debug!(?names, "SCRFD head names not recognized, using positional order");
            std::array::from_fn(|i| HeadOutputs {
                score: i,
                bbox: i + STRIDES.len(),
                kps: i + 2 * STRIDES.len(),
            })
        }
    }
}

/// Decode every anchor above `threshold` for one stride into source-image boxes.
fn decode_head(
    tensors: &HeadTensors<'_>,
    stride: u32,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<BoundingBox> {
    let cells_per_row = (INPUT_SIZE / stride) as usize;
    let anchors = cells_per_row * cells_per_row * ANCHORS_PER_CELL;
    let step = stride as f32;

    (0..anchors)
        .filter_map(|idx| {
            let score = *tensors.scores.get(idx)?;
            if score <= threshold {
                return None;
            }

            let cell = idx / ANCHORS_PER_CELL;
            let cx = (cell % cells_per_row) as f32 * step;
            let cy = (cell / cells_per_row) as f32 * step;

            let d = tensors.bboxes.get(idx * 4..idx * 4 + 4)?;
            let (x1, y1) = letterbox.to_source(cx - d[0] * step, cy - d[1] * step);
            let (x2, y2) = letterbox.to_source(cx + d[2] * step, cy + d[3] * step);

            let landmarks = tensors.kps.get(idx * 10..idx * 10 + 10).map(|k| {
                std::array::from_fn(|i| {
                    letterbox.to_source(cx + k[2 * i] * step, cy + k[2 * i + 1] * step)
                })
            });

            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
                landmarks,
            })
        })
        .collect()
}

/// Greedy NMS. Output is sorted by descending confidence.
fn non_max_suppression(mut boxes: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        if kept.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let overlap_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let overlap_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = overlap_w * overlap_h;
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x: f32, y: f32, size: f32, confidence: f32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width: size,
            height: size,
            confidence,
            landmarks: None,
        }
    }

    #[test]
    fn test_iou() {
        let a = face(0.0, 0.0, 10.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(iou(&a, &face(20.0, 20.0, 10.0, 1.0)), 0.0);

        let b = BoundingBox {
            x: 5.0,
            ..a.clone()
        };
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_keeps_best_of_overlapping() {
        let kept = non_max_suppression(
            vec![
                face(5.0, 5.0, 100.0, 0.8),
                face(200.0, 200.0, 50.0, 0.7),
                face(0.0, 0.0, 100.0, 0.9),
            ],
            NMS_IOU_THRESHOLD,
        );
        let confidences: Vec<f32> = kept.iter().map(|b| b.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.7]);
        assert!(non_max_suppression(Vec::new(), 0.4).is_empty());
    }

    #[test]
    fn test_letterbox_landscape() {
        let lb = Letterbox::fit(320, 240);
        assert_eq!(lb.scale, 2.0);
        assert_eq!(lb.pad_x, 0);
        assert_eq!(lb.pad_y, 80);
        assert_eq!((lb.new_w, lb.new_h), (640, 480));

        let (x, y) = lb.to_source(100.0 * 2.0, 50.0 * 2.0 + 80.0);
        assert!((x - 100.0).abs() < 1e-4 && (y - 50.0).abs() < 1e-4);
    }

    #[test]
    fn test_letterbox_odd_padding() {
        let lb = Letterbox::fit(640, 639);
        assert_eq!((lb.new_w, lb.new_h), (640, 639));
        assert!(lb.contains(0, 638));
        assert!(!lb.contains(0, 639));
    }

    #[test]
    fn test_tensor_padding_normalizes_to_zero() {
        let img = RgbImage::from_pixel(320, 240, image::Rgb([255, 0, 128]));
        let lb = Letterbox::fit(320, 240);
        let t = to_tensor(&img, &lb);

        assert_eq!(t.shape(), &[1, 3, 640, 640]);
        assert_eq!(t[[0, 0, 0, 0]], 0.0);
        let mid = 320;
        assert!((t[[0, 0, mid, mid]] - (255.0 - PIXEL_MEAN) / PIXEL_STD).abs() < 1e-2);
        assert!((t[[0, 1, mid, mid]] - (0.0 - PIXEL_MEAN) / PIXEL_STD).abs() < 1e-2);
    }

    #[test]
    fn test_head_outputs_by_name_any_order() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32",
            "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let heads = head_outputs(&names);
        assert_eq!(heads[0], HeadOutputs { score: 2, bbox: 0, kps: 1 });
        assert_eq!(heads[2], HeadOutputs { score: 8, bbox: 6, kps: 7 });
    }

    #[test]
    fn test_head_outputs_positional_fallback() {
        let names: Vec<String> = (428..437).map(|i| i.to_string()).collect();
        let heads = head_outputs(&names);
        assert_eq!(heads[1], HeadOutputs { score: 1, bbox: 4, kps: 7 });
    }

    #[test]
    fn test_decode_head_single_anchor() {
        let stride = 32;
        let cells = (INPUT_SIZE / stride) as usize;
        let anchors = cells * cells * ANCHORS_PER_CELL;
        let mut scores = vec![0.0; anchors];
        let mut bboxes = vec![0.0; anchors * 4];
        let kps = vec![0.0; anchors * 10];

        // Cell (x=2, y=1), first anchor: centre (64, 32), one stride each way.
        let idx = (cells + 2) * ANCHORS_PER_CELL;
        scores[idx] = 0.9;
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);

        let identity = Letterbox::fit(INPUT_SIZE, INPUT_SIZE);
        let tensors = HeadTensors {
            scores: &scores,
            bboxes: &bboxes,
            kps: &kps,
        };
        let found = decode_head(&tensors, stride, &identity, SCORE_THRESHOLD);

        assert_eq!(found.len(), 1);
        let b = &found[0];
        assert_eq!((b.x, b.y, b.width, b.height), (32.0, 0.0, 64.0, 64.0));
        assert_eq!(b.landmarks.unwrap()[0], (64.0, 32.0));
    }
}
