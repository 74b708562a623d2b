//! Five-point face alignment onto the ArcFace reference template.
//!
//! A 4-DOF similarity (uniform scale, rotation, translation) is fitted from
//! the detected landmarks to the template in closed form, then the colour
//! crop is pulled through the inverse transform with bilinear sampling.

use image::{imageops, Rgb, RgbImage};

/// Side length of the aligned crop fed to the recognizer.
pub const ALIGNED_SIZE: u32 = 112;

/// ArcFace template landmarks in a 112x112 crop: eyes, nose tip, mouth corners.
pub const REFERENCE_LANDMARKS: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

const FILL: Rgb<u8> = Rgb([0, 0, 0]);

/// `x' = a*x - b*y + tx`, `y' = b*x + a*y + ty`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Similarity {
    pub const IDENTITY: Self = Self {
        a: 1.0,
        b: 0.0,
        tx: 0.0,
        ty: 0.0,
    };

    /// Least-squares similarity mapping `src` points onto `dst` points.
    ///
    /// Returns `None` when the source points are all coincident.
    pub fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Option<Self> {
        let n = src.len() as f32;
        let mean = |pts: &[(f32, f32); 5]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
            (sx / n, sy / n)
        };
        let (msx, msy) = mean(src);
        let (mdx, mdy) = mean(dst);

        let mut dot = 0.0f32;
        let mut cross = 0.0f32;
        let mut energy = 0.0f32;
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst) {
            let (sx, sy) = (sx - msx, sy - msy);
            let (dx, dy) = (dx - mdx, dy - mdy);
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
            energy += sx * sx + sy * sy;
        }
        if energy <= f32::EPSILON {
            return None;
        }

        let a = dot / energy;
        let b = cross / energy;
        Some(Self {
            a,
            b,
            tx: mdx - (a * msx - b * msy),
            ty: mdy - (b * msx + a * msy),
        })
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    pub fn inverse(&self) -> Option<Self> {
        let det = self.a * self.a + self.b * self.b;
        if det <= f32::EPSILON {
            return None;
        }
        let a = self.a / det;
        let b = -self.b / det;
        Some(Self {
            a,
            b,
            tx: -(a * self.tx - b * self.ty),
            ty: -(b * self.tx + a * self.ty),
        })
    }
}

/// Warp the face described by `landmarks` into an aligned 112x112 crop.
///
/// Degenerate landmarks fall back to a plain top-left crop so the caller
/// still gets an image of the expected size.
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5]) -> RgbImage {
    let to_source = Similarity::estimate(landmarks, &REFERENCE_LANDMARKS)
        .and_then(|fwd| fwd.inverse())
        .unwrap_or_else(|| {
            tracing::debug!("degenerate landmarks, skipping alignment");
            Similarity::IDENTITY
        });

    RgbImage::from_fn(ALIGNED_SIZE, ALIGNED_SIZE, |x, y| {
        let (sx, sy) = to_source.apply((x as f32, y as f32));
        imageops::interpolate_bilinear(image, sx, sy).unwrap_or(FILL)
    })
}
