//! Enrollment: turning a photo into a stored identity.

use crate::attendance::{RosterError, Student, StudentRoster};
use crate::session::{DetectorError, FaceDetector};
use crate::store::{EmbeddingStore, StoreError};
use crate::types::{Detection, Embedding, EmbeddingError};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

/// File extensions accepted by directory encoding.
pub const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid embedding: {0}")]
    EmbeddingInvalid(#[from] EmbeddingError),
    #[error("no face detected in enrollment image")]
    NoFaceDetected,
    #[error("duplicate identity: {0}")]
    DuplicateIdentity(String),
    #[error("student not found in roster: {0}")]
    StudentNotFound(String),
    #[error("enrollment image could not be decoded: {0}")]
    ImageDecode(#[from] image::ImageError),
    #[error(transparent)]
    Detector(#[from] DetectorError),
    #[error(transparent)]
    Roster(RosterError),
    #[error(transparent)]
    Store(StoreError),
}

impl From<RosterError> for EnrollError {
    fn from(e: RosterError) -> Self {
        match e {
            RosterError::DuplicateIdentity(who) => EnrollError::DuplicateIdentity(who),
            other => EnrollError::Roster(other),
        }
    }
}

impl From<StoreError> for EnrollError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::EmbeddingInvalid { source, .. } => EnrollError::EmbeddingInvalid(source),
            other => EnrollError::Store(other),
        }
    }
}

/// Result of a successful enrollment.
#[derive(Debug, Clone)]
pub struct EnrollOutcome {
    pub name: String,
    /// Whether an existing embedding for `name` was merged into.
    pub merged: bool,
    /// Faces found in the photo; only the largest was used.
    pub faces_detected: usize,
    pub embedding: Embedding,
}

/// Result of encoding several photos of one person.
#[derive(Debug, Clone, Serialize)]
pub struct EncodeOutcome {
    pub name: String,
    pub merged: bool,
    /// Photos that contributed a face sample.
    pub samples: usize,
    /// `(index, reason)` for photos that were unreadable or had no face.
    pub skipped: Vec<(usize, String)>,
    #[serde(skip)]
    pub embedding: Option<Embedding>,
}

/// The detection with the largest bounding box area.
pub fn largest_face(detections: &[Detection]) -> Option<&Detection> {
    detections.iter().fold(None, |best: Option<&Detection>, d| match best {
        Some(b) if b.bbox.area() >= d.bbox.area() => Some(b),
        _ => Some(d),
    })
}

/// Derive an identity name from a photo filename.
///
/// `Jane_Doe-2.jpg` → `Jane Doe`: underscores become spaces, anything after
/// the first `-` is dropped, surrounding whitespace trimmed.
pub fn name_from_filename(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    if !IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        return None;
    }
    let stem = path.file_stem()?.to_str()?.replace('_', " ");
    let name = stem.split('-').next().unwrap_or("").trim();
    (!name.is_empty()).then(|| name.to_string())
}

/// Decode `image_bytes`, detect faces and normalize the largest one.
fn extract_embedding<D>(detector: &mut D, image_bytes: &[u8]) -> Result<(Embedding, usize), EnrollError>
where
    D: FaceDetector + ?Sized,
{
    let image = image::load_from_memory(image_bytes)?.to_rgb8();
    let detections = detector.detect(&image)?;
    let face = largest_face(&detections).ok_or(EnrollError::NoFaceDetected)?;
    let embedding = Embedding::normalize(&face.embedding)?;
    Ok((embedding, detections.len()))
}

/// Store-only enrollment from a photo, merging with any existing entry.
pub fn enroll_image<D>(
    store: &EmbeddingStore,
    detector: &mut D,
    name: &str,
    image_bytes: &[u8],
) -> Result<EnrollOutcome, EnrollError>
where
    D: FaceDetector + ?Sized,
{
    let (embedding, faces_detected) = extract_embedding(detector, image_bytes)?;
    let merged = store.contains(name);
    let embedding = store.enroll(name, embedding.values())?;
    Ok(EnrollOutcome {
        name: name.to_string(),
        merged,
        faces_detected,
        embedding,
    })
}

/// Store-only enrollment of several photos of `name` as one averaged sample.
///
/// Photos that cannot be decoded or contain no face are listed in
/// `skipped`. When none are usable the store is left untouched.
pub fn enroll_images<D>(
    store: &EmbeddingStore,
    detector: &mut D,
    name: &str,
    images: &[Vec<u8>],
) -> Result<EncodeOutcome, EnrollError>
where
    D: FaceDetector + ?Sized,
{
    let name = name.trim();
    if name.is_empty() {
        return Err(EnrollError::MissingField("name"));
    }

    let mut samples = Vec::with_capacity(images.len());
    let mut skipped = Vec::new();
    for (index, bytes) in images.iter().enumerate() {
        match extract_embedding(detector, bytes) {
            Ok((embedding, _)) => samples.push(embedding.into_values()),
            Err(e) => {
                tracing::warn!(name, index, error = %e, "photo skipped");
                skipped.push((index, e.to_string()));
            }
        }
    }

    let merged = store.contains(name);
    let embedding = if samples.is_empty() {
        None
    } else {
        Some(store.enroll_mean(name, &samples)?)
    };

    tracing::info!(name, samples = samples.len(), skipped = skipped.len(), "photos encoded");
    Ok(EncodeOutcome {
        name: name.to_string(),
        merged: merged && embedding.is_some(),
        samples: samples.len(),
        skipped,
        embedding,
    })
}

/// Register a new student and their first face sample.
///
/// Nothing is written if the id or name is taken, no face is found, or the
/// embedding is unusable. A failed store write removes the roster entry again.
pub fn enroll_student<D, R>(
    store: &EmbeddingStore,
    detector: &mut D,
    roster: &R,
    student: &Student,
    image_bytes: &[u8],
) -> Result<EnrollOutcome, EnrollError>
where
    D: FaceDetector + ?Sized,
    R: StudentRoster + ?Sized,
{
    let student = Student {
        id: student.id.trim().to_string(),
        name: student.name.trim().to_string(),
        program: student.program.trim().to_string(),
        branch: student.branch.trim().to_string(),
        mobile: student.mobile.trim().to_string(),
        email: student.email.trim().to_string(),
    };
    if student.id.is_empty() {
        return Err(EnrollError::MissingField("id"));
    }
    if student.name.is_empty() {
        return Err(EnrollError::MissingField("name"));
    }
    if image_bytes.is_empty() {
        return Err(EnrollError::MissingField("photo"));
    }

    if roster.lookup_by_id(&student.id)?.is_some() || roster.lookup_by_name(&student.name)?.is_some() {
        return Err(EnrollError::DuplicateIdentity(student.name));
    }

    let (embedding, faces_detected) = extract_embedding(detector, image_bytes)?;

    roster.insert(&student)?;
    let merged = store.contains(&student.name);
    let stored = match store.enroll(&student.name, embedding.values()) {
        Ok(stored) => stored,
        Err(e) => {
            tracing::error!(id = %student.id, error = %e, "embedding write failed; rolling back roster entry");
            if let Err(undo) = roster.remove(&student.id) {
                tracing::error!(id = %student.id, error = %undo, "roster rollback failed");
            }
            return Err(e.into());
        }
    };

    tracing::info!(id = %student.id, name = %student.name, faces_detected, "student enrolled");
    Ok(EnrollOutcome {
        name: student.name,
        merged,
        faces_detected,
        embedding: stored,
    })
}

/// Add another face sample for an existing student.
pub fn add_sample<D, R>(
    store: &EmbeddingStore,
    detector: &mut D,
    roster: &R,
    name: &str,
    image_bytes: &[u8],
) -> Result<EnrollOutcome, EnrollError>
where
    D: FaceDetector + ?Sized,
    R: StudentRoster + ?Sized,
{
    let name = name.trim();
    if roster.lookup_by_name(name)?.is_none() {
        return Err(EnrollError::StudentNotFound(name.to_string()));
    }
    let outcome = enroll_image(store, detector, name, image_bytes)?;
    tracing::info!(name, merged = outcome.merged, "face sample added");
    Ok(outcome)
}
