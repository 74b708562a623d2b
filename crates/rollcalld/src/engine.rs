use rollcall_core::{
    add_sample, enroll_images, enroll_student, AttendanceLog, AttendanceRecorder, AttendanceRow,
    EmbeddingStore, EncodeOutcome, EnrollError, EnrollOutcome, FaceDetector, LectureContext,
    LoadStatus, LogError, SessionOrchestrator, SessionReport, StoreError, Student,
};
use rollcall_db::{AttendanceDb, DbError};
use rollcall_vision::{FacePipeline, VisionError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::config::Config;

const QUEUE_DEPTH: usize = 8;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("vision: {0}")]
    Vision(#[from] VisionError),
    #[error("database: {0}")]
    Db(#[from] DbError),
    #[error(transparent)]
    Enroll(#[from] EnrollError),
    #[error("attendance log: {0}")]
    Log(#[from] LogError),
    #[error("embedding store: {0}")]
    Store(#[from] StoreError),
    #[error("failed to start engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Snapshot returned by the `Status` call.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub version: &'static str,
    pub identities: usize,
    pub enrolled: Vec<String>,
    pub students: usize,
    pub attendance_rows: usize,
    pub store_path: String,
    pub store_load: String,
    pub store_recovered: bool,
    pub match_threshold: f32,
    pub reattendance_minutes: i64,
    pub annotate: bool,
}

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    EnrollStudent {
        student: Student,
        image: Vec<u8>,
        reply: Reply<EnrollOutcome>,
    },
    AddSample {
        name: String,
        image: Vec<u8>,
        reply: Reply<EnrollOutcome>,
    },
    EncodeFaces {
        name: String,
        images: Vec<Vec<u8>>,
        reply: Reply<EncodeOutcome>,
    },
    ReloadStore {
        reply: Reply<String>,
    },
    Mark {
        images: Vec<Vec<u8>>,
        context: LectureContext,
        reply: Reply<SessionReport>,
    },
    Rows {
        reply: Reply<Vec<AttendanceRow>>,
    },
    Status {
        reply: Reply<EngineStatus>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        request: impl FnOnce(Reply<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(request(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Register a new student with their first photo.
    pub async fn enroll_student(
        &self,
        student: Student,
        image: Vec<u8>,
    ) -> Result<EnrollOutcome, EngineError> {
        self.call(|reply| EngineRequest::EnrollStudent {
            student,
            image,
            reply,
        })
        .await
    }

    /// Merge another photo into a rostered student's embedding.
    pub async fn add_sample(&self, name: String, image: Vec<u8>) -> Result<EnrollOutcome, EngineError> {
        self.call(|reply| EngineRequest::AddSample { name, image, reply })
            .await
    }

    /// Store-only enrollment of every photo of one person, averaged.
    pub async fn encode_faces(
        &self,
        name: String,
        images: Vec<Vec<u8>>,
    ) -> Result<EncodeOutcome, EngineError> {
        self.call(|reply| EngineRequest::EncodeFaces {
            name,
            images,
            reply,
        })
        .await
    }

    /// Re-read the embedding store file, returning how the load went.
    pub async fn reload_store(&self) -> Result<String, EngineError> {
        self.call(|reply| EngineRequest::ReloadStore { reply }).await
    }

    /// Match every face in a batch of photos and record attendance.
    pub async fn mark(
        &self,
        images: Vec<Vec<u8>>,
        context: LectureContext,
    ) -> Result<SessionReport, EngineError> {
        self.call(|reply| EngineRequest::Mark {
            images,
            context,
            reply,
        })
        .await
    }

    pub async fn rows(&self) -> Result<Vec<AttendanceRow>, EngineError> {
        self.call(|reply| EngineRequest::Rows { reply }).await
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.call(|reply| EngineRequest::Status { reply }).await
    }
}

/// Everything the engine thread owns.
pub struct Engine {
    detector: Box<dyn FaceDetector + Send>,
    db: AttendanceDb,
    store: EmbeddingStore,
    store_load: String,
    store_recovered: bool,
    recorder: AttendanceRecorder,
    annotate: bool,
}

impl Engine {
    pub fn new(
        detector: Box<dyn FaceDetector + Send>,
        db: AttendanceDb,
        (store, load): (EmbeddingStore, LoadStatus),
        config: &Config,
    ) -> Self {
        Self {
            detector,
            db,
            store,
            store_load: describe_load(&load),
            store_recovered: load.is_recovered(),
            recorder: AttendanceRecorder::new(config.recorder_config()),
            annotate: config.annotate,
        }
    }

    /// Load models, open the database and read the embedding store.
    ///
    /// Fails fast if the models or database are unavailable. A corrupted
    /// store is not an error: the engine starts empty and says so in `Status`.
    pub fn open(config: &Config) -> Result<Self, EngineError> {
        let pipeline = FacePipeline::load(&config.model_dir)?;
        let db = AttendanceDb::open(&config.db_path)?;

        let (store, load) = EmbeddingStore::load(config.store_path.clone());
        if load.is_recovered() {
            tracing::warn!(
                path = %config.store_path.display(),
                status = %describe_load(&load),
                "embedding store unusable, starting empty"
            );
        } else {
            tracing::info!(
                path = %config.store_path.display(),
                identities = store.len(),
                status = %describe_load(&load),
                "embedding store loaded"
            );
        }

        Ok(Self::new(Box::new(pipeline), db, (store, load), config))
    }

    /// Move the engine onto a dedicated OS thread and return a handle to it.
    pub fn spawn(mut self) -> Result<EngineHandle, EngineError> {
        let (tx, mut rx) = mpsc::channel::<EngineRequest>(QUEUE_DEPTH);

        std::thread::Builder::new()
            .name("rollcall-engine".into())
            .spawn(move || {
                tracing::info!("engine thread started");
                while let Some(req) = rx.blocking_recv() {
                    self.handle(req);
                }
                tracing::info!("engine thread exiting");
            })
            .map_err(EngineError::Spawn)?;

        Ok(EngineHandle { tx })
    }

    fn handle(&mut self, req: EngineRequest) {
        match req {
            EngineRequest::EnrollStudent {
                student,
                image,
                reply,
            } => {
                let result = enroll_student(
                    &self.store,
                    self.detector.as_mut(),
                    &self.db,
                    &student,
                    &image,
                );
                let _ = reply.send(result.map_err(EngineError::from));
            }
            EngineRequest::AddSample { name, image, reply } => {
                let result = add_sample(&self.store, self.detector.as_mut(), &self.db, &name, &image);
                let _ = reply.send(result.map_err(EngineError::from));
            }
            EngineRequest::EncodeFaces {
                name,
                images,
                reply,
            } => {
                let result = enroll_images(&self.store, self.detector.as_mut(), &name, &images);
                let _ = reply.send(result.map_err(EngineError::from));
            }
            EngineRequest::ReloadStore { reply } => {
                let _ = reply.send(self.reload_store());
            }
            EngineRequest::Mark {
                images,
                context,
                reply,
            } => {
                let now = chrono::Local::now().naive_local();
                let report = SessionOrchestrator::new(&self.store, &self.recorder)
                    .annotate(self.annotate)
                    .run(
                        self.detector.as_mut(),
                        &self.db,
                        &self.db,
                        &images,
                        &context,
                        now,
                    );
                tracing::debug!(
                    images = images.len(),
                    marked = report.session_attendance.len(),
                    lecture = %context.lecture,
                    section = %context.section,
                    "attendance batch processed"
                );
                let _ = reply.send(Ok(report));
            }
            EngineRequest::Rows { reply } => {
                let _ = reply.send(self.db.rows().map_err(EngineError::from));
            }
            EngineRequest::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn reload_store(&mut self) -> Result<String, EngineError> {
        let load = self.store.reload()?;
        self.store_load = describe_load(&load);
        self.store_recovered = load.is_recovered();
        tracing::info!(identities = self.store.len(), status = %self.store_load, "embedding store reloaded");
        Ok(self.store_load.clone())
    }

    fn status(&self) -> Result<EngineStatus, EngineError> {
        let config = self.recorder.config();
        let enrolled = self.store.names();
        Ok(EngineStatus {
            version: env!("CARGO_PKG_VERSION"),
            identities: enrolled.len(),
            enrolled,
            students: self.db.students()?.len(),
            attendance_rows: self.db.rows()?.len(),
            store_path: self.store.path().display().to_string(),
            store_load: self.store_load.clone(),
            store_recovered: self.store_recovered,
            match_threshold: config.match_threshold,
            reattendance_minutes: config.reattendance_interval.num_minutes(),
            annotate: self.annotate,
        })
    }
}

fn describe_load(load: &LoadStatus) -> String {
    match load {
        LoadStatus::Missing => "missing".to_string(),
        LoadStatus::Loaded { identities, dropped } => {
            format!("loaded {identities} identities ({dropped} dropped)")
        }
        LoadStatus::Upgraded { identities, dropped } => {
            format!("upgraded legacy store with {identities} identities ({dropped} dropped)")
        }
        LoadStatus::Recovered(reason) => format!("recovered empty: {reason}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::{AttendanceStatus, BoundingBox, Detection, DetectorError};
    use std::io::Cursor;
    use std::path::PathBuf;

    /// Sees one face with a fixed embedding in every photo.
    struct FixedFace(Vec<f32>);

    impl FaceDetector for FixedFace {
        fn detect(&mut self, _image: &image::RgbImage) -> Result<Vec<Detection>, DetectorError> {
            Ok(vec![Detection {
                bbox: BoundingBox {
                    x: 1.0,
                    y: 1.0,
                    width: 4.0,
                    height: 4.0,
                    confidence: 0.95,
                    landmarks: None,
                },
                embedding: self.0.clone(),
            }])
        }
    }

    fn photo() -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        image::RgbImage::new(8, 8)
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            model_dir: PathBuf::from("/unused"),
            db_path: dir.join("rollcall.db"),
            store_path: dir.join("encodings.json"),
            match_threshold: 0.5,
            reattendance_minutes: 2,
            annotate: true,
        }
    }

    fn spawn_test_engine(dir: &std::path::Path) -> EngineHandle {
        let config = test_config(dir);
        let db = AttendanceDb::open(&config.db_path).unwrap();
        let store = EmbeddingStore::load(config.store_path.clone());
        Engine::new(Box::new(FixedFace(vec![1.0, 0.0, 0.0, 0.0])), db, store, &config)
            .spawn()
            .unwrap()
    }

    fn dana() -> Student {
        Student {
            id: "42".into(),
            name: "Dana".into(),
            program: "B.Tech".into(),
            branch: "CSE".into(),
            mobile: "555".into(),
            email: "dana@example.com".into(),
        }
    }

    #[tokio::test]
    async fn test_enroll_then_mark_twice() {
        let dir = tempfile::tempdir().unwrap();
        let engine = spawn_test_engine(dir.path());

        let outcome = engine.enroll_student(dana(), photo()).await.unwrap();
        assert_eq!(outcome.name, "Dana");
        assert!(!outcome.merged);

        let context = LectureContext {
            lecture: "OS".into(),
            section: "A".into(),
        };
        let first = engine.mark(vec![photo()], context.clone()).await.unwrap();
        assert_eq!(first.images[0].faces[0].status, AttendanceStatus::Present);
        assert!(first.images[0].annotated.is_some());
        assert_eq!(first.session_attendance.len(), 1);
        assert_eq!(first.session_attendance[0].lecture, "OS");

        let second = engine.mark(vec![photo()], context).await.unwrap();
        assert_eq!(second.images[0].faces[0].status, AttendanceStatus::AlreadyMarked);
        assert!(second.session_attendance.is_empty());

        assert_eq!(engine.rows().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_enrollment_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = spawn_test_engine(dir.path());

        engine.enroll_student(dana(), photo()).await.unwrap();
        let mut again = dana();
        again.id = "43".into();
        let err = engine.enroll_student(again, photo()).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Enroll(EnrollError::DuplicateIdentity(_))
        ));
    }

    #[tokio::test]
    async fn test_add_sample_requires_roster_entry() {
        let dir = tempfile::tempdir().unwrap();
        let engine = spawn_test_engine(dir.path());

        let err = engine.add_sample("Ghost".into(), photo()).await.unwrap_err();
        assert!(matches!(err, EngineError::Enroll(EnrollError::StudentNotFound(_))));

        engine.enroll_student(dana(), photo()).await.unwrap();
        let merged = engine.add_sample("Dana".into(), photo()).await.unwrap();
        assert!(merged.merged);
    }

    #[tokio::test]
    async fn test_encode_faces_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let engine = spawn_test_engine(dir.path());

        let outcome = engine
            .encode_faces(" Eve ".into(), vec![photo(), b"garbage".to_vec(), photo()])
            .await
            .unwrap();
        assert_eq!(outcome.samples, 2);
        assert_eq!(outcome.skipped.len(), 1);

        let status = engine.status().await.unwrap();
        assert_eq!(status.identities, 1);
        assert_eq!(status.enrolled, vec!["Eve".to_string()]);
        assert_eq!(status.students, 0);
        assert_eq!(status.store_load, "missing");
        assert!(!status.store_recovered);
        assert_eq!(status.reattendance_minutes, 2);
        assert!(dir.path().join("encodings.json").exists());
    }

    #[tokio::test]
    async fn test_reload_store_picks_up_rewritten_file() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("encodings.json");
        std::fs::write(&store_path, b"[1, 2]").unwrap();
        let engine = spawn_test_engine(dir.path());

        let status = engine.status().await.unwrap();
        assert!(status.store_recovered);
        assert_eq!(status.identities, 0);

        std::fs::write(&store_path, br#"{"version": 2, "identities": {"Zed": [0.0, 1.0]}}"#).unwrap();
        let load = engine.reload_store().await.unwrap();
        assert_eq!(load, "loaded 1 identities (0 dropped)");

        let status = engine.status().await.unwrap();
        assert!(!status.store_recovered);
        assert_eq!(status.enrolled, vec!["Zed".to_string()]);
    }

    #[test]
    fn test_describe_load() {
        assert_eq!(
            describe_load(&LoadStatus::Loaded {
                identities: 3,
                dropped: 1
            }),
            "loaded 3 identities (1 dropped)"
        );
    }
}
