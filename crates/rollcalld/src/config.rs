use rollcall_core::attendance::{DEFAULT_MATCH_THRESHOLD, DEFAULT_REATTENDANCE_MINUTES};
use rollcall_core::RecorderConfig;
use std::path::PathBuf;
use std::str::FromStr;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding `det_10g.onnx` and `w600k_r50.onnx`.
    pub model_dir: PathBuf,
    /// SQLite database with the roster and attendance log.
    pub db_path: PathBuf,
    /// JSON embedding store.
    pub store_path: PathBuf,
    /// Minimum cosine similarity for a match to count.
    pub match_threshold: f32,
    /// Minutes before a student can be re-marked.
    pub reattendance_minutes: i64,
    /// Render annotated JPEG copies of uploaded photos.
    pub annotate: bool,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let path = |key: &str, default: PathBuf| var(key).map(PathBuf::from).unwrap_or(default);

        Self {
            model_dir: path("ROLLCALL_MODEL_DIR", data_dir.join("models")),
            db_path: path("ROLLCALL_DB_PATH", data_dir.join("rollcall.db")),
            store_path: path("ROLLCALL_STORE_PATH", data_dir.join("encodings.json")),
            match_threshold: parse(var("ROLLCALL_MATCH_THRESHOLD"))
                .unwrap_or(DEFAULT_MATCH_THRESHOLD),
            reattendance_minutes: parse(var("ROLLCALL_REATTENDANCE_MINUTES"))
                .filter(|m: &i64| *m >= 0)
                .unwrap_or(DEFAULT_REATTENDANCE_MINUTES),
            annotate: var("ROLLCALL_ANNOTATE").map(|v| v != "0").unwrap_or(true),
        }
    }

    pub fn recorder_config(&self) -> RecorderConfig {
        RecorderConfig {
            match_threshold: self.match_threshold,
            reattendance_interval: chrono::Duration::minutes(self.reattendance_minutes),
        }
    }
}

fn parse<T: FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|v| v.trim().parse().ok())
}
