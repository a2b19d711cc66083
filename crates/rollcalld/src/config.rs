use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Where winning probe frames are archived.
    pub probes_dir: PathBuf,
    /// Minimum cosine similarity for a confirmed identity.
    pub similarity_threshold: f32,
    /// Dimension of stored and extracted embeddings.
    pub embedding_dim: usize,
    /// Faces smaller than this many pixels on either side are ignored (0 = no limit).
    pub min_face_size: u32,
    /// Minimum face size for training images; never below `min_face_size`.
    pub enroll_min_face_size: u32,
    /// Seconds between population reloads.
    pub refresh_secs: u64,
    /// Seconds a D-Bus caller waits for a decision.
    pub decide_timeout_secs: u64,
    /// Maximum frames accepted per attendance request.
    pub max_frames: usize,
    /// Training samples after which an identity is reported as ready.
    pub min_samples: usize,
    /// Use the session bus instead of the system bus.
    pub session_bus: bool,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        Self {
            db_path: env_path("ROLLCALL_DB_PATH").unwrap_or_else(|| data_dir.join("rollcall.db")),
            model_dir: env_path("ROLLCALL_MODEL_DIR").unwrap_or_else(|| data_dir.join("models")),
            probes_dir: env_path("ROLLCALL_PROBES_DIR").unwrap_or_else(|| data_dir.join("probes")),
            similarity_threshold: env_parse("ROLLCALL_SIMILARITY_THRESHOLD", 0.65),
            embedding_dim: env_parse("ROLLCALL_EMBEDDING_DIM", 512),
            min_face_size: env_parse("ROLLCALL_MIN_FACE_SIZE", 0),
            enroll_min_face_size: env_parse("ROLLCALL_ENROLL_MIN_FACE_SIZE", 100),
            refresh_secs: env_parse("ROLLCALL_REFRESH_SECS", 30),
            decide_timeout_secs: env_parse("ROLLCALL_DECIDE_TIMEOUT_SECS", 10),
            max_frames: env_parse("ROLLCALL_MAX_FRAMES", 4),
            min_samples: env_parse("ROLLCALL_MIN_SAMPLES", 1),
            session_bus: std::env::var("ROLLCALL_BUS")
                .map(|v| v == "session")
                .unwrap_or(false),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join("det_10g.onnx")
    }

    /// Path to the ArcFace recognition model.
    pub fn recognizer_model_path(&self) -> PathBuf {
        self.model_dir.join("w600k_r50.onnx")
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().map(PathBuf::from)
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: fmt::Display,
{
    parse_or(key, std::env::var(key).ok(), default)
}

/// Parse a set value, or fall back to `default` with a warning if it is
/// malformed. An unset value falls back silently.
fn parse_or<T>(key: &str, raw: Option<String>, default: T) -> T
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let Some(raw) = raw else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "unparseable value; using default");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io;
    use std::sync::{Arc, Mutex};

    /// Log sink shared with a scoped subscriber.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn logged<T>(f: impl FnOnce() -> T) -> (T, String) {
        let sink = Captured::default();
        let writer = sink.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let out = tracing::subscriber::with_default(subscriber, f);
        let text = String::from_utf8(sink.0.lock().unwrap().clone()).unwrap();
        (out, text)
    }

    #[test]
    fn test_env_parse_falls_back_on_garbage() {
        std::env::set_var("ROLLCALL_TEST_GARBAGE", "not-a-number");
        assert_eq!(env_parse("ROLLCALL_TEST_GARBAGE", 0.65f32), 0.65);
        std::env::set_var("ROLLCALL_TEST_NUMBER", "0.7");
        assert_eq!(env_parse("ROLLCALL_TEST_NUMBER", 0.65f32), 0.7);
        assert_eq!(env_parse("ROLLCALL_TEST_UNSET_KEY", 4usize), 4);
    }

    #[test]
    fn test_malformed_value_is_warned() {
        let (threshold, log) = logged(|| {
            parse_or("ROLLCALL_SIMILARITY_THRESHOLD", Some("0,7".into()), 0.65f32)
        });
        assert_eq!(threshold, 0.65);
        assert!(log.contains("WARN"));
        assert!(log.contains("ROLLCALL_SIMILARITY_THRESHOLD"));
        assert!(log.contains("0,7"));

        let (frames, log) = logged(|| parse_or("ROLLCALL_MAX_FRAMES", None, 4usize));
        assert_eq!(frames, 4);
        assert!(log.is_empty());

        let (secs, log) = logged(|| parse_or("ROLLCALL_REFRESH_SECS", Some(" 15 ".into()), 30u64));
        assert_eq!(secs, 15);
        assert!(log.is_empty());
    }

    #[test]
    fn test_model_paths() {
        let cfg = Config {
            model_dir: PathBuf::from("/models"),
            ..Config::from_env()
        };
        assert_eq!(cfg.detector_model_path(), PathBuf::from("/models/det_10g.onnx"));
        assert_eq!(cfg.recognizer_model_path(), PathBuf::from("/models/w600k_r50.onnx"));
    }
}
