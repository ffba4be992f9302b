use std::path::PathBuf;
use std::time::Duration;

/// Upper bound for a single multipart part body. Matches the minimum
/// non-final part size accepted by S3-compatible stores.
pub const MAX_PART_BYTES: usize = 5 * 1024 * 1024;

/// Grace period between SIGINT and SIGKILL for encoder processes.
pub const ENCODER_STOP_GRACE: Duration = Duration::from_secs(10);

/// Interval the browser is given to settle before capture starts,
/// avoiding a black first frame.
pub const BROWSER_SETTLE: Duration = Duration::from_secs(3);

/// Deadline for a single chunk upload job in segmented mode.
pub const CHUNK_UPLOAD_DEADLINE: Duration = Duration::from_secs(20);

#[derive(Debug, Clone)]
pub struct BucketConfig {
    pub name: String,
    pub endpoint: String,
    pub region: String,
    pub key_id: String,
    pub app_key: String,
}

#[derive(Debug, Clone)]
pub struct DisplayConfig {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            depth: 24,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub recording_dir: PathBuf,
    pub display: DisplayConfig,
    pub bucket: BucketConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let port = match get("PAGECAST_PORT") {
            Some(v) => v.parse()?,
            None => 3000,
        };

        let recording_dir = get("PAGECAST_RECORDING_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./recordings"));

        let required = |key: &str| {
            get(key).ok_or_else(|| anyhow::anyhow!("missing environment variable {key}"))
        };

        let bucket = BucketConfig {
            name: required("BUCKET_NAME")?,
            endpoint: required("BUCKET_ENDPOINT")?,
            region: get("BUCKET_REGION").unwrap_or_else(|| "us-east-1".to_string()),
            key_id: required("BUCKET_KEY_ID")?,
            app_key: required("BUCKET_APP_KEY")?,
        };

        Ok(Self {
            port,
            recording_dir,
            display: DisplayConfig::default(),
            bucket,
        })
    }

    /// Directory segmented recordings for `pipeline_id` are written into.
    pub fn pipeline_dir(&self, pipeline_id: &str) -> PathBuf {
        self.recording_dir.join(pipeline_id)
    }
}
