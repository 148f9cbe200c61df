use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::object_store::DEFAULT_PART_SIZE;

/// Smallest non-final part Cloud Storage accepts in a multipart upload.
const GCS_MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Tenant prefix prepended to every namespace's physical name
    pub system_name: String,
    /// Root for local objects; staging lives in `<work_dir>/.staging`
    pub work_dir: PathBuf,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Gcs,
    Local,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Location for newly created buckets
    pub region: String,
    pub part_size: u64,
    /// Parts in flight per write
    pub upload_concurrency: usize,
    /// Project that owns created buckets (defaults to the key file's)
    pub gcs_project: Option<String>,
    /// Path to GCS service account JSON (optional, defaults to the metadata server)
    pub gcs_credentials_file: Option<String>,
    pub request_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Local,
            region: "EU".to_string(),
            part_size: DEFAULT_PART_SIZE,
            upload_concurrency: 1,
            gcs_project: None,
            gcs_credentials_file: None,
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            system_name: "stowage".to_string(),
            work_dir: PathBuf::from("."),
            storage: StorageConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from any key lookup, then validate it.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let system_name = lookup("SYSTEM_NAME").unwrap_or(defaults.system_name);
        let work_dir = lookup("WORK_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.work_dir);

        let backend = match lookup("STORAGE_BACKEND")
            .unwrap_or_else(|| "local".to_string())
            .to_lowercase()
            .as_str()
        {
            "gcs" => StorageBackend::Gcs,
            "local" => StorageBackend::Local,
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "STORAGE_BACKEND must be 'local' or 'gcs', got '{other}'"
                )))
            }
        };

        let region = lookup("STORAGE_REGION").unwrap_or(defaults.storage.region);
        let part_size = parse(&lookup, "PART_SIZE")?.unwrap_or(defaults.storage.part_size);
        let upload_concurrency = parse(&lookup, "UPLOAD_CONCURRENCY")?
            .unwrap_or(defaults.storage.upload_concurrency);
        let request_timeout = parse(&lookup, "REQUEST_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.storage.request_timeout);

        let config = Config {
            system_name,
            work_dir,
            storage: StorageConfig {
                backend,
                region,
                part_size,
                upload_concurrency,
                gcs_project: lookup("GCS_PROJECT"),
                gcs_credentials_file: lookup("GCS_CREDENTIALS_FILE"),
                request_timeout,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.system_name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "SYSTEM_NAME cannot be empty".to_string(),
            ));
        }

        if self.storage.part_size == 0 {
            return Err(ConfigError::ValidationError(
                "PART_SIZE must be greater than zero".to_string(),
            ));
        }

        if self.storage.upload_concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "UPLOAD_CONCURRENCY must be at least 1".to_string(),
            ));
        }

        if self.storage.backend == StorageBackend::Gcs && self.storage.part_size < GCS_MIN_PART_SIZE
        {
            return Err(ConfigError::ValidationError(format!(
                "PART_SIZE must be at least {GCS_MIN_PART_SIZE} bytes when STORAGE_BACKEND=gcs"
            )));
        }

        Ok(())
    }

    /// Directory that holds in-flight remote writes.
    pub fn staging_dir(&self) -> PathBuf {
        self.work_dir.join(".staging")
    }
}

fn parse<F, T>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(key)
        .map(|raw| {
            raw.trim().parse().map_err(|_| {
                ConfigError::ValidationError(format!("{key} is not a valid number: '{raw}'"))
            })
        })
        .transpose()
}
