//! Engine configuration.
//!
//! Everything is read from environment variables. Binaries call
//! `dotenvy::dotenv()` first so a local `.env` file is honored.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use url::Url;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} is set but {missing} is not")]
    MissingCredentials {
        var: &'static str,
        missing: &'static str,
    },

    #[error("invalid value for {var}: {value}")]
    InvalidValue { var: &'static str, value: String },
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub connection_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub max_lifetime: Option<Duration>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_url: "postgresql://localhost:5432/journey".to_string(),
            max_connections: 10,
            connection_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(600)), // 10 minutes
            max_lifetime: Some(Duration::from_secs(1800)), // 30 minutes
        }
    }
}

impl DatabaseConfig {
    /// `DATABASE_URL` and `DATABASE_POOL_SIZE`, over the defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(&env_lookup)
    }

    fn from_lookup(get: &dyn Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(url) = get("DATABASE_URL") {
            cfg.database_url = url;
        }
        if let Some(n) = get("DATABASE_POOL_SIZE").and_then(|s| s.parse().ok()) {
            cfg.max_connections = n;
        }
        cfg
    }

    pub fn masked_url(&self) -> String {
        mask_database_url(&self.database_url)
    }
}

/// Mask the password in a database URL for logging.
pub fn mask_database_url(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => {
            let mut masked = parsed.clone();
            if parsed.password().is_some() {
                let _ = masked.set_password(Some("***"));
            }
            masked.to_string()
        }
        Err(_) => "<unparseable database url>".to_string(),
    }
}

/// S3-compatible object store.
#[derive(Clone)]
pub struct ObjectStoreConfig {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint (MinIO, R2, ...). `None` means AWS.
    pub endpoint: Option<Url>,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub use_path_style: bool,
    pub presign_expires: Duration,
}

impl std::fmt::Debug for ObjectStoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreConfig")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint.as_ref().map(Url::as_str))
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"***")
            .field("use_path_style", &self.use_path_style)
            .field("presign_expires", &self.presign_expires)
            .finish()
    }
}

const DEFAULT_UPLOAD_MAX_MB: i64 = 10;
const MB: i64 = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database: DatabaseConfig,
    /// Root for local uploads when no object store is configured.
    pub upload_root: PathBuf,
    /// Hard cap on any single upload. Slots may declare a lower `max_size`.
    pub max_upload_bytes: i64,
    /// Extra attempts after a serialization conflict.
    pub max_retries: u32,
    pub default_locale: String,
    pub profile_node: String,
    pub publications_node: String,
    /// Worlds whose nodes earn no scoreboard points.
    pub unscored_worlds: Vec<String>,
    pub notify_webhook_url: Option<Url>,
    pub notify_student_on_review: bool,
    pub object_store: Option<ObjectStoreConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            upload_root: PathBuf::from("./uploads"),
            max_upload_bytes: DEFAULT_UPLOAD_MAX_MB * MB,
            max_retries: 2,
            default_locale: "ru".to_string(),
            profile_node: "S1_profile".to_string(),
            publications_node: "S1_publications_list".to_string(),
            unscored_worlds: vec!["W3".to_string()],
            notify_webhook_url: None,
            notify_student_on_review: true,
            object_store: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_lookup)
    }

    /// Build from an arbitrary variable source. Unset and blank variables
    /// fall back to the defaults.
    pub fn from_lookup(get: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |k: &str| get(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut cfg = Self {
            database: DatabaseConfig::from_lookup(&get),
            ..Self::default()
        };

        if let Some(root) = get("JOURNEY_UPLOAD_ROOT") {
            cfg.upload_root = PathBuf::from(root);
        }
        if let Some(v) = get("JOURNEY_UPLOAD_MAX_MB") {
            cfg.max_upload_bytes = parse_megabytes("JOURNEY_UPLOAD_MAX_MB", &v)?;
        }
        if let Some(v) = get("JOURNEY_MAX_RETRIES") {
            cfg.max_retries = parse_num("JOURNEY_MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("JOURNEY_DEFAULT_LOCALE") {
            cfg.default_locale = v;
        }
        if let Some(v) = get("JOURNEY_PROFILE_NODE") {
            cfg.profile_node = v;
        }
        if let Some(v) = get("JOURNEY_PUBLICATIONS_NODE") {
            cfg.publications_node = v;
        }
        if let Some(v) = get("JOURNEY_UNSCORED_WORLDS") {
            cfg.unscored_worlds = v
                .split(',')
                .map(str::trim)
                .filter(|w| !w.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = get("JOURNEY_NOTIFY_WEBHOOK_URL") {
            cfg.notify_webhook_url = Some(parse_url("JOURNEY_NOTIFY_WEBHOOK_URL", &v)?);
        }
        if let Some(v) = get("JOURNEY_NOTIFY_STUDENT_ON_REVIEW") {
            cfg.notify_student_on_review = parse_bool("JOURNEY_NOTIFY_STUDENT_ON_REVIEW", &v)?;
        }
        cfg.object_store = object_store_from(&get)?;
        Ok(cfg)
    }
}

fn object_store_from(
    get: &dyn Fn(&str) -> Option<String>,
) -> Result<Option<ObjectStoreConfig>, ConfigError> {
    let Some(bucket) = get("S3_BUCKET") else {
        return Ok(None);
    };
    let access_key_id = get("S3_ACCESS_KEY_ID").ok_or(ConfigError::MissingCredentials {
        var: "S3_BUCKET",
        missing: "S3_ACCESS_KEY_ID",
    })?;
    let secret_access_key = get("S3_SECRET_ACCESS_KEY").ok_or(ConfigError::MissingCredentials {
        var: "S3_BUCKET",
        missing: "S3_SECRET_ACCESS_KEY",
    })?;
    let endpoint = get("S3_ENDPOINT")
        .map(|e| parse_url("S3_ENDPOINT", &e))
        .transpose()?;
    let use_path_style = get("S3_USE_PATH_STYLE")
        .map(|v| parse_bool("S3_USE_PATH_STYLE", &v))
        .transpose()?
        // Custom endpoints are almost always path-style.
        .unwrap_or(endpoint.is_some());
    let minutes: u64 = get("S3_PRESIGN_EXPIRES_MINUTES")
        .map(|v| parse_num("S3_PRESIGN_EXPIRES_MINUTES", &v))
        .transpose()?
        .unwrap_or(15);

    Ok(Some(ObjectStoreConfig {
        bucket,
        region: get("S3_REGION").unwrap_or_else(|| "us-east-1".to_string()),
        endpoint,
        access_key_id,
        secret_access_key,
        use_path_style,
        presign_expires: Duration::from_secs(minutes * 60),
    }))
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            var,
            value: value.to_string(),
        }),
    }
}

fn parse_num<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        var,
        value: value.to_string(),
    })
}

fn parse_megabytes(var: &'static str, value: &str) -> Result<i64, ConfigError> {
    let invalid = || ConfigError::InvalidValue {
        var,
        value: value.to_string(),
    };
    let mb: i64 = parse_num(var, value)?;
    if mb <= 0 {
        return Err(invalid());
    }
    mb.checked_mul(MB).ok_or_else(invalid)
}

fn parse_url(var: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|_| ConfigError::InvalidValue {
        var,
        value: value.to_string(),
    })
}
