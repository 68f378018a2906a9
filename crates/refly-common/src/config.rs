use kdl::{KdlDocument, KdlEntry, KdlNode};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use url::Url;

use std::future::Future;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::SerDeError;

const DEFAULT_SERVER_ORIGIN: &str = "http://localhost:5800";
const DEFAULT_WS_SERVER_ORIGIN: &str = "ws://localhost:5801";

/// Errors raised while loading or saving configuration.
#[derive(Debug, thiserror::Error, Diagnostic)]
#[diagnostic(code(refly::config))]
pub enum ConfigError {
    #[error("unsupported config format: {0}")]
    #[diagnostic(help("use a .kdl or .json file"))]
    UnsupportedFormat(String),

    #[error("invalid value for `{key}`: {message}")]
    InvalidValue { key: &'static str, message: String },

    #[error("failed to read or write config file")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    #[diagnostic_source]
    Serde(#[from] SerDeError),
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serde(SerDeError::Json(err))
    }
}

impl From<kdl::KdlError> for ConfigError {
    fn from(err: kdl::KdlError) -> Self {
        Self::Serde(SerDeError::Kdl(err))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// HTTP origin of the refly API (skill invocation lives under `/v1`).
    pub server_origin: Url,
    /// WebSocket origin of the collaborative document server.
    pub ws_server_origin: Url,
    /// Bearer token for both the API and the document server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Directory for offline document snapshots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub flush_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_origin: Url::parse(DEFAULT_SERVER_ORIGIN).expect("static url"),
            ws_server_origin: Url::parse(DEFAULT_WS_SERVER_ORIGIN).expect("static url"),
            token: None,
            data_dir: None,
            reconnect_delay_ms: 3_000,
            max_reconnect_attempts: 3,
            flush_timeout_ms: 2_000,
        }
    }
}

impl Config {
    /// Loads the configuration from the provided loader.
    pub async fn load(loader: &impl Loader) -> Result<Self, ConfigError> {
        loader.load().await
    }

    /// Saves the configuration using the provided saver.
    pub async fn save(&self, saver: &impl Saver) -> Result<(), ConfigError> {
        saver.save(self).await
    }

    /// Load from `path` if it exists, else start from defaults. Environment
    /// overrides are applied in both cases.
    pub async fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config = if path.exists() {
            Self::load(&FileStore::new(path)).await?
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Self::default()
        };
        config.with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `REFLY_*` overrides. `lookup` is injected so tests need not touch
    /// the process environment.
    pub fn with_env_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(origin) = lookup("REFLY_SERVER_ORIGIN") {
            self.server_origin = parse_url("server-origin", &origin)?;
        }
        if let Some(origin) = lookup("REFLY_WS_SERVER_ORIGIN") {
            self.ws_server_origin = parse_url("ws-server-origin", &origin)?;
        }
        if let Some(token) = lookup("REFLY_TOKEN") {
            self.token = Some(token);
        }
        if let Some(dir) = lookup("REFLY_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(dir));
        }
        Ok(self)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    /// Where offline snapshots go: the configured directory, else the
    /// platform data dir.
    pub fn documents_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("refly")
                .join("documents")
        })
    }

    /// Default config location: `<config_dir>/refly/config.kdl`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("refly").join("config.kdl"))
    }

    fn from_kdl(doc: &KdlDocument) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(origin) = kdl_string(doc, "server-origin") {
            config.server_origin = parse_url("server-origin", origin)?;
        }
        if let Some(origin) = kdl_string(doc, "ws-server-origin") {
            config.ws_server_origin = parse_url("ws-server-origin", origin)?;
        }
        config.token = kdl_string(doc, "token").map(str::to_owned);
        config.data_dir = kdl_string(doc, "data-dir").map(PathBuf::from);
        if let Some(ms) = kdl_u64(doc, "reconnect-delay-ms")? {
            config.reconnect_delay_ms = ms;
        }
        if let Some(n) = kdl_u64(doc, "max-reconnect-attempts")? {
            config.max_reconnect_attempts =
                u32::try_from(n).map_err(|e| ConfigError::InvalidValue {
                    key: "max-reconnect-attempts",
                    message: e.to_string(),
                })?;
        }
        if let Some(ms) = kdl_u64(doc, "flush-timeout-ms")? {
            config.flush_timeout_ms = ms;
        }

        Ok(config)
    }

    fn to_kdl(&self) -> KdlDocument {
        let mut doc = KdlDocument::new();
        let nodes = doc.nodes_mut();
        nodes.push(kdl_node("server-origin", self.server_origin.as_str()));
        nodes.push(kdl_node("ws-server-origin", self.ws_server_origin.as_str()));
        if let Some(token) = &self.token {
            nodes.push(kdl_node("token", token.as_str()));
        }
        if let Some(dir) = &self.data_dir {
            nodes.push(kdl_node("data-dir", dir.to_string_lossy().as_ref()));
        }
        nodes.push(kdl_node("reconnect-delay-ms", self.reconnect_delay_ms as i64));
        nodes.push(kdl_node(
            "max-reconnect-attempts",
            self.max_reconnect_attempts as i64,
        ));
        nodes.push(kdl_node("flush-timeout-ms", self.flush_timeout_ms as i64));
        doc.fmt();
        doc
    }
}

fn parse_url(key: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|e| ConfigError::InvalidValue {
        key,
        message: e.to_string(),
    })
}

fn kdl_string<'a>(doc: &'a KdlDocument, name: &str) -> Option<&'a str> {
    doc.get(name)?.entries().first()?.value().as_string()
}

fn kdl_u64(doc: &KdlDocument, name: &'static str) -> Result<Option<u64>, ConfigError> {
    let Some(entry) = doc.get(name).and_then(|node| node.entries().first()) else {
        return Ok(None);
    };
    let value = entry
        .value()
        .as_i64()
        .ok_or_else(|| ConfigError::InvalidValue {
            key: name,
            message: "expected an integer".into(),
        })?;
    u64::try_from(value)
        .map(Some)
        .map_err(|e| ConfigError::InvalidValue {
            key: name,
            message: e.to_string(),
        })
}

fn kdl_node(name: &str, value: impl Into<kdl::KdlValue>) -> KdlNode {
    let mut node = KdlNode::new(name);
    node.push(KdlEntry::new(value));
    node
}

/// The trait for loading configuration data.
pub trait Loader {
    /// Loads the configuration data.
    fn load(&self) -> impl Future<Output = Result<Config, ConfigError>> + Send;
}

/// The trait for saving configuration data.
pub trait Saver {
    /// Saves the configuration data.
    fn save(&self, config: &Config) -> impl Future<Output = Result<(), ConfigError>> + Send;
}

/// An implementation of [`Loader`] and [`Saver`] that reads and writes a configuration file.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Create a new [`FileStore`] with the given path.
    ///
    /// [`Config`] data is serialized by file extension: `.kdl` or `.json`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn extension(&self) -> Option<&str> {
        self.path.extension().and_then(|ext| ext.to_str())
    }
}

impl Loader for FileStore {
    async fn load(&self) -> Result<Config, ConfigError> {
        match self.extension() {
            Some("kdl") => {
                let doc: KdlDocument = std::fs::read_to_string(&self.path)?.parse()?;
                Config::from_kdl(&doc)
            }
            Some("json") => Ok(serde_json::from_str(&std::fs::read_to_string(&self.path)?)?),
            other => Err(ConfigError::UnsupportedFormat(
                other.unwrap_or_default().to_owned(),
            )),
        }
    }
}

impl Saver for FileStore {
    async fn save(&self, config: &Config) -> Result<(), ConfigError> {
        let contents = match self.extension() {
            Some("kdl") => config.to_kdl().to_string(),
            Some("json") => serde_json::to_string_pretty(config)?,
            other => {
                return Err(ConfigError::UnsupportedFormat(
                    other.unwrap_or_default().to_owned(),
                ));
            }
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, contents)?;
        Ok(())
    }
}
