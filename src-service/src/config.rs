//! Service configuration.
//!
//! Loaded from a JSON file (explicit `--config` path, or the platform config
//! directory), then overridden by command line flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use asrbridge_common::protocol::{Framing, DEFAULT_HTTP_PORT, DEFAULT_TCP_PORT, DEFAULT_UDP_PORT};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const CONFIG_FILE_NAME: &str = "service.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// One external command in an engine pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Which stream of the last pipeline stage carries hypotheses.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    #[default]
    Stdout,
    Stderr,
}

/// How to launch one engine.
///
/// Model, graph and config paths live inside `args` and are passed through
/// untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Commands chained stdout -> stdin; audio goes into the first one
    pub stages: Vec<CommandSpec>,
    #[serde(default)]
    pub output: OutputStream,
    /// Stream mode only: treat only `<digits> <text>` lines as hypotheses
    /// and strip the numeric utterance id
    #[serde(default)]
    pub require_utterance_id: bool,
}

impl EngineConfig {
    /// Single-stage engine reading hypotheses from stdout.
    pub fn single(command: CommandSpec) -> Self {
        Self {
            stages: vec![command],
            output: OutputStream::Stdout,
            require_utterance_id: false,
        }
    }

    fn validate(&self, label: &str) -> Result<(), ConfigError> {
        if self.stages.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "{} has no pipeline stages",
                label
            )));
        }
        if let Some(stage) = self.stages.iter().find(|s| s.program.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "{} has a stage with an empty program (args: {:?})",
                label, stage.args
            )));
        }
        Ok(())
    }
}

/// Top-level service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Address all listeners bind to
    pub host: String,
    pub http_port: u16,
    pub tcp_port: u16,
    pub udp_port: u16,
    /// Engines started at launch for file decoding
    pub batch_engines: Vec<EngineConfig>,
    /// Engine used for live streaming sessions
    pub stream_engine: Option<EngineConfig>,
    /// Streaming engines started at launch. 0 spawns one engine per session.
    pub stream_pool_size: usize,
    pub batch_timeout_ms: u64,
    /// Where uploaded audio is spooled while it is decoded
    pub upload_dir: PathBuf,
    /// Per-session hypothesis queue depth
    pub subscriber_capacity: usize,
    /// How long to keep delivering hypotheses after a client stops sending
    pub session_linger_ms: u64,
    pub udp_idle_timeout_ms: u64,
    /// Read size for inbound audio on stream and datagram transports
    pub read_chunk_size: usize,
    pub tcp_framing: Framing,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: DEFAULT_HTTP_PORT,
            tcp_port: DEFAULT_TCP_PORT,
            udp_port: DEFAULT_UDP_PORT,
            batch_engines: Vec::new(),
            stream_engine: None,
            stream_pool_size: 0,
            batch_timeout_ms: 30_000,
            upload_dir: std::env::temp_dir().join("asrbridge-uploads"),
            subscriber_capacity: 64,
            session_linger_ms: 500,
            udp_idle_timeout_ms: 10_000,
            read_chunk_size: 1024,
            tcp_framing: Framing::Length,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from `path`, or from the default location if none
    /// is given. A missing default file yields the built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => {
                    tracing::info!("No config file found, using defaults");
                    Self::default()
                }
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (i, engine) in self.batch_engines.iter().enumerate() {
            engine.validate(&format!("batch_engines[{}]", i))?;
        }
        if let Some(engine) = &self.stream_engine {
            engine.validate("stream_engine")?;
        }
        if self.stream_pool_size > 0 && self.stream_engine.is_none() {
            return Err(ConfigError::Invalid(
                "stream_pool_size is set but no stream_engine is configured".into(),
            ));
        }
        if self.subscriber_capacity == 0 {
            return Err(ConfigError::Invalid("subscriber_capacity must be > 0".into()));
        }
        if self.read_chunk_size == 0 {
            return Err(ConfigError::Invalid("read_chunk_size must be > 0".into()));
        }
        // tcp and udp live in separate port spaces, http and tcp do not
        if self.http_port == self.tcp_port {
            return Err(ConfigError::Invalid(format!(
                "http_port and tcp_port are both {}",
                self.http_port
            )));
        }
        Ok(())
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn session_linger(&self) -> Duration {
        Duration::from_millis(self.session_linger_ms)
    }

    pub fn udp_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.udp_idle_timeout_ms)
    }
}

/// `<config dir>/asrbridge/service.json`
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "asrbridge")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "tcp_port": 20001,
                "batch_engines": [
                    {{ "stages": [
                        {{ "program": "./file-decoder", "args": ["--config=conf/online.conf", "scp:-", "ark:-"] }},
                        {{ "program": "lattice-best-path", "args": ["ark:-", "ark:-"] }}
                    ], "output": "stderr" }}
                ]
            }}"#
        )
        .unwrap();

        let config = ServiceConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.tcp_port, 20001);
        assert_eq!(config.http_port, DEFAULT_HTTP_PORT);
        assert_eq!(config.batch_engines.len(), 1);
        assert_eq!(config.batch_engines[0].stages.len(), 2);
        assert_eq!(config.batch_engines[0].output, OutputStream::Stderr);
        assert_eq!(config.tcp_framing, Framing::Length);
    }

    #[test]
    fn empty_pipeline_is_rejected() {
        let config = ServiceConfig {
            batch_engines: vec![EngineConfig {
                stages: vec![],
                output: OutputStream::Stdout,
                require_utterance_id: false,
            }],
            ..ServiceConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn stream_pool_requires_stream_engine() {
        let config = ServiceConfig {
            stream_pool_size: 2,
            ..ServiceConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_file_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        match ServiceConfig::load(Some(file.path())) {
            Err(ConfigError::Parse { path, .. }) => assert_eq!(path, file.path()),
            other => panic!("expected parse error, got {:?}", other),
        }
    }
}
