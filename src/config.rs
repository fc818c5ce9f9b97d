//! Configuration for the gateway and the workers.
//!
//! Built-in defaults, then an optional TOML file, then `GATEWIRE__`
//! environment variables (`GATEWIRE__GATEWAY__LISTEN=0.0.0.0:8080`,
//! `GATEWIRE__GATEWAY__SERVICES__NOTE__ENDPOINT=unix:/run/note.sock`).

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ::config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::codec::CodecKind;
use crate::envelope::{AI_SERVICE, NOTE_SERVICE, RESOURCE_SERVICE};
use crate::error::Result;
use crate::protocol::DEFAULT_MAX_PAYLOAD_SIZE;
use crate::router::{DEFAULT_RECONNECT_DELAY, DEFAULT_REQUEST_TIMEOUT, DEFAULT_SWEEP_INTERVAL};
use crate::transport::Endpoint;
use crate::worker::DEFAULT_MAX_CONCURRENT_HANDLERS;
use crate::writer::DEFAULT_CHANNEL_CAPACITY;

/// Prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "GATEWIRE";

/// Everything the binary can run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub gateway: GatewayConfig,
    pub note: NoteConfig,
    pub resource: ResourceConfig,
    pub ai: AiConfig,
}

impl Settings {
    /// Load settings, layering `path` (if any) and the environment over the
    /// defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Like [`Settings::load`], reading variables from `env` instead of the
    /// process environment when given.
    pub fn load_with_env(path: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Settings::default())?);

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }

        let environment = Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
            .source(env);

        let settings = builder.add_source(environment).build()?.try_deserialize()?;
        Ok(settings)
    }
}

/// A worker as seen from the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub endpoint: Endpoint,
    pub codec: CodecKind,
}

/// Gateway settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// HTTP listen address.
    pub listen: String,
    /// Directory served for unrouted paths (the resource worker's uploads).
    pub static_dir: PathBuf,
    pub max_body_size: usize,
    pub request_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    pub reconnect_delay_ms: u64,
    pub channel_capacity: usize,
    pub max_payload_size: u32,
    /// Workers by service name.
    pub services: BTreeMap<String, ServiceConfig>,
}

impl GatewayConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let services = [
            (NOTE_SERVICE, "127.0.0.1:3001", CodecKind::Unary),
            (RESOURCE_SERVICE, "127.0.0.1:3002", CodecKind::Unary),
            (AI_SERVICE, "127.0.0.1:50051", CodecKind::Streaming),
        ]
        .into_iter()
        .map(|(name, addr, codec)| {
            (
                name.to_string(),
                ServiceConfig {
                    endpoint: Endpoint::tcp(addr),
                    codec,
                },
            )
        })
        .collect();

        Self {
            listen: "0.0.0.0:3000".to_string(),
            static_dir: PathBuf::from("files"),
            max_body_size: crate::http::DEFAULT_MAX_BODY_SIZE,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT.as_millis() as u64,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL.as_millis() as u64,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY.as_millis() as u64,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            services,
        }
    }
}

/// Settings shared by every worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub listen: Endpoint,
    pub max_concurrent_handlers: usize,
    pub channel_capacity: usize,
    pub max_payload_size: u32,
}

impl WorkerConfig {
    fn listening_on(addr: &str) -> Self {
        Self {
            listen: Endpoint::tcp(addr),
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::listening_on("127.0.0.1:0")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoteConfig {
    pub worker: WorkerConfig,
    /// Where note files live.
    pub dir: PathBuf,
}

impl Default for NoteConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::listening_on("127.0.0.1:3001"),
            dir: PathBuf::from("files"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    pub worker: WorkerConfig,
    /// Where uploads are stored.
    pub dir: PathBuf,
    /// Base of the URLs returned for uploads; the gateway serves `dir` here.
    pub public_base_url: String,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::listening_on("127.0.0.1:3002"),
            dir: PathBuf::from("files"),
            public_base_url: "http://127.0.0.1:3000".to_string(),
        }
    }
}

/// Which chat backend the AI worker uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatBackendKind {
    Echo,
    Ollama,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
    /// Bearer token; `OLLAMA_API_KEY` is used when unset.
    pub api_key: Option<String>,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: "https://ollama.com".to_string(),
            model: "luonglkvn100/mika".to_string(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub worker: WorkerConfig,
    pub backend: ChatBackendKind,
    /// Pause before each chunk of the echo backend.
    pub echo_delay_ms: u64,
    pub ollama: OllamaConfig,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::listening_on("127.0.0.1:50051"),
            backend: ChatBackendKind::Echo,
            echo_delay_ms: 0,
            ollama: OllamaConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(vars: &[(&str, &str)]) -> Option<HashMap<String, String>> {
        Some(
            vars.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_defaults_match_deployment() {
        let settings = Settings::load_with_env(None, env(&[])).unwrap();

        assert_eq!(settings, Settings::default());
        assert_eq!(settings.gateway.listen, "0.0.0.0:3000");
        assert_eq!(
            settings.gateway.services[AI_SERVICE],
            ServiceConfig {
                endpoint: Endpoint::tcp("127.0.0.1:50051"),
                codec: CodecKind::Streaming,
            }
        );
        assert_eq!(settings.note.worker.listen, Endpoint::tcp("127.0.0.1:3001"));
        assert_eq!(settings.gateway.request_timeout(), DEFAULT_REQUEST_TIMEOUT);
    }

    #[test]
    fn test_file_then_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gatewire.toml");
        std::fs::write(
            &path,
            r#"
[gateway]
listen = "127.0.0.1:8080"
request_timeout_ms = 500

[gateway.services.note]
endpoint = "127.0.0.1:4001"
codec = "unary"

[ai]
backend = "ollama"
"#,
        )
        .unwrap();

        let settings = Settings::load_with_env(
            Some(&path),
            env(&[
                ("GATEWIRE__GATEWAY__LISTEN", "127.0.0.1:9090"),
                ("GATEWIRE__NOTE__DIR", "/tmp/notes"),
            ]),
        )
        .unwrap();

        assert_eq!(settings.gateway.listen, "127.0.0.1:9090");
        assert_eq!(settings.gateway.request_timeout(), Duration::from_millis(500));
        assert_eq!(
            settings.gateway.services[NOTE_SERVICE].endpoint,
            Endpoint::tcp("127.0.0.1:4001")
        );
        // Services the file leaves out keep their defaults.
        assert!(settings.gateway.services.contains_key(RESOURCE_SERVICE));
        assert_eq!(settings.ai.backend, ChatBackendKind::Ollama);
        assert_eq!(settings.note.dir, PathBuf::from("/tmp/notes"));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(Settings::load_with_env(Some(Path::new("/nonexistent/gatewire.toml")), env(&[])).is_err());
    }
}
