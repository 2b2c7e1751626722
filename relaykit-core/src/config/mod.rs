use std::{path::Path, time::Duration};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::{max_parallel_count, AnyResult};

// MAX configuration file size: 1 MB
const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;
// Default iouring/epoll entries: 1k
const DEFAULT_ENTRIES: u32 = 1024;
// Expirator sweeps every 10 minutes by default.
const DEFAULT_SWEEP_INTERVAL_SEC: u64 = 10 * 60;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 500;
const DEFAULT_HTTP_PORT: u16 = 80;

macro_rules! define_const {
    ($name: ident, $val: expr, $type: ty) => {
        const fn $name() -> $type {
            $val
        }
    };
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub tasks: TaskPoolConfig,
    #[serde(default)]
    pub expirator: ExpiratorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub runtime_type: RuntimeType,
    #[serde(default = "default_entries")]
    pub entries: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            runtime_type: Default::default(),
            entries: default_entries(),
        }
    }
}

define_const!(default_entries, DEFAULT_ENTRIES, u32);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeType {
    #[cfg(target_os = "linux")]
    IoUring,
    Legacy,
}

impl Default for RuntimeType {
    #[cfg(target_os = "linux")]
    fn default() -> Self {
        Self::IoUring
    }
    #[cfg(not(target_os = "linux"))]
    fn default() -> Self {
        Self::Legacy
    }
}

/// Where and how the HTTP transport talks to the service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientConfig {
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    // Sent as User-Agent.
    #[serde(default = "default_client_name")]
    pub client_name: String,
    // Media-type vendor tag, e.g. `opensoft` for `application/vnd.opensoft+json`.
    pub vendor: Option<String>,
    pub connect_timeout_sec: Option<u64>,
    pub read_timeout_sec: Option<u64>,
    #[serde(default)]
    pub auth: RestAuth,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            scheme: default_scheme(),
            host: default_host(),
            port: default_port(),
            client_name: default_client_name(),
            vendor: None,
            connect_timeout_sec: None,
            read_timeout_sec: None,
            auth: RestAuth::default(),
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_sec.map(Duration::from_secs)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_sec.map(Duration::from_secs)
    }
}

/// Credentials the transport signs requests with.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RestAuth {
    #[default]
    NoAuth,
    Basic {
        #[serde(default)]
        user_name: String,
        #[serde(default)]
        password: String,
    },
    Wsse {
        #[serde(default)]
        user_name: String,
        #[serde(default)]
        password: String,
    },
    BearerToken {
        #[serde(default)]
        token: String,
    },
}

impl RestAuth {
    /// Whether the credentials are missing what this auth type needs to sign a request.
    pub fn is_logged_out(&self) -> bool {
        match self {
            RestAuth::NoAuth => false,
            RestAuth::Basic {
                user_name,
                password,
            } => user_name.is_empty() || password.is_empty(),
            RestAuth::Wsse { user_name, .. } => user_name.is_empty(),
            RestAuth::BearerToken { token } => token.is_empty(),
        }
    }
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_client_name() -> String {
    concat!("relaykit/", env!("CARGO_PKG_VERSION")).to_string()
}

define_const!(default_port, DEFAULT_HTTP_PORT, u16);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPoolConfig {
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

impl Default for TaskPoolConfig {
    fn default() -> Self {
        TaskPoolConfig {
            worker_threads: default_worker_threads(),
        }
    }
}

fn default_worker_threads() -> usize {
    max_parallel_count().get()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpiratorConfig {
    #[serde(default = "default_sweep_interval_sec")]
    pub sweep_interval_sec: u64,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    // The sweep thread only sleeps, io_uring buys it nothing.
    #[serde(default = "default_expirator_runtime")]
    pub runtime: RuntimeConfig,
}

impl Default for ExpiratorConfig {
    fn default() -> Self {
        ExpiratorConfig {
            sweep_interval_sec: default_sweep_interval_sec(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            runtime: default_expirator_runtime(),
        }
    }
}

fn default_expirator_runtime() -> RuntimeConfig {
    RuntimeConfig {
        runtime_type: RuntimeType::Legacy,
        ..Default::default()
    }
}

impl ExpiratorConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_sec)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

define_const!(default_sweep_interval_sec, DEFAULT_SWEEP_INTERVAL_SEC, u64);
define_const!(default_shutdown_timeout_ms, DEFAULT_SHUTDOWN_TIMEOUT_MS, u64);

impl Config {
    pub fn load(path: impl AsRef<Path>) -> AnyResult<Self> {
        let path = path.as_ref();
        let size = std::fs::metadata(path)
            .with_context(|| format!("Config: error reading metadata of {}", path.display()))?
            .len();
        if size > MAX_CONFIG_FILE_SIZE {
            bail!("Config: max file size: {}", MAX_CONFIG_FILE_SIZE);
        }
        let content = std::fs::read(path)
            .with_context(|| format!("Config: error open file {}", path.display()))?;
        Self::from_slice(&content)
    }

    pub fn from_slice(content: &[u8]) -> AnyResult<Self> {
        // read first non-space u8
        let is_json = match content
            .iter()
            .find(|&&b| b != b' ' && b != b'\r' && b != b'\n' && b != b'\t')
        {
            Some(first) => *first == b'{',
            None => false,
        };
        match is_json {
            true => serde_json::from_slice::<Self>(content).map_err(Into::into),
            false => toml::from_str::<Self>(&String::from_utf8_lossy(content)).map_err(Into::into),
        }
    }
}
