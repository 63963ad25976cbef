//! Configuration for probebeat.
//!
//! The task tree is read from a TOML file; process level settings may be
//! overridden from the environment.

pub mod base;
pub mod http;
pub mod meta;
pub mod metric;
pub mod ping;
pub mod tcp;
pub mod trap;
pub mod udp;

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::define::{DEFAULT_CONCURRENCY_PER_INSTANCE, DEFAULT_CONCURRENCY_PER_TASK};
use crate::resolve::{DnsLookup, SystemLookup};
use crate::semaphore::{Semaphore, SemaphorePool};

pub use base::{BaseTaskParam, Label, NetTaskParam, TaskConfig};
pub use meta::TaskMetaConfig;

pub const DEFAULT_CONFIG_PATH: &str = "probebeat.toml";
const CONTAINER_PROC_ROOT: &str = "/rootfs/proc";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no task: {0}")]
    NoTask(String),
    #[error("wrong target type: {0}")]
    WrongTargetType(String),
    #[error("wrong snmp version: {0}")]
    WrongVersion(String),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

const REQUEST_FORMATS: &[&str] = &["raw", "hex"];
const RESPONSE_FORMATS: &[&str] = &[
    "eq", "neq", "in", "nin", "startswith", "nstartswith", "endswith", "nendswith", "reg", "nreg",
    "wildcard", "nwildcard", "hex",
];

pub(crate) fn validate_request_format(format: &str) -> Result<(), ConfigError> {
    if REQUEST_FORMATS.contains(&format) {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!("request format {}", format)))
    }
}

pub(crate) fn validate_response_format(format: &str) -> Result<(), ConfigError> {
    if RESPONSE_FORMATS.contains(&format) {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!("response format {}", format)))
    }
}

/// In-flight probe limits of one task type.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct TaskConcurrencyLimitConfig {
    #[serde(default)]
    pub per_instance: u32,
    #[serde(default)]
    pub per_task: u32,
}

impl TaskConcurrencyLimitConfig {
    pub fn clean(&mut self) {
        if self.per_instance == 0 {
            self.per_instance = DEFAULT_CONCURRENCY_PER_INSTANCE;
        }
        if self.per_task == 0 {
            self.per_task = DEFAULT_CONCURRENCY_PER_TASK;
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConcurrencyLimitConfig {
    #[serde(default)]
    pub task: HashMap<String, TaskConcurrencyLimitConfig>,
}

impl ConcurrencyLimitConfig {
    pub fn clean(&mut self) {
        for limit in self.task.values_mut() {
            limit.clean();
        }
    }

    /// Limits for `task_type`, defaults when not configured.
    pub fn limits(&self, task_type: &str) -> TaskConcurrencyLimitConfig {
        let mut limit = self.task.get(task_type).copied().unwrap_or_default();
        limit.clean();
        limit
    }
}

/// Identity of the node the beat runs on, attached to custom reports.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeInfo {
    #[serde(default)]
    pub ip: String,
    #[serde(default, rename = "bk_cloud_id")]
    pub cloud_id: i32,
    #[serde(default, rename = "bk_agent_id")]
    pub agent_id: String,
}

impl NodeInfo {
    pub fn node_id(&self) -> String {
        format!("{}:{}", self.cloud_id, self.ip)
    }
}

fn default_check_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_clean_up_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_event_buffer_size() -> usize {
    10
}

/// Top level beat configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BeatConfig {
    /// Delay before a returned daemon task is started again.
    #[serde(default = "default_check_interval", with = "humantime_serde")]
    pub check_interval: Duration,
    #[serde(default = "default_clean_up_timeout", with = "humantime_serde")]
    pub clean_up_timeout: Duration,
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,
    #[serde(default)]
    pub container_mode: bool,
    /// Root of the proc filesystem. Empty picks `/proc`, or the host proc
    /// mount in container mode.
    #[serde(default)]
    pub proc_root: String,
    /// JSON lines destination. Empty writes to stdout.
    #[serde(default)]
    pub output_path: String,
    #[serde(default)]
    pub node: NodeInfo,
    #[serde(default)]
    pub concurrency_limit: ConcurrencyLimitConfig,

    #[serde(default)]
    pub tcp_task: TaskMetaConfig<tcp::TcpTaskConfig>,
    #[serde(default)]
    pub udp_task: TaskMetaConfig<udp::UdpTaskConfig>,
    #[serde(default)]
    pub http_task: TaskMetaConfig<http::HttpTaskConfig>,
    #[serde(default)]
    pub ping_task: TaskMetaConfig<ping::PingTaskConfig>,
    #[serde(default)]
    pub trap_task: TaskMetaConfig<trap::TrapConfig>,
    #[serde(default)]
    pub metricbeat_task: TaskMetaConfig<metric::MetricBeatConfig>,
}

impl Default for BeatConfig {
    fn default() -> Self {
        Self {
            check_interval: default_check_interval(),
            clean_up_timeout: default_clean_up_timeout(),
            event_buffer_size: default_event_buffer_size(),
            container_mode: false,
            proc_root: String::new(),
            output_path: String::new(),
            node: NodeInfo::default(),
            concurrency_limit: ConcurrencyLimitConfig::default(),
            tcp_task: TaskMetaConfig::default(),
            udp_task: TaskMetaConfig::default(),
            http_task: TaskMetaConfig::default(),
            ping_task: TaskMetaConfig::default(),
            trap_task: TaskMetaConfig::default(),
            metricbeat_task: TaskMetaConfig::default(),
        }
    }
}

impl BeatConfig {
    /// Load configuration from the file named by `PROBEBEAT_CONFIG` and
    /// apply environment overrides.
    ///
    /// Environment variables:
    /// - `PROBEBEAT_CONFIG`: config file path (default: "probebeat.toml")
    /// - `PROBEBEAT_CONTAINER_MODE`: `true`/`1` enables container mode
    /// - `PROBEBEAT_PROC_ROOT`: proc filesystem root
    /// - `PROBEBEAT_EVENT_BUFFER_SIZE`: event channel capacity
    ///
    /// A missing file yields the defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = env::var("PROBEBEAT_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut cfg = if Path::new(&path).exists() {
            Self::from_file(&path)?
        } else {
            tracing::warn!("config file {} not found, using defaults", path);
            Self::default()
        };
        cfg.apply_env();
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    fn apply_env(&mut self) {
        if let Ok(mode) = env::var("PROBEBEAT_CONTAINER_MODE") {
            self.container_mode = matches!(mode.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Ok(root) = env::var("PROBEBEAT_PROC_ROOT") {
            self.proc_root = root;
        }
        if let Ok(size) = env::var("PROBEBEAT_EVENT_BUFFER_SIZE") {
            if let Ok(size) = size.parse() {
                self.event_buffer_size = size;
            }
        }
    }

    /// Clean every meta config and the concurrency limits.
    pub fn clean(&mut self) -> Result<(), ConfigError> {
        self.tcp_task.clean()?;
        self.udp_task.clean()?;
        self.http_task.clean()?;
        self.ping_task.clean()?;
        self.trap_task.clean()?;
        self.metricbeat_task.clean()?;
        self.concurrency_limit.clean();
        if self.event_buffer_size == 0 {
            self.event_buffer_size = default_event_buffer_size();
        }
        Ok(())
    }

    pub fn effective_proc_root(&self) -> String {
        if !self.proc_root.is_empty() {
            self.proc_root.clone()
        } else if self.container_mode {
            CONTAINER_PROC_ROOT.to_string()
        } else {
            "/proc".to_string()
        }
    }
}

/// Process wide state handed to tasks.
pub struct RuntimeContext {
    pub container_mode: bool,
    pub proc_root: PathBuf,
    pub node: NodeInfo,
    pub concurrency: ConcurrencyLimitConfig,
    pub semaphores: SemaphorePool,
    pub lookup: Arc<dyn DnsLookup>,
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("container_mode", &self.container_mode)
            .field("proc_root", &self.proc_root)
            .field("node", &self.node)
            .finish_non_exhaustive()
    }
}

impl RuntimeContext {
    pub fn new(cfg: &BeatConfig) -> Self {
        Self {
            container_mode: cfg.container_mode,
            proc_root: PathBuf::from(cfg.effective_proc_root()),
            node: cfg.node.clone(),
            concurrency: cfg.concurrency_limit.clone(),
            semaphores: SemaphorePool::new(),
            lookup: Arc::new(SystemLookup),
        }
    }

    pub fn with_lookup(mut self, lookup: Arc<dyn DnsLookup>) -> Self {
        self.lookup = lookup;
        self
    }

    /// Semaphore for one task of `task_type`.
    pub fn semaphore(&self, task_type: &str) -> Semaphore {
        let limit = self.concurrency.limits(task_type);
        self.semaphores.get_semaphore(task_type, limit.per_instance, limit.per_task)
    }
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::new(&BeatConfig::default())
    }
}
