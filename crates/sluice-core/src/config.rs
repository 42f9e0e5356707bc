//! Configuration system for sluice.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $SLUICE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/sluice/config.toml
//!   3. ~/.config/sluice/config.toml

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::policy::{DataDistribution, DistributionMode, MemoryLocation, MinData, SlownessPolicy};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SluiceConfig {
    pub pool: PoolConfig,
    pub output: OutputConfig,
    pub input: InputConfig,
    /// Known producer endpoints, looked up by `instanceId:channelName`.
    pub endpoints: Vec<EndpointConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_channels: usize,
    pub max_chunks_per_channel: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Hostname advertised in connection info.
    pub hostname: String,
    /// TCP listen port. 0 = OS-assigned.
    pub port: u16,
    /// Pick a random port in `[lo, hi]` instead of `port`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_range: Option<(u16, u16)>,
    /// Bind retries before giving up.
    pub bind_attempts: u32,
    pub distribution_mode: DistributionMode,
    /// Policy when no shared consumer can take a chunk.
    pub no_input_shared: SlownessPolicy,
    pub wait_poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    pub data_distribution: DataDistribution,
    pub on_slowness: SlownessPolicy,
    /// 0 = all data up to end-of-stream, 0xFFFFFFFF = no gating.
    pub min_data: MinData,
    pub keep_data_until_new: bool,
    pub respond_to_end_of_stream: bool,
    /// Delay before telling a producer we are ready again.
    pub delay_on_input_ms: u64,
    /// `instanceId:channelName` references of producers to connect to.
    pub connected_output_channels: Vec<String>,
}

/// Where a named producer can be reached. Stands in for discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// `instanceId:channelName`.
    pub id: String,
    pub hostname: String,
    pub port: u16,
    #[serde(default)]
    pub memory_location: MemoryLocation,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_channels: 128,
            max_chunks_per_channel: 2056,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            port: 0,
            port_range: None,
            bind_attempts: 50,
            distribution_mode: DistributionMode::LoadBalanced,
            no_input_shared: SlownessPolicy::Wait,
            wait_poll_interval_ms: 1,
        }
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            data_distribution: DataDistribution::Copy,
            on_slowness: SlownessPolicy::Wait,
            min_data: MinData::Count(1),
            keep_data_until_new: false,
            respond_to_end_of_stream: true,
            delay_on_input_ms: 0,
            connected_output_channels: Vec::new(),
        }
    }
}

// ── Connection info ───────────────────────────────────────────────────────────

/// How to reach an output channel. Exchanged out of band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub connection_type: String,
    pub hostname: String,
    pub port: u16,
    pub memory_location: MemoryLocation,
}

impl ConnectionInfo {
    pub fn tcp(hostname: impl Into<String>, port: u16, memory_location: MemoryLocation) -> Self {
        Self {
            connection_type: "tcp".to_string(),
            hostname: hostname.into(),
            port,
            memory_location,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

impl From<&EndpointConfig> for ConnectionInfo {
    fn from(e: &EndpointConfig) -> Self {
        ConnectionInfo::tcp(e.hostname.clone(), e.port, e.memory_location)
    }
}

/// Parsed `instanceId:channelName` reference. `instanceId@channelName` is
/// accepted as well.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputChannelRef {
    pub instance_id: String,
    pub channel_name: String,
}

impl FromStr for OutputChannelRef {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (instance_id, channel_name) = s
            .split_once(':')
            .or_else(|| s.split_once('@'))
            .ok_or_else(|| ConfigError::BadChannelRef(s.to_string()))?;
        if instance_id.is_empty() || channel_name.is_empty() {
            return Err(ConfigError::BadChannelRef(s.to_string()));
        }
        Ok(Self {
            instance_id: instance_id.to_string(),
            channel_name: channel_name.to_string(),
        })
    }
}

impl fmt::Display for OutputChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.instance_id, self.channel_name)
    }
}

impl InputConfig {
    pub fn output_channel_refs(&self) -> Result<Vec<OutputChannelRef>, ConfigError> {
        self.connected_output_channels
            .iter()
            .map(|s| s.parse())
            .collect()
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("sluice")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("bad output channel reference {0:?}, expected instanceId:channelName")]
    BadChannelRef(String),
    #[error("no endpoint configured for {0}")]
    UnknownEndpoint(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl SluiceConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            SluiceConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("SLUICE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&SluiceConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Connection info for every `connected_output_channels` entry.
    pub fn resolve_connected(&self) -> Result<Vec<(OutputChannelRef, ConnectionInfo)>, ConfigError> {
        self.input
            .output_channel_refs()?
            .into_iter()
            .map(|r| {
                let id = r.to_string();
                let endpoint = self
                    .endpoints
                    .iter()
                    .find(|e| e.id.parse::<OutputChannelRef>().ok().as_ref() == Some(&r))
                    .ok_or(ConfigError::UnknownEndpoint(id))?;
                Ok((r, ConnectionInfo::from(endpoint)))
            })
            .collect()
    }

    /// Apply SLUICE_* overrides. Unparseable values are ignored.
    fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        fn set<T: FromStr>(slot: &mut T, value: Option<String>) {
            if let Some(v) = value.and_then(|v| v.parse().ok()) {
                *slot = v;
            }
        }
        fn flag(slot: &mut bool, value: Option<String>) {
            if let Some(v) = value {
                *slot = v == "true" || v == "1";
            }
        }

        set(&mut self.pool.max_channels, var("SLUICE_POOL__MAX_CHANNELS"));
        set(
            &mut self.pool.max_chunks_per_channel,
            var("SLUICE_POOL__MAX_CHUNKS_PER_CHANNEL"),
        );

        if let Some(v) = var("SLUICE_OUTPUT__HOSTNAME") {
            self.output.hostname = v;
        }
        set(&mut self.output.port, var("SLUICE_OUTPUT__PORT"));
        set(&mut self.output.bind_attempts, var("SLUICE_OUTPUT__BIND_ATTEMPTS"));
        set(
            &mut self.output.distribution_mode,
            var("SLUICE_OUTPUT__DISTRIBUTION_MODE"),
        );
        set(&mut self.output.no_input_shared, var("SLUICE_OUTPUT__NO_INPUT_SHARED"));

        set(
            &mut self.input.data_distribution,
            var("SLUICE_INPUT__DATA_DISTRIBUTION"),
        );
        set(&mut self.input.on_slowness, var("SLUICE_INPUT__ON_SLOWNESS"));
        if let Some(n) = var("SLUICE_INPUT__MIN_DATA").and_then(|v| v.parse::<u32>().ok()) {
            self.input.min_data = MinData::from(n);
        }
        flag(
            &mut self.input.keep_data_until_new,
            var("SLUICE_INPUT__KEEP_DATA_UNTIL_NEW"),
        );
        flag(
            &mut self.input.respond_to_end_of_stream,
            var("SLUICE_INPUT__RESPOND_TO_END_OF_STREAM"),
        );
        set(
            &mut self.input.delay_on_input_ms,
            var("SLUICE_INPUT__DELAY_ON_INPUT_MS"),
        );
        if let Some(v) = var("SLUICE_INPUT__CONNECTED_OUTPUT_CHANNELS") {
            self.input.connected_output_channels = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
    }
}
