//! Validated configuration for a proxy process and its redundancy behavior.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::handover::RedundancyMode;
use crate::topic::{TopicBuilder, TopicError, DEFAULT_NAMESPACE_ROOT};

/// Pacing applied between processed queue items.
pub const DEFAULT_THROTTLE_DELAY_MS: u64 = 1;
/// Startup window and peer-silence threshold for the handover coordinator.
pub const DEFAULT_ACTIVE_TIMEOUT_MS: u64 = 10_000;
/// Interval at which the active instance refreshes its retained heartbeat.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 10_000;
/// Grace period before a takeover request is published.
pub const DEFAULT_REQUEST_DELAY_MS: u64 = 10_000;
/// Interval between status publications.
pub const DEFAULT_STATUS_INTERVAL_MS: u64 = 10_000;
/// Message expiry applied to retained status publishes.
pub const DEFAULT_STATUS_EXPIRY_SECS: u32 = 120;
/// Reconciliation window size used during handovers.
pub const DEFAULT_HANDOVER_WINDOW: usize = 3;
/// Ceiling on configured throttle delays.
pub const MAX_THROTTLE_DELAY_MS: u64 = 60_000;

/// Fatal configuration error raised at construction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error(transparent)]
    Topic(#[from] TopicError),
    #[error("process name must not be empty")]
    MissingProcessName,
    #[error("package name must not be empty")]
    MissingPackageName,
    #[error("package version must not be empty")]
    MissingPackageVersion,
    #[error("throttle delay {actual_ms} ms exceeds the {max_ms} ms ceiling")]
    DelayTooLarge { actual_ms: u64, max_ms: u64 },
}

/// Top-level configuration of one proxy process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    pub process_name: String,
    pub package_name: String,
    pub package_version: String,
    #[serde(default = "default_namespace_root")]
    pub namespace_root: String,
    #[serde(default)]
    pub redundancy: RedundancyConfig,
    #[serde(default)]
    pub throttle: ThrottleConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,
}

impl ProcessConfig {
    pub fn new(
        process_name: impl Into<String>,
        package_name: impl Into<String>,
        package_version: impl Into<String>,
    ) -> Self {
        Self {
            process_name: process_name.into(),
            package_name: package_name.into(),
            package_version: package_version.into(),
            namespace_root: default_namespace_root(),
            redundancy: RedundancyConfig::default(),
            throttle: ThrottleConfig::default(),
            persistence: PersistenceConfig::default(),
            status_interval_ms: default_status_interval_ms(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.process_name.trim().is_empty() {
            return Err(ConfigError::MissingProcessName);
        }
        if self.package_name.trim().is_empty() {
            return Err(ConfigError::MissingPackageName);
        }
        if self.package_version.trim().is_empty() {
            return Err(ConfigError::MissingPackageVersion);
        }
        for delay in [
            self.throttle.publish_delay_ms,
            self.throttle.subscribe_delay_ms,
        ] {
            if delay > MAX_THROTTLE_DELAY_MS {
                return Err(ConfigError::DelayTooLarge {
                    actual_ms: delay,
                    max_ms: MAX_THROTTLE_DELAY_MS,
                });
            }
        }
        Ok(())
    }

    /// Topic builder for this process, with all segments sanitized.
    pub fn topic_builder(&self) -> Result<TopicBuilder, ConfigError> {
        Ok(TopicBuilder::new(
            &self.namespace_root,
            &self.package_name,
            &self.package_version,
            &self.process_name,
        )?)
    }
}

/// Active/passive coordination knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedundancyConfig {
    pub mode: RedundancyMode,
    pub active_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub request_delay_ms: u64,
    pub status_expiry_secs: u32,
    pub handover_window: usize,
}

impl Default for RedundancyConfig {
    fn default() -> Self {
        Self {
            mode: RedundancyMode::Wait,
            active_timeout_ms: DEFAULT_ACTIVE_TIMEOUT_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            request_delay_ms: DEFAULT_REQUEST_DELAY_MS,
            status_expiry_secs: DEFAULT_STATUS_EXPIRY_SECS,
            handover_window: DEFAULT_HANDOVER_WINDOW,
        }
    }
}

/// Queue pacing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub publish_delay_ms: u64,
    pub subscribe_delay_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            publish_delay_ms: DEFAULT_THROTTLE_DELAY_MS,
            subscribe_delay_ms: DEFAULT_THROTTLE_DELAY_MS,
        }
    }
}

/// Disk checkpointing configuration for queue state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    pub directory: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: PathBuf::from("queue-state"),
        }
    }
}

fn default_namespace_root() -> String {
    DEFAULT_NAMESPACE_ROOT.to_string()
}

fn default_status_interval_ms() -> u64 {
    DEFAULT_STATUS_INTERVAL_MS
}
