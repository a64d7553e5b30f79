// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Context, Result, ensure};
use log::{debug, warn};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::adapter::AdapterOptions;
use crate::queue::{OverflowPolicy, QueueOptions};

pub const CONFIG_ENV: &str = "FRAME_ANALYZER_CONFIG";
pub const PROBE_DIR_ENV: &str = "FRAME_ANALYZER_PROBE_DIR";

const DEFAULT_PROBE_DIR: &str = "/data/local/tmp/frame-analyzer";

fn default_queue_capacity() -> usize {
    4096
}

fn default_block_timeout_ms() -> u64 {
    5
}

fn default_detach_grace_ms() -> u64 {
    1000
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_probe_dir() -> PathBuf {
    PathBuf::from(DEFAULT_PROBE_DIR)
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalyzerConfig {
    /// Samples held before the overflow policy applies.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
    /// Longest a producer waits for room under the `block` policy.
    #[serde(default = "default_block_timeout_ms")]
    pub block_timeout_ms: u64,
    /// Longest `detach` waits for an adapter before giving up on it.
    #[serde(default = "default_detach_grace_ms")]
    pub detach_grace_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Directory holding the `<pid>.sock` probe endpoints.
    #[serde(default = "default_probe_dir")]
    pub probe_dir: PathBuf,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            overflow_policy: OverflowPolicy::default(),
            block_timeout_ms: default_block_timeout_ms(),
            detach_grace_ms: default_detach_grace_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            probe_dir: default_probe_dir(),
        }
    }
}

impl AnalyzerConfig {
    /// Parse a YAML config file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: AnalyzerConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration for a new analyzer. Never fails: an unreadable or
    /// invalid file is logged and the defaults are used instead.
    pub fn from_env() -> Self {
        let mut config = match std::env::var_os(CONFIG_ENV) {
            Some(path) => {
                let path = PathBuf::from(path);
                match Self::load(&path) {
                    Ok(config) => {
                        debug!("loaded analyzer config from {}", path.display());
                        config
                    }
                    Err(e) => {
                        warn!("ignoring analyzer config: {e:#}");
                        Self::default()
                    }
                }
            }
            None => Self::default(),
        };

        if let Some(dir) = std::env::var_os(PROBE_DIR_ENV) {
            config.probe_dir = PathBuf::from(dir);
        }
        config
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.queue_capacity > 0, "queue_capacity must be positive");
        ensure!(self.detach_grace_ms > 0, "detach_grace_ms must be positive");
        ensure!(self.poll_interval_ms > 0, "poll_interval_ms must be positive");
        ensure!(
            !self.probe_dir.as_os_str().is_empty(),
            "probe_dir must not be empty"
        );
        Ok(())
    }

    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            capacity: self.queue_capacity,
            overflow: self.overflow_policy,
            block_timeout: Duration::from_millis(self.block_timeout_ms),
        }
    }

    pub fn adapter_options(&self) -> AdapterOptions {
        AdapterOptions {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    pub fn detach_grace(&self) -> Duration {
        Duration::from_millis(self.detach_grace_ms)
    }
}
