// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Context, Result};
use log::warn;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::devices::DeviceMap;
use crate::errors::Error;
use crate::probe::{self, NvidiaSmiProbe};
use crate::sink::{DEFAULT_OUTPUT_PATH, OutputFormat};

const DEFAULT_CONFIG_PATH: &str = "/etc/datadog-agent/gpu-memusage.yaml";

fn default_interval() -> u64 {
    1
}

fn default_stop_timeout() -> u64 {
    10
}

fn default_probe_timeout() -> u64 {
    probe::DEFAULT_TIMEOUT.as_secs()
}

fn default_output_path() -> PathBuf {
    PathBuf::from(DEFAULT_OUTPUT_PATH)
}

fn default_output_format() -> String {
    "csv".to_string()
}

fn default_probe_command() -> String {
    probe::DEFAULT_COMMAND.to_string()
}

fn default_probe_args() -> Vec<String> {
    probe::DEFAULT_ARGS.iter().map(|a| a.to_string()).collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Scheduler the workers below belong to. Informational.
    #[serde(default)]
    pub scheduler_address: Option<String>,
    /// Sampling interval, in seconds.
    #[serde(default = "default_interval")]
    pub interval: u64,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub max_only: bool,
    #[serde(default)]
    pub record_time: bool,
    #[serde(default)]
    pub probe: ProbeConfig,
    /// Seconds to wait for the sampler on shutdown before aborting it.
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout: u64,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_path")]
    pub path: PathBuf,
    #[serde(default = "default_output_format")]
    pub format: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_probe_command")]
    pub command: String,
    #[serde(default = "default_probe_args")]
    pub args: Vec<String>,
    /// Seconds.
    #[serde(default = "default_probe_timeout")]
    pub timeout: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    pub id: String,
    #[serde(default)]
    pub devices: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scheduler_address: None,
            interval: default_interval(),
            output: OutputConfig::default(),
            max_only: false,
            record_time: false,
            probe: ProbeConfig::default(),
            stop_timeout: default_stop_timeout(),
            log_level: None,
            workers: Vec::new(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: default_output_path(),
            format: default_output_format(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            command: default_probe_command(),
            args: default_probe_args(),
            timeout: default_probe_timeout(),
        }
    }
}

impl Config {
    /// Check everything that must hold before the sampler may start, and
    /// return the parsed output format.
    pub fn validate(&self) -> Result<OutputFormat, Error> {
        let format: OutputFormat = self.output.format.parse()?;
        if self.interval == 0 {
            return Err(Error::Configuration(
                "interval must be a positive number of seconds".to_string(),
            ));
        }
        if self.probe.timeout == 0 {
            return Err(Error::Configuration(
                "probe timeout must be a positive number of seconds".to_string(),
            ));
        }
        if self.stop_timeout == 0 {
            return Err(Error::Configuration(
                "stop_timeout must be a positive number of seconds".to_string(),
            ));
        }
        if self.stop_timeout < self.probe.timeout {
            return Err(Error::Configuration(format!(
                "stop_timeout ({}s) must not be shorter than the probe timeout ({}s)",
                self.stop_timeout, self.probe.timeout
            )));
        }
        if self.probe.command.trim().is_empty() {
            return Err(Error::Configuration("probe command is empty".to_string()));
        }
        self.device_map()?;
        Ok(format)
    }

    pub fn device_map(&self) -> Result<DeviceMap, Error> {
        DeviceMap::from_workers(
            self.workers
                .iter()
                .map(|w| (w.id.clone(), w.devices.clone())),
        )
    }

    pub fn sampling_interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout)
    }

    pub fn nvidia_smi_probe(&self) -> NvidiaSmiProbe {
        NvidiaSmiProbe::new(
            self.probe.command.clone(),
            self.probe.args.clone(),
            Duration::from_secs(self.probe.timeout),
        )
    }
}

pub fn config_path() -> PathBuf {
    env::var("DD_GPU_MEMUSAGE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Load the YAML config. An explicitly given path must exist; a missing
/// file at the default location yields the defaults.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let path = config_path();
            if !path.exists() {
                warn!(
                    "config file not found at {}, using defaults",
                    path.display()
                );
                return Ok(Config::default());
            }
            path
        }
    };
    parse_config(&path)
}

fn parse_config(path: &Path) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    let config: Config =
        serde_yaml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
    Ok(config)
}

/// Parse a log level name. Unknown levels silently default to Info.
fn parse_log_level(level: &str) -> log::Level {
    match level.to_lowercase().as_str() {
        "trace" => log::Level::Trace,
        "debug" => log::Level::Debug,
        "info" => log::Level::Info,
        "warn" | "warning" => log::Level::Warn,
        "error" | "critical" | "off" => log::Level::Error,
        _ => log::Level::Info,
    }
}

/// Priority: DD_LOG_LEVEL > LOG_LEVEL > YAML config > Info.
pub fn get_log_level(config: Option<&Config>) -> log::Level {
    if let Ok(level) = env::var("DD_LOG_LEVEL") {
        return parse_log_level(&level);
    }
    if let Ok(level) = env::var("LOG_LEVEL") {
        return parse_log_level(&level);
    }
    config
        .and_then(|c| c.log_level.as_deref())
        .map(parse_log_level)
        .unwrap_or(log::Level::Info)
}
