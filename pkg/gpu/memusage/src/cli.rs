// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use clap::Parser;
use std::path::PathBuf;

use crate::config::Config;

/// Per-task GPU memory usage recorder
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "dd-gpu-memusage", version)]
#[command(about = "Record min/max GPU memory per task from transitions read on stdin")]
pub struct Args {
    /// YAML config file. Without it, `DD_GPU_MEMUSAGE_CONFIG` or the default
    /// path is tried, and a missing file there means defaults.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Scheduler address the configured workers belong to
    #[arg(long)]
    pub scheduler_address: Option<String>,

    /// Output file for task records
    #[arg(short, long)]
    pub path: Option<PathBuf>,

    /// Output format: csv, json or table
    #[arg(short, long)]
    pub format: Option<String>,

    /// Sampling interval in seconds
    #[arg(short, long)]
    pub interval: Option<u64>,

    /// Record only the maximum memory per task
    #[arg(long)]
    pub max_only: bool,

    /// Add a column with seconds since startup
    #[arg(long)]
    pub record_time: bool,
}

impl Args {
    /// Flags given on the command line win over the file.
    pub fn apply(&self, config: &mut Config) {
        if let Some(address) = &self.scheduler_address {
            config.scheduler_address = Some(address.clone());
        }
        if let Some(path) = &self.path {
            config.output.path = path.clone();
        }
        if let Some(format) = &self.format {
            config.output.format = format.clone();
        }
        if let Some(interval) = self.interval {
            config.interval = interval;
        }
        config.max_only |= self.max_only;
        config.record_time |= self.record_time;
    }
}
