// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal::unix::{SignalKind, signal};

use dd_gpu_memusage::cli::Args;
use dd_gpu_memusage::config::{self, Config};
use dd_gpu_memusage::{GpuMemoryPlugin, TaskTransition};

/// A blocking stdin read cannot be cancelled; don't let it hold the exit.
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

fn main() -> Result<()> {
    let args = Args::parse();
    let mut cfg = config::load_config(args.config.as_deref())?;
    args.apply(&mut cfg);

    simple_logger::init_with_level(config::get_log_level(Some(&cfg)))?;
    info!(
        "dd-gpu-memusage starting (version {})",
        env!("CARGO_PKG_VERSION")
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build the Tokio runtime")?;
    let result = runtime.block_on(run(cfg));
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);
    result
}

async fn run(cfg: Config) -> Result<()> {
    if let Some(address) = &cfg.scheduler_address {
        info!("recording tasks for scheduler {address}");
    }

    let probe = Arc::new(cfg.nvidia_smi_probe());
    let plugin =
        GpuMemoryPlugin::new(&cfg, probe).context("failed to set up GPU memory recording")?;
    plugin.on_attach()?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut recorded: u64 = 0;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM");
                break;
            }
            _ = sigint.recv() => {
                info!("received SIGINT");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if handle_line(&plugin, &line) {
                        recorded += 1;
                    }
                }
                Ok(None) => {
                    info!("transition stream closed");
                    break;
                }
                Err(e) => {
                    warn!("failed to read transitions: {e}");
                    break;
                }
            },
        }
    }

    plugin.before_close().await;
    info!("dd-gpu-memusage shutting down, {recorded} task(s) recorded");
    Ok(())
}

/// Feed one JSON line to the plugin. Returns true if a record was written.
fn handle_line(plugin: &GpuMemoryPlugin, line: &str) -> bool {
    let line = line.trim();
    if line.is_empty() {
        return false;
    }
    match serde_json::from_str::<TaskTransition>(line) {
        Ok(transition) => match plugin.transition(&transition) {
            Some(record) => {
                debug!(
                    "task {} on {}: max {} MiB over {} sample(s)",
                    record.task_key,
                    record.worker_id,
                    record.max_gpu_memory_mb,
                    record.sample_count
                );
                true
            }
            None => false,
        },
        Err(e) => {
            warn!("ignoring malformed transition: {e}");
            false
        }
    }
}
