// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Device memory queries.
//!
//! A probe runs the external device-query tool once and turns its output into
//! one [`DeviceReading`] per GPU. The default implementation shells out to
//! `nvidia-smi -q -x` and parses the XML report.

use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

use crate::errors::ProbeError;

pub const DEFAULT_COMMAND: &str = "nvidia-smi";
pub const DEFAULT_ARGS: [&str; 2] = ["-q", "-x"];
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// One instantaneous memory sample for one physical device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceReading {
    /// Stable device identifier (the GPU UUID for nvidia-smi).
    pub device_id: String,
    pub bus_id: Option<String>,
    pub minor_number: Option<u32>,
    pub used_memory_mb: u64,
}

impl DeviceReading {
    pub fn new(device_id: impl Into<String>, used_memory_mb: u64) -> Self {
        Self {
            device_id: device_id.into(),
            bus_id: None,
            minor_number: None,
            used_memory_mb,
        }
    }

    /// A selector names a device by UUID, PCI bus id, or minor number.
    pub fn matches(&self, selector: &str) -> bool {
        if self.device_id == selector {
            return true;
        }
        if self
            .bus_id
            .as_deref()
            .is_some_and(|bus| bus.eq_ignore_ascii_case(selector))
        {
            return true;
        }
        self.minor_number
            .is_some_and(|minor| selector.parse::<u32>() == Ok(minor))
    }
}

/// Port for querying per-device memory usage.
#[async_trait]
pub trait DeviceMemoryProbe: Send + Sync {
    /// Query every visible device once. Must return within a bounded time.
    async fn sample(&self) -> Result<Vec<DeviceReading>, ProbeError>;
}

/// Probe backed by `nvidia-smi -q -x`.
#[derive(Debug, Clone)]
pub struct NvidiaSmiProbe {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl NvidiaSmiProbe {
    pub fn new(command: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            args,
            timeout,
        }
    }

    fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }
}

impl Default for NvidiaSmiProbe {
    fn default() -> Self {
        Self::new(
            DEFAULT_COMMAND,
            DEFAULT_ARGS.iter().map(|a| a.to_string()).collect(),
            DEFAULT_TIMEOUT,
        )
    }
}

#[async_trait]
impl DeviceMemoryProbe for NvidiaSmiProbe {
    async fn sample(&self) -> Result<Vec<DeviceReading>, ProbeError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            // A timed-out query must not leave the child behind.
            .kill_on_drop(true);

        let output = match timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(ProbeError::Spawn {
                    command: self.command_line(),
                    source,
                });
            }
            Err(_) => {
                return Err(ProbeError::Timeout {
                    command: self.command_line(),
                    timeout: self.timeout,
                });
            }
        };

        if !output.status.success() {
            return Err(ProbeError::Failed {
                command: self.command_line(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8(output.stdout)
            .map_err(|e| ProbeError::Parse(format!("output is not UTF-8: {e}")))?;
        parse_query_xml(&stdout)
    }
}

#[derive(Debug, Deserialize)]
struct NvidiaSmiLog {
    #[serde(rename = "gpu", default)]
    gpus: Vec<Gpu>,
}

#[derive(Debug, Deserialize)]
struct Gpu {
    #[serde(rename = "@id", default)]
    bus_id: Option<String>,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    minor_number: Option<String>,
    #[serde(default)]
    fb_memory_usage: Option<FbMemoryUsage>,
}

#[derive(Debug, Deserialize)]
struct FbMemoryUsage {
    #[serde(default)]
    used: Option<String>,
}

/// Parse the XML report of `nvidia-smi -q -x`.
///
/// Devices that report no usable framebuffer figure (`N/A`, missing element)
/// are skipped. A document that is not an nvidia-smi report is an error.
pub fn parse_query_xml(xml: &str) -> Result<Vec<DeviceReading>, ProbeError> {
    if xml.trim().is_empty() {
        return Err(ProbeError::Parse("empty output".to_string()));
    }
    let log: NvidiaSmiLog = quick_xml::de::from_str(xml)
        .map_err(|e| ProbeError::Parse(format!("invalid nvidia-smi XML: {e}")))?;

    let mut readings = Vec::with_capacity(log.gpus.len());
    for (position, gpu) in log.gpus.into_iter().enumerate() {
        let Some(used) = gpu.fb_memory_usage.and_then(|fb| fb.used) else {
            debug!("GPU #{position} has no fb_memory_usage, skipping");
            continue;
        };
        let Some(used_memory_mb) = parse_mib(&used)? else {
            debug!("GPU #{position} reports used memory as {used:?}, skipping");
            continue;
        };
        let minor_number = gpu
            .minor_number
            .as_deref()
            .and_then(|m| m.trim().parse::<u32>().ok());
        let device_id = gpu
            .uuid
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .or_else(|| minor_number.map(|m| m.to_string()))
            .unwrap_or_else(|| position.to_string());

        readings.push(DeviceReading {
            device_id,
            bus_id: gpu.bus_id,
            minor_number,
            used_memory_mb,
        });
    }
    Ok(readings)
}

/// Parse a memory figure such as `"1234 MiB"`. `Ok(None)` means the device
/// did not report a value.
fn parse_mib(raw: &str) -> Result<Option<u64>, ProbeError> {
    let raw = raw.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("N/A") || raw.starts_with('[') {
        return Ok(None);
    }
    let mut parts = raw.split_whitespace();
    let value = parts.next().unwrap_or_default();
    let unit = parts.next().unwrap_or("MiB");
    let value: u64 = value
        .parse()
        .map_err(|_| ProbeError::Parse(format!("invalid memory value {raw:?}")))?;
    match unit {
        "MiB" | "MB" => Ok(Some(value)),
        "GiB" | "GB" => value
            .checked_mul(1024)
            .map(Some)
            .ok_or_else(|| ProbeError::Parse(format!("memory value out of range {raw:?}"))),
        "KiB" | "KB" => Ok(Some(value / 1024)),
        _ => Err(ProbeError::Parse(format!("unknown memory unit in {raw:?}"))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing, clippy::panic)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    pub(crate) const TWO_GPU_XML: &str = r#"<?xml version="1.0" ?>
<!DOCTYPE nvidia_smi_log SYSTEM "nvsmi_device_v12.dtd">
<nvidia_smi_log>
	<timestamp>Thu Oct 15 10:12:01 2026</timestamp>
	<driver_version>550.54.15</driver_version>
	<attached_gpus>2</attached_gpus>
	<gpu id="00000000:01:00.0">
		<product_name>NVIDIA A100-SXM4-40GB</product_name>
		<uuid>GPU-1b9f0c6e-0d43-4b6e-9a3f-1d2c3b4a5f60</uuid>
		<minor_number>0</minor_number>
		<fb_memory_usage>
			<total>40960 MiB</total>
			<reserved>635 MiB</reserved>
			<used>1536 MiB</used>
			<free>38789 MiB</free>
		</fb_memory_usage>
	</gpu>
	<gpu id="00000000:02:00.0">
		<product_name>NVIDIA A100-SXM4-40GB</product_name>
		<uuid>GPU-7c2d1e0f-8a9b-4c3d-b2e1-0f9e8d7c6b5a</uuid>
		<minor_number>1</minor_number>
		<fb_memory_usage>
			<total>40960 MiB</total>
			<reserved>635 MiB</reserved>
			<used>4 MiB</used>
			<free>40321 MiB</free>
		</fb_memory_usage>
	</gpu>
</nvidia_smi_log>
"#;

    /// Probe that replays a fixed script of results and reports each call on
    /// a channel. Once the script runs out it repeats the last entry.
    pub(crate) struct ScriptedProbe {
        script: Mutex<VecDeque<Result<Vec<DeviceReading>, String>>>,
        last: Mutex<Option<Result<Vec<DeviceReading>, String>>>,
        calls: AtomicUsize,
        notify: mpsc::UnboundedSender<usize>,
    }

    impl ScriptedProbe {
        pub(crate) fn new(
            script: Vec<Result<Vec<DeviceReading>, String>>,
        ) -> (Self, mpsc::UnboundedReceiver<usize>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let probe = Self {
                script: Mutex::new(script.into()),
                last: Mutex::new(None),
                calls: AtomicUsize::new(0),
                notify: tx,
            };
            (probe, rx)
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DeviceMemoryProbe for ScriptedProbe {
        async fn sample(&self) -> Result<Vec<DeviceReading>, ProbeError> {
            let next = {
                let mut script = self.script.lock().unwrap();
                let mut last = self.last.lock().unwrap();
                match script.pop_front() {
                    Some(entry) => {
                        *last = Some(entry.clone());
                        entry
                    }
                    None => last.clone().unwrap_or_else(|| Ok(Vec::new())),
                }
            };
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let _ = self.notify.send(n);
            next.map_err(ProbeError::Parse)
        }
    }

    #[test]
    fn test_parse_two_gpus() {
        let readings = parse_query_xml(TWO_GPU_XML).unwrap();
        assert_eq!(readings.len(), 2);
        assert_eq!(
            readings[0].device_id,
            "GPU-1b9f0c6e-0d43-4b6e-9a3f-1d2c3b4a5f60"
        );
        assert_eq!(readings[0].bus_id.as_deref(), Some("00000000:01:00.0"));
        assert_eq!(readings[0].minor_number, Some(0));
        assert_eq!(readings[0].used_memory_mb, 1536);
        assert_eq!(readings[1].minor_number, Some(1));
        assert_eq!(readings[1].used_memory_mb, 4);
    }

    #[test]
    fn test_parse_skips_unavailable_memory() {
        let xml = r#"<nvidia_smi_log>
  <gpu id="00000000:01:00.0">
    <uuid>GPU-a</uuid>
    <minor_number>N/A</minor_number>
    <fb_memory_usage><used>N/A</used></fb_memory_usage>
  </gpu>
  <gpu id="00000000:02:00.0">
    <uuid>GPU-b</uuid>
    <minor_number>N/A</minor_number>
    <fb_memory_usage><used>12 MiB</used></fb_memory_usage>
  </gpu>
  <gpu id="00000000:03:00.0">
    <uuid>GPU-c</uuid>
  </gpu>
</nvidia_smi_log>"#;
        let readings = parse_query_xml(xml).unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].device_id, "GPU-b");
        assert_eq!(readings[0].minor_number, None);
        assert_eq!(readings[0].used_memory_mb, 12);
    }

    #[test]
    fn test_parse_no_gpus() {
        let readings = parse_query_xml("<nvidia_smi_log><attached_gpus>0</attached_gpus></nvidia_smi_log>").unwrap();
        assert!(readings.is_empty());
    }

    #[test]
    fn test_parse_garbage_is_error() {
        assert!(matches!(
            parse_query_xml("NVIDIA-SMI has failed because it couldn't communicate"),
            Err(ProbeError::Parse(_))
        ));
        assert!(matches!(parse_query_xml("  \n"), Err(ProbeError::Parse(_))));
    }

    #[test]
    fn test_parse_bad_value_is_error() {
        let xml = r#"<nvidia_smi_log><gpu id="0"><uuid>GPU-a</uuid>
<fb_memory_usage><used>lots MiB</used></fb_memory_usage></gpu></nvidia_smi_log>"#;
        assert!(matches!(parse_query_xml(xml), Err(ProbeError::Parse(_))));
    }

    #[test]
    fn test_parse_oversized_value_is_error() {
        let xml = r#"<nvidia_smi_log><gpu id="0"><uuid>GPU-a</uuid>
<fb_memory_usage><used>18446744073709551615 GiB</used></fb_memory_usage></gpu></nvidia_smi_log>"#;
        assert!(matches!(parse_query_xml(xml), Err(ProbeError::Parse(_))));
        assert!(matches!(
            parse_mib("18014398509481984 GiB"),
            Err(ProbeError::Parse(_))
        ));
    }

    #[test]
    fn test_parse_mib_units() {
        assert_eq!(parse_mib("512 MiB").unwrap(), Some(512));
        assert_eq!(parse_mib("2 GiB").unwrap(), Some(2048));
        assert_eq!(parse_mib("77").unwrap(), Some(77));
        assert_eq!(parse_mib("N/A").unwrap(), None);
        assert_eq!(parse_mib("[N/A]").unwrap(), None);
        assert!(parse_mib("12 parsecs").is_err());
        assert_eq!(
            parse_mib("18014398509481983 GiB").unwrap(),
            Some(18014398509481983 * 1024)
        );
    }

    #[test]
    fn test_reading_matches_selectors() {
        let reading = parse_query_xml(TWO_GPU_XML).unwrap().remove(1);
        assert!(reading.matches("GPU-7c2d1e0f-8a9b-4c3d-b2e1-0f9e8d7c6b5a"));
        assert!(reading.matches("00000000:02:00.0"));
        assert!(reading.matches("1"));
        assert!(!reading.matches("0"));
        assert!(!reading.matches("GPU-other"));
    }

    #[tokio::test]
    async fn test_nvidia_smi_probe_reads_command_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.xml");
        std::fs::write(&path, TWO_GPU_XML).unwrap();

        let probe = NvidiaSmiProbe::new(
            "/bin/cat",
            vec![path.to_str().unwrap().to_string()],
            Duration::from_secs(5),
        );
        let readings = probe.sample().await.unwrap();
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].used_memory_mb, 1536);
    }

    #[tokio::test]
    async fn test_nvidia_smi_probe_timeout() {
        let probe = NvidiaSmiProbe::new(
            "/bin/sleep",
            vec!["30".to_string()],
            Duration::from_millis(200),
        );
        let start = std::time::Instant::now();
        let err = probe.sample().await.unwrap_err();
        assert!(matches!(err, ProbeError::Timeout { .. }), "got {err}");
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_nvidia_smi_probe_missing_binary() {
        let probe = NvidiaSmiProbe::new(
            "/nonexistent/nvidia-smi",
            vec![],
            Duration::from_secs(1),
        );
        assert!(matches!(
            probe.sample().await,
            Err(ProbeError::Spawn { .. })
        ));
    }

    #[tokio::test]
    async fn test_nvidia_smi_probe_non_zero_exit() {
        let probe = NvidiaSmiProbe::new(
            "/bin/sh",
            vec![
                "-c".to_string(),
                "echo 'No devices were found' >&2; exit 6".to_string(),
            ],
            Duration::from_secs(5),
        );
        match probe.sample().await {
            Err(ProbeError::Failed { status, stderr, .. }) => {
                assert_eq!(status.code(), Some(6));
                assert_eq!(stderr, "No devices were found");
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }
}
