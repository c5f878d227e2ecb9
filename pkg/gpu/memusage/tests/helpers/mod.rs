// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle to a running dd-gpu-memusage process fed over stdin.
pub struct RecorderHandle {
    child: Child,
    stdin: Option<ChildStdin>,
    log_lines: Arc<Mutex<Vec<String>>>,
    _stdout_thread: std::thread::JoinHandle<()>,
    _stderr_thread: std::thread::JoinHandle<()>,
}

fn capture<R: std::io::Read + Send + 'static>(
    stream: R,
    tag: &'static str,
    lines: Arc<Mutex<Vec<String>>>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        for line in BufReader::new(stream).lines() {
            match line {
                Ok(l) => {
                    eprintln!("[{tag}] {l}");
                    lines.lock().unwrap().push(l);
                }
                Err(_) => break,
            }
        }
    })
}

impl RecorderHandle {
    /// Start the binary with `args`, debug logging and no inherited config.
    pub fn start(args: &[&str]) -> Self {
        let bin = env!("CARGO_BIN_EXE_dd-gpu-memusage");
        let mut child = Command::new(bin)
            .args(args)
            .env("DD_LOG_LEVEL", "debug")
            .env_remove("LOG_LEVEL")
            .env_remove("DD_GPU_MEMUSAGE_CONFIG")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .expect("failed to start dd-gpu-memusage");

        let stdin = child.stdin.take().expect("failed to capture stdin");
        let stdout = child.stdout.take().expect("failed to capture stdout");
        let stderr = child.stderr.take().expect("failed to capture stderr");
        let log_lines = Arc::new(Mutex::new(Vec::<String>::new()));

        // simple_logger writes INFO and below to stdout, WARN/ERROR to stderr.
        let stdout_thread = capture(stdout, "recorder", Arc::clone(&log_lines));
        let stderr_thread = capture(stderr, "recorder:err", Arc::clone(&log_lines));

        Self {
            child,
            stdin: Some(stdin),
            log_lines,
            _stdout_thread: stdout_thread,
            _stderr_thread: stderr_thread,
        }
    }

    /// Write one transition line to the process.
    pub fn send_line(&mut self, line: &str) {
        let stdin = self.stdin.as_mut().expect("stdin already closed");
        writeln!(stdin, "{line}").expect("failed to write transition");
        stdin.flush().expect("failed to flush transition");
    }

    /// Send a processing -> `finish` transition for `key` on `worker`.
    pub fn send_transition(&mut self, key: &str, finish: &str, worker: &str) {
        let line = serde_json::json!({
            "key": key,
            "start": "processing",
            "finish": finish,
            "stimulus_id": format!("task-finished-{key}"),
            "worker": worker,
        });
        self.send_line(&line.to_string());
    }

    /// Close stdin, which ends the transition stream.
    pub fn close_stdin(&mut self) {
        self.stdin.take();
    }

    /// Wait until a log line containing `pattern` appears, or timeout.
    pub fn wait_for_log(&self, pattern: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.count_log_matches(pattern) > 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    pub fn wait_for_log_default(&self, pattern: &str) -> bool {
        self.wait_for_log(pattern, DEFAULT_TIMEOUT)
    }

    /// Wait until at least `n` log lines contain `pattern`.
    pub fn wait_for_log_count(&self, pattern: &str, n: usize) -> bool {
        let deadline = Instant::now() + DEFAULT_TIMEOUT;
        loop {
            if self.count_log_matches(pattern) >= n {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    pub fn count_log_matches(&self, pattern: &str) -> usize {
        let lines = self.log_lines.lock().unwrap();
        lines.iter().filter(|l| l.contains(pattern)).count()
    }

    pub fn send_signal(&self, sig: Signal) {
        let pid = self.child.id() as i32;
        signal::kill(Pid::from_raw(pid), sig).expect("failed to send signal to recorder");
    }

    /// Close stdin and wait for the process to exit.
    pub fn finish(&mut self) -> std::process::ExitStatus {
        self.close_stdin();
        self.wait_with_timeout(DEFAULT_TIMEOUT)
    }

    /// Wait for the process to exit within the given timeout.
    pub fn wait_with_timeout(&mut self, timeout: Duration) -> std::process::ExitStatus {
        let deadline = Instant::now() + timeout;
        loop {
            match self
                .child
                .try_wait()
                .expect("failed to check recorder status")
            {
                Some(status) => return status,
                None => {
                    if Instant::now() >= deadline {
                        self.child.kill().ok();
                        return self.child.wait().expect("failed to wait on killed recorder");
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }
}

impl Drop for RecorderHandle {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Install a fake `nvidia-smi` in `dir` reporting one GPU (minor 0) whose
/// used memory is read from `dir/used` on every call. Returns its path.
pub fn install_fake_nvidia_smi(dir: &Path, used_mb: u64) -> PathBuf {
    set_fake_usage(dir, used_mb);
    let used_file = dir.join("used");
    let script = format!(
        r#"#!/bin/sh
used=$(cat "{used}")
cat <<EOF
<?xml version="1.0" ?>
<nvidia_smi_log>
  <attached_gpus>1</attached_gpus>
  <gpu id="00000000:01:00.0">
    <uuid>GPU-00000000-fake-0000-0000-000000000000</uuid>
    <minor_number>0</minor_number>
    <fb_memory_usage>
      <total>16384 MiB</total>
      <used>$used MiB</used>
    </fb_memory_usage>
  </gpu>
</nvidia_smi_log>
EOF
"#,
        used = used_file.display()
    );
    write_script(dir, "nvidia-smi", &script)
}

/// Install a fake `nvidia-smi` that always fails.
pub fn install_broken_nvidia_smi(dir: &Path) -> PathBuf {
    write_script(
        dir,
        "nvidia-smi",
        "#!/bin/sh\necho 'NVIDIA-SMI has failed because it could not communicate with the NVIDIA driver' >&2\nexit 9\n",
    )
}

pub fn set_fake_usage(dir: &Path, used_mb: u64) {
    std::fs::write(dir.join("used"), used_mb.to_string()).expect("failed to write usage");
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body)
        .unwrap_or_else(|e| panic!("failed to write {}: {e}", path.display()));
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("failed to make script executable");
    path
}

/// Write a config mapping worker `w1` to GPU 0 and probing with `probe`.
pub fn write_config(dir: &Path, probe: &Path, extra: &str) -> PathBuf {
    let path = dir.join("gpu-memusage.yaml");
    let yaml = format!(
        "interval: 1\nprobe:\n  command: {}\n  args: []\nworkers:\n  - id: w1\n    devices: ['0']\n{extra}",
        probe.display()
    );
    std::fs::write(&path, yaml)
        .unwrap_or_else(|e| panic!("failed to write {}: {e}", path.display()));
    path
}
