//! Doctor command execution.
//!
//! A doctor is a shell command whose exit code gates progress: 0 means pass.
//! Used per task (the manifest's `verify.doctor`) and per batch (the
//! project-level integration doctor against the temp merge).

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use hive_core::config::{DoctorCanaryConfig, DoctorCanaryMode};
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum DoctorError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DoctorError>;

/// Outcome of one doctor invocation.
#[derive(Debug, Clone)]
pub struct DoctorOutcome {
    pub passed: bool,
    pub timed_out: bool,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    /// Tail of combined stdout/stderr, for the journal and error messages.
    pub output_tail: String,
}

impl DoctorOutcome {
    fn timed_out(duration_ms: u64) -> Self {
        Self {
            passed: false,
            timed_out: true,
            exit_code: None,
            duration_ms,
            output_tail: String::new(),
        }
    }
}

const TAIL_LINES: usize = 50;

/// Run a doctor command via `sh -c` in `workdir` with an optional timeout
/// (0 = none) and extra environment.
pub async fn run_doctor(
    cmd: &str,
    workdir: &Path,
    timeout_seconds: u64,
    env: &[(&str, &str)],
) -> Result<DoctorOutcome> {
    let start = Utc::now();

    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(cmd)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in env {
        command.env(key, value);
    }

    let child = command.spawn()?;

    let output = if timeout_seconds > 0 {
        match timeout(Duration::from_secs(timeout_seconds), child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                let duration_ms = (Utc::now() - start).num_milliseconds() as u64;
                warn!(cmd, timeout_seconds, "doctor timed out");
                return Ok(DoctorOutcome::timed_out(duration_ms));
            }
        }
    } else {
        child.wait_with_output().await?
    };

    let duration_ms = (Utc::now() - start).num_milliseconds() as u64;
    let exit_code = output.status.code();
    let passed = output.status.success();

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let combined = if stderr.is_empty() {
        stdout.to_string()
    } else {
        format!("{stdout}\n{stderr}")
    };
    let lines: Vec<&str> = combined.lines().collect();
    let tail_start = lines.len().saturating_sub(TAIL_LINES);
    let output_tail = lines[tail_start..].join("\n");

    info!(cmd, passed, exit_code, duration_ms, "doctor finished");

    Ok(DoctorOutcome {
        passed,
        timed_out: false,
        exit_code,
        duration_ms,
        output_tail,
    })
}

/// Run the canary check for a doctor command.
///
/// With `mode = env`, the doctor runs once more with the canary variable set;
/// that invocation is expected to fail. An unexpected pass means the doctor
/// ignores the variable and may not be exercising anything, which is logged
/// when `warn_on_unexpected_pass` is set. The real gate is unaffected.
pub async fn run_doctor_canary(
    cmd: &str,
    workdir: &Path,
    timeout_seconds: u64,
    canary: &DoctorCanaryConfig,
) -> Result<()> {
    if canary.mode != DoctorCanaryMode::Env {
        return Ok(());
    }
    let outcome = run_doctor(cmd, workdir, timeout_seconds, &[(canary.env_var.as_str(), "1")]).await?;
    if outcome.passed && canary.warn_on_unexpected_pass {
        warn!(
            cmd,
            env_var = %canary.env_var,
            "doctor canary passed unexpectedly"
        );
    }
    Ok(())
}
