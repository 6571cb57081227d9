//! Retrying runner for the external capture tool.
//!
//! Camera subsystems fail in two distinct ways: transiently (the device is
//! briefly claimed by another process, a USB transaction is mid-flight) and
//! fatally (wrong invocation, unplugged camera, broken tool). The runner
//! retries the first class with a linear backoff and fails fast on the
//! second, so a real fault is never masked behind a retry loop.
//!
//! A per-attempt wall-clock timeout counts as transient: the camera may have
//! been wedged by a grabber process that has since been killed. The child is
//! spawned with `kill_on_drop` so a timed-out attempt does not keep the USB
//! interface claimed while the next attempt runs.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::error::{AppResult, CaptureError};

/// Output substrings (matched case-insensitively) that mark a failure as
/// transient. These are the messages the camera subsystem emits while the
/// device is busy or mid-I/O.
const TRANSIENT_MARKERS: &[&str] = &[
    "camera busy",
    "ptp i/o error",
    "could not claim the usb device",
    "resource busy",
    "i/o in progress",
    "device busy",
];

/// Defines a policy for retrying a capture command.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum attempts, counting the first.
    pub max_attempts: u32,
    /// Attempt N sleeps `base_delay * N` before the next try.
    pub base_delay: Duration,
    /// Hard wall-clock limit per attempt.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_millis(250),
            timeout: Duration::from_secs(90),
        }
    }
}

/// True if the combined tool output matches a transient marker.
fn is_transient(combined_output: &str) -> bool {
    let lower = combined_output.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| lower.contains(m))
}

/// Run `program` with `args`, retrying transient failures per `policy`.
///
/// Returns the tool's stdout on exit 0. For capture invocations the caller
/// is still responsible for verifying that the expected output file exists;
/// a zero exit code alone is not proof of a saved image.
///
/// # Errors
///
/// - [`CaptureError::ToolMissing`] if the program cannot be found (never
///   retried).
/// - [`CaptureError::CommandFailed`] on a non-transient failure (fail fast)
///   or once transient retries are exhausted; carries the last captured
///   stdout/stderr.
pub async fn run_with_retry(
    program: &str,
    args: &[String],
    policy: &RetryPolicy,
) -> AppResult<String> {
    let mut last_err = String::new();
    let mut last_was_timeout = false;

    for attempt in 1..=policy.max_attempts.max(1) {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match timeout(policy.timeout, child).await {
            Err(_elapsed) => {
                last_err = format!("timed out after {:?}", policy.timeout);
                last_was_timeout = true;
                warn!(program, attempt, "capture command timed out, will retry");
                sleep(policy.base_delay * attempt).await;
                continue;
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CaptureError::ToolMissing(program.to_string()));
            }
            Ok(Err(e)) => return Err(CaptureError::Io(e)),
            Ok(Ok(output)) => output,
        };

        if output.status.success() {
            debug!(program, attempt, "capture command succeeded");
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        last_err = format!(
            "rc={}\nSTDOUT:\n{stdout}\nSTDERR:\n{stderr}",
            output
                .status
                .code()
                .map_or_else(|| "signal".to_string(), |c| c.to_string()),
        );

        if is_transient(&format!("{stdout}\n{stderr}")) {
            last_was_timeout = false;
            warn!(program, attempt, "transient capture failure, backing off");
            sleep(policy.base_delay * attempt).await;
            continue;
        }

        // Non-transient: do not burn the remaining attempts.
        return Err(CaptureError::CommandFailed(format!(
            "{program}: {last_err}"
        )));
    }

    if last_was_timeout {
        return Err(CaptureError::CommandTimeout(policy.timeout));
    }
    Err(CaptureError::CommandFailed(format!(
        "{program} failed after {} attempts: {last_err}",
        policy.max_attempts
    )))
}
