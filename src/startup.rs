//! Preflight checks before a capture run starts.
//!
//! A long unattended run should fail at launch, not three hours in. The
//! preflight verifies, in order:
//!
//! 1. the base experiment directory exists and is writable;
//! 2. the filesystem holding it has enough free space;
//! 3. desktop processes that grab the camera's USB interface are killed
//!    (`gvfsd-gphoto2` and friends steal interface 0 on stock desktops);
//! 4. the capture tool is present and can talk to the camera (`--summary`).
//!
//! Each failure maps to a distinct [`CaptureError`] so the binary can exit
//! with a code that tells the operator which check failed.

use std::path::Path;
use std::time::Duration;

use sysinfo::Disks;
use tokio::process::Command;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::capture::runner::{run_with_retry, RetryPolicy};
use crate::config::Settings;
use crate::error::{AppResult, CaptureError};

/// Process name patterns that claim the camera's USB interface.
const GRABBER_PATTERNS: &[&str] = &["gvfsd-gphoto2", "gvfs-gphoto2-volume-monitor", "gphoto2"];

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Run all preflight checks.
pub async fn preflight(settings: &Settings, base_dir: &Path) -> AppResult<()> {
    ensure_writable(base_dir)?;
    check_free_space(base_dir, settings.storage.min_free_gb)?;
    kill_usb_grabbers().await;
    probe_capture_tool(&settings.capture.tool).await?;
    Ok(())
}

/// Create the base directory and prove it accepts writes.
fn ensure_writable(base_dir: &Path) -> AppResult<()> {
    std::fs::create_dir_all(base_dir)
        .map_err(|e| CaptureError::Startup(format!("base directory {}: {e}", base_dir.display())))?;
    let probe = base_dir.join(".write_probe");
    std::fs::write(&probe, b"probe")
        .and_then(|()| std::fs::remove_file(&probe))
        .map_err(|e| {
            CaptureError::Startup(format!("base directory {} not writable: {e}", base_dir.display()))
        })?;
    info!(base_dir = %base_dir.display(), "base directory ready");
    Ok(())
}

/// Verify free space on the filesystem holding `base_dir`.
fn check_free_space(base_dir: &Path, min_free_gb: f64) -> AppResult<()> {
    let target = base_dir.canonicalize().unwrap_or_else(|_| base_dir.to_path_buf());
    let disks = Disks::new_with_refreshed_list();
    let mounts: Vec<(&Path, u64)> = disks
        .iter()
        .map(|d| (d.mount_point(), d.available_space()))
        .collect();

    match free_space_for(&target, &mounts) {
        Some(available) => {
            let free_gb = available as f64 / GIB;
            info!(free_gb = format!("{free_gb:.2}"), "disk space checked");
            if free_gb < min_free_gb {
                return Err(CaptureError::Startup(format!(
                    "only {free_gb:.2} GiB free on {}, need {min_free_gb:.2} GiB",
                    target.display()
                )));
            }
            Ok(())
        }
        None => {
            // No mount matched (containers, exotic mounts): do not block.
            warn!(target = %target.display(), "could not determine free disk space");
            Ok(())
        }
    }
}

/// Available bytes on the mount with the longest prefix of `target`.
fn free_space_for(target: &Path, mounts: &[(&Path, u64)]) -> Option<u64> {
    mounts
        .iter()
        .filter(|(mount, _)| target.starts_with(mount))
        .max_by_key(|(mount, _)| mount.as_os_str().len())
        .map(|&(_, available)| available)
}

/// Kill desktop processes that steal the camera's USB interface.
///
/// `pkill` exits non-zero when nothing matched; that is the normal case on a
/// headless rig and is ignored. A short pause afterwards lets USB settle.
async fn kill_usb_grabbers() {
    for pattern in GRABBER_PATTERNS {
        let _ = Command::new("pkill")
            .args(["-f", pattern])
            .status()
            .await
            .map_err(|e| warn!(pattern, error = %e, "pkill unavailable"));
    }
    sleep(Duration::from_millis(300)).await;
}

/// Confirm the capture tool exists and the camera responds.
async fn probe_capture_tool(tool: &str) -> AppResult<String> {
    let policy = RetryPolicy {
        max_attempts: 2,
        base_delay: Duration::from_millis(250),
        timeout: Duration::from_secs(30),
    };
    let summary = run_with_retry(tool, &["--summary".to_string()], &policy).await?;
    for line in summary.lines().filter(|l| !l.trim().is_empty()).take(8) {
        info!(tool, "{line}");
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_free_space_picks_longest_mount_prefix() {
        let root = PathBuf::from("/");
        let data = PathBuf::from("/data");
        let mounts: Vec<(&Path, u64)> = vec![(&root, 100), (&data, 42)];

        assert_eq!(
            free_space_for(Path::new("/data/experiments"), &mounts),
            Some(42)
        );
        assert_eq!(free_space_for(Path::new("/home/pi"), &mounts), Some(100));
    }

    #[test]
    fn test_free_space_none_without_match() {
        let data = PathBuf::from("/data");
        let mounts: Vec<(&Path, u64)> = vec![(&data, 42)];
        assert_eq!(free_space_for(Path::new("/srv/x"), &mounts), None);
    }

    #[test]
    fn test_ensure_writable_accepts_tempdir() {
        let dir = tempfile::tempdir().expect("tempdir");
        ensure_writable(&dir.path().join("runs")).expect("writable");
        assert!(dir.path().join("runs").is_dir());
    }
}
