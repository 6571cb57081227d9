//! Linux sysfs GPIO input lines.
//!
//! Reads `/sys/class/gpio/gpio<N>/value` on every sample. The sysfs
//! interface is slow by kernel-API standards but comfortably outruns a
//! millisecond-scale poll, and it needs no elevated capabilities beyond
//! membership in the `gpio` group on a stock Raspberry Pi OS.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::error::{AppResult, CaptureError};
use crate::hardware::DigitalInput;

const GPIO_ROOT: &str = "/sys/class/gpio";

/// A digital input backed by a sysfs GPIO line.
#[derive(Debug)]
pub struct SysfsInput {
    pin: u32,
    value_path: PathBuf,
}

impl SysfsInput {
    /// Open pin `pin` as an input, exporting it if necessary.
    pub fn open(pin: u32) -> AppResult<Self> {
        let gpio_dir = PathBuf::from(format!("{GPIO_ROOT}/gpio{pin}"));

        if !gpio_dir.exists() {
            match fs::write(format!("{GPIO_ROOT}/export"), pin.to_string()) {
                Ok(()) => {
                    // The kernel creates the attribute files asynchronously;
                    // give udev a moment to fix up permissions.
                    thread::sleep(Duration::from_millis(100));
                }
                // Raced with another exporter; the directory is there now.
                Err(e) if e.kind() == ErrorKind::ResourceBusy => {}
                Err(e) => {
                    return Err(CaptureError::Startup(format!(
                        "failed to export GPIO {pin}: {e}"
                    )))
                }
            }
        }

        fs::write(gpio_dir.join("direction"), "in").map_err(|e| {
            CaptureError::Startup(format!("failed to set GPIO {pin} direction: {e}"))
        })?;

        debug!(pin, "sysfs GPIO input ready");
        Ok(Self {
            pin,
            value_path: gpio_dir.join("value"),
        })
    }

    /// BCM pin number of this line.
    pub fn pin(&self) -> u32 {
        self.pin
    }
}

impl DigitalInput for SysfsInput {
    fn is_high(&mut self) -> AppResult<bool> {
        let raw = fs::read_to_string(&self.value_path)?;
        Ok(parse_level(&raw))
    }
}

/// Interpret a sysfs value-file payload; anything but a leading '1' is low.
fn parse_level(raw: &str) -> bool {
    raw.trim_start().starts_with('1')
}
