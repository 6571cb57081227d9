//! Application settings.
//!
//! Settings are resolved Figment-style: compiled-in defaults, merged with an
//! optional TOML file, merged with `TRIGCAP_`-prefixed environment variables
//! (nested keys separated by `__`, e.g. `TRIGCAP_GPIO__POLL_INTERVAL=2ms`).
//! Durations are human-readable strings ("5ms", "90s") in both file and
//! environment form.
//!
//! The defaults reproduce the deployed rig: trigger on GPIO 17, enable gate
//! on GPIO 27, a 5 ms poll, and a gphoto2 capture with six attempts, 250 ms
//! base backoff and a 90 s per-attempt timeout.

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::AppResult;

/// Digital input wiring and poll cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpioSettings {
    /// BCM pin number of the trigger line.
    pub trigger_pin: u32,
    /// BCM pin number of the enable/gate line.
    pub enable_pin: u32,
    /// Interval between input samples. Must be shorter than the narrowest
    /// pulse the source can produce.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for GpioSettings {
    fn default() -> Self {
        Self {
            trigger_pin: 17,
            enable_pin: 27,
            poll_interval: Duration::from_millis(5),
        }
    }
}

/// External capture tool invocation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSettings {
    /// Capture executable, resolved via `PATH`.
    pub tool: String,
    /// Maximum attempts per capture, counting the first.
    pub retries: u32,
    /// Base backoff delay; attempt N waits `base_delay * N` before retrying.
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Hard wall-clock limit per attempt.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Extension requested for saved images.
    pub extension: String,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            tool: "gphoto2".to_string(),
            retries: 6,
            base_delay: Duration::from_millis(250),
            timeout: Duration::from_secs(90),
            extension: "jpg".to_string(),
        }
    }
}

/// Storage-related thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Minimum free space on the base directory's filesystem, in GiB.
    pub min_free_gb: f64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self { min_free_gb: 2.0 }
    }
}

/// Top-level application settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Input wiring and polling.
    pub gpio: GpioSettings,
    /// Capture tool policy.
    pub capture: CaptureSettings,
    /// Storage thresholds.
    pub storage: StorageSettings,
}

impl Settings {
    /// Resolve settings from defaults, an optional TOML file, and the
    /// environment.
    pub fn load(config_file: Option<&Path>) -> AppResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = config_file {
            figment = figment.merge(Toml::file(path));
        }
        let settings = figment
            .merge(Env::prefixed("TRIGCAP_").split("__"))
            .extract()?;
        Ok(settings)
    }
}
