use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{error::PidKitError, DevicePlatform};

const fn default_batch_refill_threshold() -> usize {
    1
}

const fn default_batch_refill_size() -> usize {
    10
}

const fn default_refill_max_retries() -> usize {
    3
}

const fn default_completion_settle_ms() -> u64 {
    500
}

/// Configuration of a PID acquisition flow.
///
/// Only `platform` is required when loading from JSON; every other field has a default.
/// Foreign hosts pass the configuration as JSON through [`FlowConfig::from_json`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Platform the host app runs on.
    pub platform: DevicePlatform,
    /// Treat the simulator sentinel PIN as a request for a simulated card. Only honored in
    /// builds with the `simulator-card` feature.
    #[serde(default)]
    pub allow_simulator_card: bool,
    /// A background refill starts once a record has this many batch credentials or fewer.
    #[serde(default = "default_batch_refill_threshold")]
    pub batch_refill_threshold: usize,
    /// Credentials requested per refill.
    #[serde(default = "default_batch_refill_size")]
    pub batch_refill_size: usize,
    /// Retries of a transiently failing refill.
    #[serde(default = "default_refill_max_retries")]
    pub refill_max_retries: usize,
    /// Delay before leaving the success screen when the progress bar had to jump to 100.
    #[serde(default = "default_completion_settle_ms")]
    pub completion_settle_ms: u64,
}

impl FlowConfig {
    /// Default configuration for `platform`.
    #[must_use]
    pub const fn new(platform: DevicePlatform) -> Self {
        Self {
            platform,
            allow_simulator_card: false,
            batch_refill_threshold: default_batch_refill_threshold(),
            batch_refill_size: default_batch_refill_size(),
            refill_max_retries: default_refill_max_retries(),
            completion_settle_ms: default_completion_settle_ms(),
        }
    }

    /// Parses a configuration from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`PidKitError::SerializationError`] if the JSON is malformed and
    /// [`PidKitError::InvalidInput`] if the refill size is zero.
    pub fn from_json(json: &str) -> Result<Self, PidKitError> {
        let config: Self = serde_json::from_str(json)?;
        if config.batch_refill_size == 0 {
            return Err(PidKitError::InvalidInput {
                attribute: "batch_refill_size".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(config)
    }

    /// Whether the simulator sentinel PIN selects a simulated card in this build.
    #[must_use]
    pub fn simulator_card_allowed(&self) -> bool {
        if !self.allow_simulator_card {
            return false;
        }
        if !cfg!(feature = "simulator-card") {
            log::warn!(
                "allow_simulator_card is set but this build lacks the simulator-card feature; ignoring"
            );
            return false;
        }
        true
    }

    /// Delay before leaving the success screen.
    #[must_use]
    pub const fn completion_settle(&self) -> Duration {
        Duration::from_millis(self.completion_settle_ms)
    }
}
