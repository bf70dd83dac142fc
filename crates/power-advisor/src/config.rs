use std::time::Duration;

use power_hal::HintSessionConfig;
use serde::Deserialize;
use serde::Serialize;

/// Advisor-level tuning, embedding the rate-limiter thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerAdvisorConfig {
    /// Window during which repeated display-update-imminent signals are
    /// coalesced into one forwarded notification. Zero disables the
    /// debounce entirely, so every tick forwards.
    pub update_imminent_debounce_ms: u64,
    pub hint_session: HintSessionConfig,
}

impl PowerAdvisorConfig {
    pub fn update_imminent_debounce(&self) -> Duration {
        Duration::from_millis(self.update_imminent_debounce_ms)
    }
}

impl Default for PowerAdvisorConfig {
    fn default() -> Self {
        Self {
            update_imminent_debounce_ms: 80,
            hint_session: HintSessionConfig::default(),
        }
    }
}
