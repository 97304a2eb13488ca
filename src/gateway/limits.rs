use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Admissions allowed per window. `0` rejects every request.
    pub max_requests: u32,
    pub window_seconds: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_requests: 50,
            window_seconds: 60,
        }
    }
}

/// Fixed-window admission counter shared by every inbound request.
///
/// The counter resets the first time a check lands at least `window_seconds`
/// after the window opened. Requests straddling a boundary can therefore see up
/// to twice `max_requests` admissions in a short span.
#[derive(Debug)]
pub struct RateLimiter {
    config: LimitsConfig,
    window_start: u64,
    requests: u32,
}

impl RateLimiter {
    pub fn new(config: LimitsConfig) -> Self {
        Self {
            config,
            window_start: 0,
            requests: 0,
        }
    }

    pub fn admit(&mut self, now: u64) -> bool {
        if now.saturating_sub(self.window_start) >= self.config.window_seconds {
            self.window_start = now;
            self.requests = 0;
        }

        if self.requests >= self.config.max_requests {
            return false;
        }
        self.requests += 1;
        true
    }

    /// Admissions counted in the current window.
    pub fn requests_in_window(&self) -> u32 {
        self.requests
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(LimitsConfig::default())
    }
}
