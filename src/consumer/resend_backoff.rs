use std::cmp::min;
use std::time::Duration;

use crate::config::ConsumerControllerConfig;

/// The interval after which the consumer controller repeats its last `Request` or `Resend` if
///  there was no progress. It grows by a configurable factor on each consecutive timeout.
pub struct ResendBackoff {
    interval: Duration,

    config_min_interval: Duration,
    config_max_interval: Duration,
    config_factor_eighths: u32,
}

impl ResendBackoff {
    pub fn new(config: &ConsumerControllerConfig) -> Self {
        let result = ResendBackoff {
            interval: config.resend_interval_min,
            config_min_interval: config.resend_interval_min,
            config_max_interval: config.resend_interval_max,
            config_factor_eighths: config.resend_backoff_factor_eighths,
        };

        assert!(result.config_factor_eighths >= 8);

        result
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// called on progress
    pub fn reset(&mut self) {
        self.interval = self.config_min_interval;
    }

    pub fn on_timeout(&mut self) {
        let increased = (self.interval * self.config_factor_eighths) / 8;
        self.interval = min(increased, self.config_max_interval);
    }
}
