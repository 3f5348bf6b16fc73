//! Sync configuration.

use std::time::Duration;

use covalue_core::LogConfig;

/// Backoff for peer loads that get no answer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Load requests sent to one peer before it is marked unavailable.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Wait after the `retry`-th resend (1-based), capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .powi(retry.saturating_sub(1).min(i32::MAX as u32) as i32);
        let delay = self.initial_delay.as_secs_f64() * factor;
        if !delay.is_finite() || delay >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay)
    }
}

/// Configuration for sync behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Wait for the first answer to a load request.
    pub load_timeout: Duration,
    pub retry: RetryConfig,
    /// Time one driver turn may spend on inbound messages.
    pub turn_budget: Duration,
    /// Ask at most this many server peers per CoValue.
    pub max_server_peers: Option<usize>,
    /// Verify signatures of content received from peers.
    pub verify_content: bool,
    pub log: LogConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            load_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            turn_budget: Duration::from_millis(50),
            max_server_peers: None,
            verify_content: true,
            log: LogConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn with_load_timeout(mut self, timeout: Duration) -> Self {
        self.load_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_turn_budget(mut self, budget: Duration) -> Self {
        self.turn_budget = budget;
        self
    }

    pub fn with_max_server_peers(mut self, max: usize) -> Self {
        self.max_server_peers = Some(max);
        self
    }

    pub fn with_verify_content(mut self, verify: bool) -> Self {
        self.verify_content = verify;
        self
    }

    pub fn with_log_config(mut self, log: LogConfig) -> Self {
        self.log = log;
        self
    }
}
