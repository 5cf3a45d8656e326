//! Reconnection policy and session timing.

use std::time::Duration;

use parleyconf::ParleyConfig;
use rand::Rng;

/// How the transport resumes after a drop, and how long a handshake may take.
///
/// These settings are handed to the transport when it is opened; the
/// transport owns the retry loop.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Resume automatically after an unexpected drop
    pub enabled: bool,
    /// Reconnection budget
    pub attempts: u32,
    /// Initial delay between attempts
    pub delay: Duration,
    /// Ceiling for the delay between attempts
    pub delay_max: Duration,
    /// Jitter factor in [0, 1]
    pub randomization: f64,
    /// Deadline for a single connect attempt
    pub timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            attempts: 10,
            delay: Duration::from_millis(1_000),
            delay_max: Duration::from_millis(5_000),
            randomization: 0.5,
            timeout: Duration::from_millis(20_000),
        }
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &ParleyConfig) -> Self {
        let reconnect = &config.reconnect;
        Self {
            enabled: reconnect.enabled,
            attempts: reconnect.attempts,
            delay: Duration::from_millis(reconnect.delay_ms),
            delay_max: Duration::from_millis(reconnect.delay_max_ms),
            randomization: reconnect.randomization.clamp(0.0, 1.0),
            timeout: Duration::from_millis(reconnect.timeout_ms),
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.randomization = 0.0;
        self
    }

    /// Un-jittered delay before reconnect attempt `attempt`.
    ///
    /// attempt 0: no delay
    /// attempt n: min(delay * 2^(n-1), delay_max)
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.delay.saturating_mul(multiplier);
        std::cmp::min(delay, self.delay_max)
    }

    /// Delay before reconnect attempt `attempt`, jittered by
    /// `randomization` and never above `delay_max`.
    pub fn delay_for_attempt<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        if base.is_zero() || self.randomization <= 0.0 {
            return base;
        }

        let spread = base.as_secs_f64() * self.randomization;
        let jittered = base.as_secs_f64() + rng.gen_range(-spread..=spread);
        let jittered = Duration::from_secs_f64(jittered.max(0.0));
        std::cmp::min(jittered, self.delay_max)
    }
}

/// Timing of the room session itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Keep-alive period while connected
    pub heartbeat_interval: Duration,
    /// Soft deadline for a pending `connect()`
    pub connect_timeout: Duration,
    /// Messages held while the link is not connected
    pub backlog_limit: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(15_000),
            connect_timeout: Duration::from_millis(20_000),
            backlog_limit: 256,
        }
    }
}

impl SessionSettings {
    pub fn from_config(config: &ParleyConfig) -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(config.session.heartbeat_interval_ms),
            connect_timeout: Duration::from_millis(config.reconnect.timeout_ms),
            ..Default::default()
        }
    }
}

/// Where the realtime transport lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub base_url: String,
    pub path: String,
}

impl Endpoint {
    pub fn new(base_url: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            path: path.into(),
        }
    }

    pub fn from_config(config: &ParleyConfig) -> Self {
        Self::new(&config.realtime.base_url, &config.realtime.path)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.path.trim_start_matches('/')
        )
    }
}
