//! Configuration for the broker, capture and channel subsystems.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Dispatch broker and liveness monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Liveness ping round-trip budget; no reply within it means dead.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Wait after re-injecting a listener before declaring it usable.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Per-operation forward timeout.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Total attempts for a not-yet-ready listener, first included.
    #[serde(default = "default_max_send_attempts")]
    pub max_send_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// Advisory heartbeat sweep interval.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

fn default_probe_timeout_ms() -> u64 {
    2_000
}
fn default_settle_delay_ms() -> u64 {
    500
}
fn default_request_timeout_ms() -> u64 {
    10_000
}
fn default_max_send_attempts() -> u32 {
    4
}
fn default_backoff_base_ms() -> u64 {
    1_000
}
fn default_backoff_cap_ms() -> u64 {
    3_000
}
fn default_heartbeat_interval_ms() -> u64 {
    10_000
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: default_probe_timeout_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            max_send_attempts: default_max_send_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
        }
    }
}

impl BrokerConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Exponential backoff for a zero-based attempt index, capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .backoff_base_ms
            .saturating_mul(1u64 << attempt.min(16));
        Duration::from_millis(exp.min(self.backoff_cap_ms))
    }
}

/// Response capture state machine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    /// Consecutive stable samples required before emitting.
    #[serde(default = "default_stability_threshold")]
    pub stability_threshold: u32,
    /// Overall wait budget; replies can be very long.
    #[serde(default = "default_wait_budget_ms")]
    pub wait_budget_ms: u64,
    /// Extracted blocks shorter than this are noise, not replies.
    #[serde(default = "default_min_content_len")]
    pub min_content_len: usize,
    /// Passive re-capture poll interval.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_sample_interval_ms() -> u64 {
    450
}
fn default_stability_threshold() -> u32 {
    4
}
fn default_wait_budget_ms() -> u64 {
    600_000
}
fn default_min_content_len() -> usize {
    20
}
fn default_poll_interval_ms() -> u64 {
    2_000
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: default_sample_interval_ms(),
            stability_threshold: default_stability_threshold(),
            wait_budget_ms: default_wait_budget_ms(),
            min_content_len: default_min_content_len(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl CaptureConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn wait_budget(&self) -> Duration {
        Duration::from_millis(self.wait_budget_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Session channel settings, shared by host and client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Client-side watchdog; bounds pending-table growth.
    #[serde(default = "default_channel_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Grace window in which transport teardown means a failed handshake.
    #[serde(default = "default_connect_grace_ms")]
    pub connect_grace_ms: u64,
    #[serde(default = "default_pair_code_ttl_ms")]
    pub pair_code_ttl_ms: u64,
}

fn default_channel_timeout_ms() -> u64 {
    30_000
}
fn default_connect_grace_ms() -> u64 {
    100
}
fn default_pair_code_ttl_ms() -> u64 {
    300_000
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_channel_timeout_ms(),
            connect_grace_ms: default_connect_grace_ms(),
            pair_code_ttl_ms: default_pair_code_ttl_ms(),
        }
    }
}

impl ChannelConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_grace(&self) -> Duration {
        Duration::from_millis(self.connect_grace_ms)
    }

    pub fn pair_code_ttl(&self) -> Duration {
        Duration::from_millis(self.pair_code_ttl_ms)
    }
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChorusConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
}

fn default_port() -> u16 {
    3900
}

impl Default for ChorusConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            broker: BrokerConfig::default(),
            capture: CaptureConfig::default(),
            channel: ChannelConfig::default(),
        }
    }
}

impl ChorusConfig {
    /// Create configuration from environment and defaults.
    pub fn from_env() -> Self {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or_else(default_port);

        Self {
            port,
            ..Self::default()
        }
    }
}
