//! Queue configuration and validation
//!
//! Values arrive either as a typed `QueueConfig` (usually deserialized
//! from JSON) or as loosely typed command arguments. Both go through the
//! same validators, so a rejected value never reaches the ring.

use serde::Deserialize;
use serde_json::Value;

use crate::error::QueueError;

/// Largest burst a single scheduled run may dequeue
pub const MAX_BURST: usize = 32;

/// Ring size used when the config does not set one
pub const DEFAULT_QUEUE_SIZE: usize = 1024;

pub const MIN_QUEUE_SIZE: usize = 4;
pub const MAX_QUEUE_SIZE: usize = 16384;

/// Per-packet framing overhead in bytes added to rate accounting
/// (preamble, SFD, FCS and inter-frame gap of Ethernet)
pub const DEFAULT_PKT_OVERHEAD: u64 = 24;

/// Queue module configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    /// Max packets per run, `1..=MAX_BURST`
    #[serde(default)]
    pub burst: Option<u64>,
    /// Ring capacity, power of two in `MIN_QUEUE_SIZE..=MAX_QUEUE_SIZE`
    #[serde(default)]
    pub size: Option<u64>,
    /// Touch packet heads before hand-off
    #[serde(default)]
    pub prefetch: bool,
    #[serde(default = "default_pkt_overhead")]
    pub pkt_overhead: u64,
}

fn default_pkt_overhead() -> u64 {
    DEFAULT_PKT_OVERHEAD
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            burst: None,
            size: None,
            prefetch: false,
            pkt_overhead: DEFAULT_PKT_OVERHEAD,
        }
    }
}

impl QueueConfig {
    /// Parse a JSON object such as `{"burst": 16, "size": 256}`.
    pub fn from_json(s: &str) -> Result<Self, QueueError> {
        serde_json::from_str(s).map_err(|e| QueueError::config(e.to_string()))
    }

    /// Burst to apply, validated
    pub fn burst(&self) -> Result<usize, QueueError> {
        self.burst.map_or(Ok(MAX_BURST), validate_burst)
    }

    /// Ring size to allocate, validated
    pub fn size(&self) -> Result<usize, QueueError> {
        self.size.map_or(Ok(DEFAULT_QUEUE_SIZE), validate_size)
    }
}

pub fn validate_burst(val: u64) -> Result<usize, QueueError> {
    if val == 0 || val > MAX_BURST as u64 {
        return Err(QueueError::config(format!(
            "burst size must be [1,{}]",
            MAX_BURST
        )));
    }
    Ok(val as usize)
}

pub fn validate_size(val: u64) -> Result<usize, QueueError> {
    if val < MIN_QUEUE_SIZE as u64 || val > MAX_QUEUE_SIZE as u64 {
        return Err(QueueError::config(format!(
            "must be in [{}, {}]",
            MIN_QUEUE_SIZE, MAX_QUEUE_SIZE
        )));
    }
    if !val.is_power_of_two() {
        return Err(QueueError::config("must be a power of 2"));
    }
    Ok(val as usize)
}

/// Extract an unsigned integer command argument.
pub(crate) fn uint_arg(arg: &Value, what: &str) -> Result<u64, QueueError> {
    arg.as_u64()
        .ok_or_else(|| QueueError::config(format!("{} must be an integer", what)))
}
