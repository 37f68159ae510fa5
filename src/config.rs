//! Service configuration
//!
//! Serial line parameters and poller tuning, deserializable from the host
//! application's configuration format.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FlowSrvError, Result};
use crate::protocols::propar::constants;

/// Serial line configuration for one port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Serial port path (e.g. "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Per-read byte timeout in milliseconds
    pub byte_timeout_ms: u64,
    /// Overall response deadline per transaction in milliseconds
    pub response_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: constants::DEFAULT_BAUD_RATE,
            byte_timeout_ms: constants::DEFAULT_BYTE_TIMEOUT_MS,
            response_timeout_ms: constants::DEFAULT_RESPONSE_TIMEOUT_MS,
        }
    }
}

impl SerialConfig {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.port.is_empty() {
            return Err(FlowSrvError::config("port path cannot be empty"));
        }
        if self.baud_rate == 0 {
            return Err(FlowSrvError::config("baud rate must be greater than zero"));
        }
        if self.response_timeout_ms == 0 {
            return Err(FlowSrvError::config(
                "response timeout must be greater than zero",
            ));
        }
        Ok(())
    }

    pub fn byte_timeout(&self) -> Duration {
        Duration::from_millis(self.byte_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// Poller tuning for one port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Default polling period per node in milliseconds
    pub default_period_ms: u64,
    /// Idle slice slept at the end of each scheduler tick, in milliseconds
    pub idle_slice_ms: u64,
    /// Priority commands drained per tick
    pub priority_batch: usize,
    /// Default reply deadline for asynchronous commands in milliseconds
    pub async_timeout_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            default_period_ms: 500,
            idle_slice_ms: 2,
            priority_batch: 5,
            async_timeout_ms: 400,
        }
    }
}

impl PollerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_period_ms == 0 {
            return Err(FlowSrvError::config(
                "polling period must be greater than zero",
            ));
        }
        if self.priority_batch == 0 {
            return Err(FlowSrvError::config(
                "priority batch must be greater than zero",
            ));
        }
        Ok(())
    }

    pub fn default_period(&self) -> Duration {
        Duration::from_millis(self.default_period_ms)
    }

    pub fn idle_slice(&self) -> Duration {
        Duration::from_millis(self.idle_slice_ms)
    }

    pub fn async_timeout(&self) -> Duration {
        Duration::from_millis(self.async_timeout_ms)
    }
}
