//! Telemetry events
//!
//! Everything the core pushes to its subscribers: periodic measurements,
//! validation skips, connection recoveries and classified errors. The sink is
//! a bounded channel that never blocks the poller; overflow is counted and
//! dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

/// One periodic reading from an instrument.
#[derive(Debug, Clone, Serialize)]
pub struct Measurement {
    pub ts: DateTime<Utc>,
    pub port: String,
    pub address: u8,
    pub fmeasure: f32,
    pub fsetpoint: f32,
    pub measure: u16,
    pub setpoint: u16,
    pub fluid: String,
    pub capacity: f32,
    pub device_type: String,
}

/// A measurement suppressed by device-specific validation.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationSkip {
    pub ts: DateTime<Utc>,
    pub port: String,
    pub address: u8,
    pub kind: String,
    pub value: f32,
    pub capacity: f32,
    pub threshold: f32,
    pub reason: String,
}

/// An address came back after a failure or a forced reconnect.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionRecovery {
    pub ts: DateTime<Utc>,
    pub port: String,
    pub address: u8,
    pub recoveries_total: u64,
}

/// A classified failure attributed to one address.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEvent {
    pub ts: DateTime<Utc>,
    pub port: String,
    pub address: u8,
    pub error_type: String,
    pub message: String,
    pub details: String,
}

/// Event stream pushed to subscriber sinks.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    Measurement(Measurement),
    ValidationSkip(ValidationSkip),
    ConnectionRecovery(ConnectionRecovery),
    Error(ErrorEvent),
}

impl TelemetryEvent {
    pub fn connection_recovery(port: &str, address: u8, recoveries_total: u64) -> Self {
        TelemetryEvent::ConnectionRecovery(ConnectionRecovery {
            ts: Utc::now(),
            port: port.to_string(),
            address,
            recoveries_total,
        })
    }

    pub fn error(port: &str, address: u8, error_type: &str, message: String, details: String) -> Self {
        TelemetryEvent::Error(ErrorEvent {
            ts: Utc::now(),
            port: port.to_string(),
            address,
            error_type: error_type.to_string(),
            message,
            details,
        })
    }

    /// JSON rendering for sinks that ship events off-process.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Address the event refers to.
    pub fn address(&self) -> u8 {
        match self {
            TelemetryEvent::Measurement(e) => e.address,
            TelemetryEvent::ValidationSkip(e) => e.address,
            TelemetryEvent::ConnectionRecovery(e) => e.address,
            TelemetryEvent::Error(e) => e.address,
        }
    }
}

/// Non-blocking sender side of the event stream.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<TelemetryEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventSink {
    /// Create a sink and its subscriber end.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<TelemetryEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// A sink with no subscriber; every event is counted as dropped.
    pub fn disconnected() -> Self {
        Self::channel(1).0
    }

    /// Enqueue an event; drops instead of blocking when the subscriber lags.
    pub fn emit(&self, event: TelemetryEvent) {
        if let Err(e) = self.tx.try_send(event) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(dropped, "telemetry event dropped: {e}");
        }
    }

    /// Events lost to backpressure so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
