//! Connection-health supervision
//!
//! Classifies opaque failures by message substring, tracks consecutive errors
//! per address, quarantines chronically failing addresses and accounts for
//! recoveries. All timing is monotonic.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::FlowSrvError;

/// Consecutive failures that trigger a quarantine.
pub const QUARANTINE_THRESHOLD: u32 = 10;
/// How long a quarantined address is skipped.
pub const QUARANTINE_DURATION: Duration = Duration::from_secs(60);
/// Error-free interval after which the consecutive counter resets.
pub const QUIET_RESET: Duration = Duration::from_secs(30);

/// Failure classification derived from the error message.
///
/// The classifier exists for wrapping third-party I/O errors whose types are
/// opaque; service-native errors carry their class in their own text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorClass {
    BadFileDescriptor,
    PortClosed,
    SerialConnectionLost,
    DeviceDisconnected,
    Timeout,
    ParseError,
    PermissionDenied,
    Other,
}

impl ErrorClass {
    /// Classify by lowercase substring; first match wins.
    pub fn classify(message: &str) -> Self {
        const TABLE: &[(ErrorClass, &[&str])] = &[
            (
                ErrorClass::BadFileDescriptor,
                &["bad file descriptor", "errno 9", "write failed", "read failed"],
            ),
            (
                ErrorClass::PortClosed,
                &["port is closed", "file descriptor is none", "port that is not open"],
            ),
            (
                ErrorClass::SerialConnectionLost,
                &["serial connection lost", "connection lost"],
            ),
            (
                ErrorClass::DeviceDisconnected,
                &[
                    "device disconnected",
                    "device not configured",
                    "no such device",
                    "no such file or directory",
                ],
            ),
            (ErrorClass::Timeout, &["timeout"]),
            (
                ErrorClass::ParseError,
                &[
                    "malformed message",
                    "truncated",
                    "index out of range",
                    "unpack requires",
                ],
            ),
            (ErrorClass::PermissionDenied, &["permission denied"]),
        ];

        let message = message.to_lowercase();
        for (class, needles) in TABLE {
            if needles.iter().any(|needle| message.contains(needle)) {
                return *class;
            }
        }
        ErrorClass::Other
    }

    pub fn classify_error(error: &FlowSrvError) -> Self {
        Self::classify(&error.to_string())
    }

    /// How long to let the bus settle after this failure class.
    pub fn recovery_delay(&self) -> Duration {
        match self {
            ErrorClass::BadFileDescriptor | ErrorClass::DeviceDisconnected => {
                Duration::from_millis(1_000)
            }
            ErrorClass::PortClosed | ErrorClass::SerialConnectionLost => {
                Duration::from_millis(500)
            }
            ErrorClass::Timeout => Duration::from_millis(100),
            _ => Duration::from_millis(50),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::BadFileDescriptor => "bad_file_descriptor",
            ErrorClass::PortClosed => "port_closed",
            ErrorClass::SerialConnectionLost => "serial_connection_lost",
            ErrorClass::DeviceDisconnected => "device_disconnected",
            ErrorClass::Timeout => "timeout",
            ErrorClass::ParseError => "parse_error",
            ErrorClass::PermissionDenied => "permission_denied",
            ErrorClass::Other => "other",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of recording one failure.
#[derive(Debug, Clone, Copy)]
pub struct FailureReport {
    pub class: ErrorClass,
    pub consecutive_errors: u32,
    pub quarantined: bool,
    /// This failure is the one that crossed the threshold
    pub newly_quarantined: bool,
}

#[derive(Debug, Default)]
struct NodeHealth {
    consecutive_errors: u32,
    in_failure: bool,
    last_error_at: Option<Instant>,
    quarantined_until: Option<Instant>,
    recoveries: u64,
    last_recovery_at: Option<Instant>,
    uptime_origin: Option<Instant>,
}

/// Per-port health accounting, keyed by node address.
#[derive(Debug, Default)]
pub struct HealthSupervisor {
    nodes: HashMap<u8, NodeHealth>,
}

impl HealthSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a classified failure for an address.
    pub fn record_failure(&mut self, address: u8, error: &FlowSrvError) -> FailureReport {
        let now = Instant::now();
        let class = ErrorClass::classify_error(error);
        let node = self.nodes.entry(address).or_default();

        // A quiet spell clears the streak before this failure counts.
        if let Some(last) = node.last_error_at {
            if now.duration_since(last) >= QUIET_RESET {
                node.consecutive_errors = 0;
            }
        }

        node.consecutive_errors += 1;
        node.in_failure = true;
        node.last_error_at = Some(now);

        let was_quarantined = node
            .quarantined_until
            .map(|until| now < until)
            .unwrap_or(false);
        let mut newly_quarantined = false;
        if node.consecutive_errors >= QUARANTINE_THRESHOLD {
            node.quarantined_until = Some(now + QUARANTINE_DURATION);
            newly_quarantined = !was_quarantined;
            if newly_quarantined {
                warn!(
                    address,
                    consecutive = node.consecutive_errors,
                    "address quarantined for {QUARANTINE_DURATION:?}"
                );
            }
        }

        debug!(
            address,
            class = %class,
            consecutive = node.consecutive_errors,
            "failure recorded"
        );

        FailureReport {
            class,
            consecutive_errors: node.consecutive_errors,
            quarantined: node.quarantined_until.map(|u| now < u).unwrap_or(false),
            newly_quarantined,
        }
    }

    /// Record a success; returns the recovery total when this success ends a
    /// failure streak.
    pub fn record_success(&mut self, address: u8) -> Option<u64> {
        let now = Instant::now();
        let node = self.nodes.entry(address).or_default();

        let recovered = node.in_failure;
        node.consecutive_errors = 0;
        node.in_failure = false;
        node.quarantined_until = None;
        if node.uptime_origin.is_none() {
            node.uptime_origin = Some(now);
        }

        if recovered {
            node.recoveries += 1;
            node.last_recovery_at = Some(now);
            info!(address, recoveries = node.recoveries, "address recovered");
            Some(node.recoveries)
        } else {
            None
        }
    }

    /// Credit a recovery without an observed exchange (forced reconnect).
    pub fn force_recovery(&mut self, address: u8) -> u64 {
        let now = Instant::now();
        let node = self.nodes.entry(address).or_default();
        node.consecutive_errors = 0;
        node.in_failure = false;
        node.quarantined_until = None;
        node.recoveries += 1;
        node.last_recovery_at = Some(now);
        if node.uptime_origin.is_none() {
            node.uptime_origin = Some(now);
        }
        node.recoveries
    }

    /// Whether the poller should skip this address right now.
    pub fn is_quarantined(&mut self, address: u8) -> bool {
        let now = Instant::now();
        match self.nodes.get_mut(&address) {
            Some(node) => match node.quarantined_until {
                Some(until) if now < until => true,
                Some(_) => {
                    node.quarantined_until = None;
                    false
                }
                None => false,
            },
            None => false,
        }
    }

    /// Apply the quiet-interval reset to every address.
    pub fn maintain(&mut self) {
        let now = Instant::now();
        for node in self.nodes.values_mut() {
            if node.consecutive_errors > 0 {
                if let Some(last) = node.last_error_at {
                    if now.duration_since(last) >= QUIET_RESET {
                        node.consecutive_errors = 0;
                    }
                }
            }
        }
    }

    pub fn consecutive_errors(&self, address: u8) -> u32 {
        self.nodes
            .get(&address)
            .map(|n| n.consecutive_errors)
            .unwrap_or(0)
    }

    pub fn recoveries(&self, address: u8) -> u64 {
        self.nodes.get(&address).map(|n| n.recoveries).unwrap_or(0)
    }

    /// Monotonic uptime since the address first came (back) up.
    pub fn uptime(&self, address: u8) -> Option<Duration> {
        self.nodes
            .get(&address)?
            .uptime_origin
            .map(|origin| origin.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout_error() -> FlowSrvError {
        FlowSrvError::TimeoutAnswer
    }

    #[test]
    fn test_classifier_first_match_wins() {
        assert_eq!(
            ErrorClass::classify("OSError: [Errno 9] Bad file descriptor"),
            ErrorClass::BadFileDescriptor
        );
        assert_eq!(
            ErrorClass::classify("write failed: broken pipe"),
            ErrorClass::BadFileDescriptor
        );
        assert_eq!(
            ErrorClass::classify("the Port Is Closed"),
            ErrorClass::PortClosed
        );
        assert_eq!(
            ErrorClass::classify("serial connection lost: stream closed"),
            ErrorClass::SerialConnectionLost
        );
        assert_eq!(
            ErrorClass::classify("no such device or address"),
            ErrorClass::DeviceDisconnected
        );
        assert_eq!(
            ErrorClass::classify("no answer within the response timeout"),
            ErrorClass::Timeout
        );
        assert_eq!(
            ErrorClass::classify("malformed message: bad head"),
            ErrorClass::ParseError
        );
        assert_eq!(
            ErrorClass::classify("permission denied opening /dev/ttyUSB0"),
            ErrorClass::PermissionDenied
        );
        assert_eq!(ErrorClass::classify("something else"), ErrorClass::Other);
    }

    #[test]
    fn test_recovery_delays() {
        assert_eq!(
            ErrorClass::BadFileDescriptor.recovery_delay(),
            Duration::from_millis(1_000)
        );
        assert_eq!(
            ErrorClass::PortClosed.recovery_delay(),
            Duration::from_millis(500)
        );
        assert_eq!(
            ErrorClass::Timeout.recovery_delay(),
            Duration::from_millis(100)
        );
        assert_eq!(
            ErrorClass::Other.recovery_delay(),
            Duration::from_millis(50)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_quarantine_after_ten_failures() {
        let mut health = HealthSupervisor::new();

        for i in 0..9 {
            let report = health.record_failure(5, &timeout_error());
            assert!(!report.quarantined, "quarantined after {} failures", i + 1);
        }
        let report = health.record_failure(5, &timeout_error());
        assert!(report.quarantined);
        assert!(report.newly_quarantined);
        assert!(health.is_quarantined(5));

        // Other addresses are unaffected.
        assert!(!health.is_quarantined(3));

        // Quarantine expires after 60 s.
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!health.is_quarantined(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_clears_streak_and_counts_recovery() {
        let mut health = HealthSupervisor::new();

        for _ in 0..4 {
            health.record_failure(3, &timeout_error());
        }
        assert_eq!(health.consecutive_errors(3), 4);

        let recoveries = health.record_success(3);
        assert_eq!(recoveries, Some(1));
        assert_eq!(health.consecutive_errors(3), 0);
        assert!(health.uptime(3).is_some());

        // A success without a preceding failure is not a recovery.
        assert_eq!(health.record_success(3), None);
        assert_eq!(health.recoveries(3), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_interval_resets_streak() {
        let mut health = HealthSupervisor::new();

        for _ in 0..5 {
            health.record_failure(7, &timeout_error());
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        let report = health.record_failure(7, &timeout_error());
        assert_eq!(report.consecutive_errors, 1);

        // maintain() alone also clears a stale streak.
        tokio::time::advance(Duration::from_secs(31)).await;
        health.maintain();
        assert_eq!(health.consecutive_errors(7), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_lifts_quarantine_early() {
        let mut health = HealthSupervisor::new();
        for _ in 0..10 {
            health.record_failure(9, &timeout_error());
        }
        assert!(health.is_quarantined(9));

        health.record_success(9);
        assert!(!health.is_quarantined(9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_recovery_accounting() {
        let mut health = HealthSupervisor::new();
        assert_eq!(health.force_recovery(4), 1);
        assert_eq!(health.force_recovery(4), 2);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(health.uptime(4).unwrap() >= Duration::from_secs(5));
    }
}
