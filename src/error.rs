//! Error handling for the flow communication service
//!
//! One enum covers the whole surface: protocol decode failures, instrument
//! status errors, transport loss and scheduling advisories. The serializer
//! decides retry vs. surface through [`FlowSrvError::is_recoverable`].

use thiserror::Error;

use crate::protocols::propar::types::Status;

/// Service-wide error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FlowSrvError {
    /// DDE number absent from the parameter database
    #[error("unknown DDE parameter: {0}")]
    UnknownParameter(u16),

    /// Node address outside 1..=247
    #[error("invalid instrument address: {0}")]
    InvalidAddress(u8),

    /// Message head or body disagrees with the frame contents
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Parameter-index type bits outside the wire table
    #[error("unknown parameter type bits: 0x{0:02X}")]
    UnknownType(u8),

    /// A parameter's declared type asks for more bytes than remain
    #[error("truncated {0} value")]
    TruncatedValue(&'static str),

    /// Non-zero PROPAR status returned by the instrument
    #[error("instrument status: {0}")]
    StatusError(Status),

    /// No matching response arrived before the response deadline
    #[error("no answer within the response timeout")]
    TimeoutAnswer,

    /// The serial handle failed or went away mid-operation
    #[error("serial port lost: {0}")]
    PortLost(String),

    /// Advisory: the address is temporarily skipped by the poller
    #[error("address {0} is quarantined")]
    Quarantined(u8),

    /// Configuration-related errors
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Invalid parameters or operations
    #[error("validation error: {0}")]
    ValidationError(String),
}

/// Result type alias for the flow communication service
pub type Result<T> = std::result::Result<T, FlowSrvError>;

impl FlowSrvError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        FlowSrvError::MalformedMessage(msg.into())
    }

    pub fn port_lost(msg: impl Into<String>) -> Self {
        FlowSrvError::PortLost(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        FlowSrvError::ConfigError(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        FlowSrvError::ValidationError(msg.into())
    }

    pub fn status(code: u8) -> Self {
        FlowSrvError::StatusError(Status::from_code(code))
    }

    /// Whether the port serializer may retry the operation.
    ///
    /// Timeouts, lost ports and malformed replies are transient on USB
    /// adapters; everything else surfaces immediately.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FlowSrvError::TimeoutAnswer
                | FlowSrvError::PortLost(_)
                | FlowSrvError::MalformedMessage(_)
                | FlowSrvError::TruncatedValue(_)
        )
    }

    /// The PROPAR status carried by a [`FlowSrvError::StatusError`], if any.
    pub fn status_code(&self) -> Option<u8> {
        match self {
            FlowSrvError::StatusError(status) => Some(status.code()),
            _ => None,
        }
    }

    /// Whether recovery requires tearing down and recreating the port driver.
    pub fn needs_port_rebuild(&self) -> bool {
        matches!(self, FlowSrvError::PortLost(_))
    }
}

impl From<std::io::Error> for FlowSrvError {
    fn from(err: std::io::Error) -> Self {
        FlowSrvError::PortLost(err.to_string())
    }
}

impl From<anyhow::Error> for FlowSrvError {
    fn from(err: anyhow::Error) -> Self {
        FlowSrvError::ConfigError(err.to_string())
    }
}
