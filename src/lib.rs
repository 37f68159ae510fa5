//! Flow communication service
//!
//! Control and telemetry core for Bronkhorst-family mass-flow and pressure
//! instruments on shared serial buses, speaking the PROPAR binary protocol.
//! The core keeps many logical instruments live over one USB adapter: a
//! sequence-correlating port driver, a per-port serialization layer with
//! retry and driver recreation, a cooperative per-port poller, and a
//! connection-health supervisor that quarantines failing addresses instead
//! of letting one bad instrument take the bus down.

pub mod config;
pub mod error;
pub mod protocols;
pub mod registry;
pub mod runtime;

pub use config::{PollerConfig, SerialConfig};
pub use error::{FlowSrvError, Result};
pub use protocols::propar::{
    Command, Instrument, Parameter, ParameterDb, ParameterType, ParameterValue, PortManager,
    PortStats, Status,
};
pub use registry::{PortEntry, PortRegistry};
pub use runtime::{
    AsyncCommand, CommandKind, CommandPriority, DeviceType, EventSink, InstrumentInfo,
    PollerHandle, PriorityCommand, TelemetryEvent,
};
