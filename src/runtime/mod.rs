//! Runtime services: polling, health supervision, discovery and telemetry

pub mod events;
pub mod health;
pub mod poller;
pub mod scanner;

pub use events::{EventSink, TelemetryEvent};
pub use health::{ErrorClass, HealthSupervisor};
pub use poller::{
    AsyncCommand, CommandKind, CommandPriority, PollerHandle, PortPoller, PriorityCommand,
};
pub use scanner::{scan_port, DeviceType, InstrumentInfo};
