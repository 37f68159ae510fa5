//! PROPAR protocol engine
//!
//! Bronkhorst's binary parameter protocol over RS232/RS485: framing with DLE
//! stuffing, chained parameter messages, a sequence-correlating port driver,
//! the per-port serialization layer and the instrument facade.

pub mod codec;
pub mod constants;
pub mod db;
pub mod instrument;
pub mod master;
pub mod message;
pub mod port;
pub mod simulator;
pub mod transport;
pub mod types;

pub use db::{dde, ParameterDb, ParameterSpec};
pub use instrument::Instrument;
pub use master::{FrameStats, ProparMaster};
pub use port::{PortManager, PortStats};
pub use transport::{Link, LinkFactory, SerialLinkFactory};
pub use types::{Command, Parameter, ParameterType, ParameterValue, Status};
