//! Instrument facade
//!
//! Address-scoped view over a shared port. Stateless with respect to
//! connections: every operation goes through the port serializer, and DDE
//! numbers resolve through the shared parameter database.

use std::sync::Arc;

use tracing::debug;

use super::constants::{MAX_ADDRESS, MIN_ADDRESS};
use super::db::{dde, ParameterDb};
use super::port::PortManager;
use super::types::{Command, Parameter, ParameterType, ParameterValue, Status};
use crate::error::{FlowSrvError, Result};

/// One logical instrument on a shared bus.
#[derive(Clone)]
pub struct Instrument {
    port: Arc<PortManager>,
    address: u8,
    channel: u8,
    db: &'static ParameterDb,
}

impl Instrument {
    /// Create a facade for `address` on `port`; channel defaults to 1.
    pub fn new(port: Arc<PortManager>, address: u8) -> Result<Self> {
        Self::with_channel(port, address, 1)
    }

    pub fn with_channel(port: Arc<PortManager>, address: u8, channel: u8) -> Result<Self> {
        if !(MIN_ADDRESS..=MAX_ADDRESS).contains(&address) {
            return Err(FlowSrvError::InvalidAddress(address));
        }
        Ok(Self {
            port,
            address,
            channel,
            db: ParameterDb::global(),
        })
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn port_name(&self) -> &str {
        self.port.name()
    }

    /// Read a single parameter.
    pub async fn read(
        &self,
        proc_nr: u8,
        parm_nr: u8,
        parm_type: ParameterType,
    ) -> Result<ParameterValue> {
        let parm = Parameter::new(proc_nr, parm_nr, parm_type);
        let mut values = self.read_parameters(std::slice::from_ref(&parm)).await?;
        values
            .pop()
            .ok_or_else(|| FlowSrvError::malformed("empty parameter reply"))
    }

    /// Write a single parameter with acknowledgement.
    pub async fn write(
        &self,
        proc_nr: u8,
        parm_nr: u8,
        parm_type: ParameterType,
        value: ParameterValue,
    ) -> Result<()> {
        let parm = Parameter::new(proc_nr, parm_nr, parm_type).with_value(value);
        self.write_parameters(std::slice::from_ref(&parm)).await
    }

    /// Batched read. Every descriptor is copied and stamped with this
    /// instrument's address; the caller's input is never mutated.
    pub async fn read_parameters(&self, params: &[Parameter]) -> Result<Vec<ParameterValue>> {
        let stamped = self.stamp(params);
        self.port.read_parameters(&stamped).await
    }

    /// Batched read without the retry budget; used for discovery probes.
    pub async fn read_parameters_once(&self, params: &[Parameter]) -> Result<Vec<ParameterValue>> {
        let stamped = self.stamp(params);
        self.port.read_parameters_once(&stamped).await
    }

    /// Batched write with acknowledgement, node-stamped like reads.
    pub async fn write_parameters(&self, params: &[Parameter]) -> Result<()> {
        let stamped = self.stamp(params);
        let status = self
            .port
            .write_parameters(&stamped, Command::SendWithAck)
            .await?;
        if status.is_ok() {
            Ok(())
        } else {
            Err(FlowSrvError::StatusError(status))
        }
    }

    /// Read a parameter by DDE number.
    pub async fn read_dde(&self, dde_nr: u16) -> Result<ParameterValue> {
        let spec = self.db.get(dde_nr)?;
        debug!(
            port = %self.port_name(),
            address = self.address,
            dde = dde_nr,
            name = spec.name,
            "dde read"
        );
        self.read(spec.proc_nr, spec.parm_nr, spec.parm_type).await
    }

    /// Read several DDE numbers in one chained message.
    pub async fn read_ddes(&self, dde_nrs: &[u16]) -> Result<Vec<ParameterValue>> {
        let params = self.db.descriptors(dde_nrs)?;
        self.read_parameters(&params).await
    }

    /// Write a parameter by DDE number.
    pub async fn write_dde(&self, dde_nr: u16, value: ParameterValue) -> Result<()> {
        let spec = self.db.get(dde_nr)?;
        debug!(
            port = %self.port_name(),
            address = self.address,
            dde = dde_nr,
            name = spec.name,
            "dde write"
        );
        self.write(spec.proc_nr, spec.parm_nr, spec.parm_type, value)
            .await
    }

    /// Raw measure reading, 0..32000 spanning 0..100 %.
    pub async fn measure(&self) -> Result<u16> {
        match self.read_dde(dde::MEASURE).await? {
            ParameterValue::Int16(v) => Ok(v),
            other => Err(FlowSrvError::malformed(format!(
                "measure carried unexpected value {other:?}"
            ))),
        }
    }

    /// Raw setpoint write, 0..32000 spanning 0..100 %.
    pub async fn set_setpoint(&self, setpoint: u16) -> Result<()> {
        self.write_dde(dde::SETPOINT, ParameterValue::Int16(setpoint))
            .await
    }

    /// Blink the instrument display for `seconds`.
    pub async fn wink(&self, seconds: i8) -> Result<()> {
        self.write_dde(dde::WINK, ParameterValue::Int8(seconds)).await
    }

    /// Write with a chosen command, for fire-and-forget and broadcast cases.
    pub async fn write_parameters_with_command(
        &self,
        params: &[Parameter],
        command: Command,
    ) -> Result<Status> {
        let stamped = self.stamp(params);
        self.port.write_parameters(&stamped, command).await
    }

    /// Copy descriptors, stamping in this instrument's address.
    fn stamp(&self, params: &[Parameter]) -> Vec<Parameter> {
        params
            .iter()
            .map(|parm| parm.clone().with_node(self.address))
            .collect()
    }
}

impl std::fmt::Debug for Instrument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instrument")
            .field("port", &self.port_name())
            .field("address", &self.address)
            .field("channel", &self.channel)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SerialConfig;
    use crate::protocols::propar::simulator::{BusSimulator, NodeConfig, SimLinkFactory};

    async fn instrument_on(node: u8) -> (Instrument, BusSimulator) {
        let sim = BusSimulator::new();
        sim.add_node(node, NodeConfig::flow_meter("AiR", 100.0)).await;
        let factory = Arc::new(SimLinkFactory::new("SIM0", sim.clone()));
        let config = SerialConfig {
            port: "SIM0".to_string(),
            response_timeout_ms: 150,
            ..Default::default()
        };
        let port = Arc::new(PortManager::new(factory, config));
        (Instrument::new(port, node).unwrap(), sim)
    }

    #[test]
    fn test_address_validation() {
        let sim = BusSimulator::new();
        let factory = Arc::new(SimLinkFactory::new("SIM0", sim));
        let port = Arc::new(PortManager::new(
            factory,
            SerialConfig::new("SIM0"),
        ));

        assert!(matches!(
            Instrument::new(port.clone(), 0),
            Err(FlowSrvError::InvalidAddress(0))
        ));
        assert!(matches!(
            Instrument::new(port.clone(), 248),
            Err(FlowSrvError::InvalidAddress(248))
        ));
        assert!(Instrument::new(port.clone(), 1).is_ok());
        assert!(Instrument::new(port, 247).is_ok());
    }

    #[tokio::test]
    async fn test_dde_roundtrip() {
        let (inst, _sim) = instrument_on(3).await;

        inst.write_dde(9, ParameterValue::Int16(16000)).await.unwrap();
        assert_eq!(inst.read_dde(9).await.unwrap(), ParameterValue::Int16(16000));
    }

    #[tokio::test]
    async fn test_unknown_dde() {
        let (inst, _sim) = instrument_on(3).await;
        let err = inst.read_dde(9999).await.unwrap_err();
        assert_eq!(err, FlowSrvError::UnknownParameter(9999));
    }

    #[tokio::test]
    async fn test_node_stamping_copies_descriptors() {
        let (inst, sim) = instrument_on(3).await;
        sim.set_value(3, 33, 0, ParameterValue::Float(2.25)).await;

        // Descriptors arrive without a node; the facade must not mutate them.
        let params = vec![Parameter::new(33, 0, ParameterType::Float)];
        let values = inst.read_parameters(&params).await.unwrap();
        assert_eq!(values, vec![ParameterValue::Float(2.25)]);
        assert!(params[0].node.is_none());
    }

    #[tokio::test]
    async fn test_measure_and_setpoint_helpers() {
        let (inst, sim) = instrument_on(3).await;
        sim.set_value(3, 1, 0, ParameterValue::Int16(8000)).await;

        assert_eq!(inst.measure().await.unwrap(), 8000);
        inst.set_setpoint(32000).await.unwrap();
        assert_eq!(
            sim.get_value(3, 1, 1).await,
            Some(ParameterValue::Int16(32000))
        );
    }
}
