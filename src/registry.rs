//! Process-wide port registry
//!
//! One entry per physical port, injected at startup rather than living in
//! module-level state: the registry owns the port manager and its poller,
//! and is the surface external collaborators (UI, telemetry, tooling) talk
//! to. Tests substitute factories serving an in-memory bus.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::{PollerConfig, SerialConfig};
use crate::error::{FlowSrvError, Result};
use crate::protocols::propar::instrument::Instrument;
use crate::protocols::propar::port::{PortManager, PortStats};
use crate::protocols::propar::transport::{LinkFactory, SerialLinkFactory};
use crate::protocols::propar::types::{Parameter, ParameterValue};
use crate::runtime::events::EventSink;
use crate::runtime::poller::{AsyncCommand, PollerHandle, PortPoller, PriorityCommand};
use crate::runtime::scanner::{self, InstrumentInfo, DEFAULT_PROBE_TIMEOUT};

/// One registered port: its serializer and its scheduler.
pub struct PortEntry {
    pub manager: Arc<PortManager>,
    pub poller: PollerHandle,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl PortEntry {
    fn stop(&self) {
        self.poller.shutdown();
        if let Some(task) = self.task.lock().expect("poller task slot poisoned").take() {
            task.abort();
        }
    }
}

/// Registry of every port the process controls.
pub struct PortRegistry {
    ports: DashMap<String, Arc<PortEntry>>,
    events: EventSink,
    poller_config: PollerConfig,
}

impl PortRegistry {
    pub fn new(events: EventSink, poller_config: PollerConfig) -> Self {
        Self {
            ports: DashMap::new(),
            events,
            poller_config,
        }
    }

    /// Register a serial port and start its poller.
    pub fn open_port(&self, config: SerialConfig) -> Result<Arc<PortEntry>> {
        let factory = Arc::new(SerialLinkFactory::new(config.clone())?);
        self.open_port_with_factory(factory, config)
    }

    /// Register a port over an arbitrary link factory (tests, bridges).
    pub fn open_port_with_factory(
        &self,
        factory: Arc<dyn LinkFactory>,
        config: SerialConfig,
    ) -> Result<Arc<PortEntry>> {
        let name = factory.port_name().to_string();
        if self.ports.contains_key(&name) {
            return Err(FlowSrvError::validation(format!(
                "port already registered: {name}"
            )));
        }

        let manager = Arc::new(PortManager::new(factory, config));
        let (poller, task) = PortPoller::spawn(
            manager.clone(),
            self.poller_config.clone(),
            self.events.clone(),
        );
        let entry = Arc::new(PortEntry {
            manager,
            poller,
            task: StdMutex::new(Some(task)),
        });
        self.ports.insert(name.clone(), entry.clone());
        info!(port = %name, "port registered");
        Ok(entry)
    }

    pub fn get(&self, port: &str) -> Result<Arc<PortEntry>> {
        self.ports
            .get(port)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| FlowSrvError::validation(format!("port not registered: {port}")))
    }

    pub fn port_names(&self) -> Vec<String> {
        self.ports.iter().map(|e| e.key().clone()).collect()
    }

    /// An address-scoped facade over a registered port.
    pub fn instrument(&self, port: &str, address: u8) -> Result<Instrument> {
        Instrument::new(self.get(port)?.manager.clone(), address)
    }

    pub async fn read_dde(&self, port: &str, address: u8, dde_nr: u16) -> Result<ParameterValue> {
        self.instrument(port, address)?.read_dde(dde_nr).await
    }

    pub async fn write_dde(
        &self,
        port: &str,
        address: u8,
        dde_nr: u16,
        value: ParameterValue,
    ) -> Result<()> {
        self.instrument(port, address)?.write_dde(dde_nr, value).await
    }

    pub async fn read_parameters(
        &self,
        port: &str,
        address: u8,
        params: &[Parameter],
    ) -> Result<Vec<ParameterValue>> {
        self.instrument(port, address)?.read_parameters(params).await
    }

    pub async fn write_parameters(
        &self,
        port: &str,
        address: u8,
        params: &[Parameter],
    ) -> Result<()> {
        self.instrument(port, address)?.write_parameters(params).await
    }

    /// Queue a command executed ahead of polling.
    pub fn queue_priority(&self, port: &str, command: PriorityCommand) -> Result<()> {
        self.get(port)?.poller.queue_priority(command)
    }

    /// Queue a reply-gated asynchronous command.
    pub fn queue_async(&self, port: &str, command: AsyncCommand) -> Result<()> {
        self.get(port)?.poller.queue_async(command)
    }

    pub fn add_node(&self, port: &str, address: u8, period: Option<Duration>) -> Result<()> {
        self.get(port)?.poller.add_node(address, period)
    }

    pub fn remove_node(&self, port: &str, address: u8) -> Result<()> {
        self.get(port)?.poller.remove_node(address)
    }

    /// Rebuild a port's driver and credit recoveries to its known addresses.
    pub fn force_reconnect(&self, port: &str) -> Result<()> {
        self.get(port)?.poller.force_reconnect()
    }

    /// Sweep a port for instruments and enter them into polling rotation.
    pub async fn scan(&self, port: &str) -> Result<Vec<InstrumentInfo>> {
        let entry = self.get(port)?;
        let found = scanner::scan_port(entry.manager.clone(), DEFAULT_PROBE_TIMEOUT).await?;
        for info in &found {
            entry.poller.add_node(info.address, None)?;
        }
        Ok(found)
    }

    pub fn stats(&self, port: &str) -> Result<PortStats> {
        Ok(self.get(port)?.manager.stats())
    }

    /// Stop one port's poller and close its driver.
    pub async fn close_port(&self, port: &str) -> Result<()> {
        let (_, entry) = self
            .ports
            .remove(port)
            .ok_or_else(|| FlowSrvError::validation(format!("port not registered: {port}")))?;
        entry.stop();
        entry.manager.close().await;
        info!(port, "port closed");
        Ok(())
    }

    /// Teardown: stop every poller and close every driver.
    pub async fn close_all(&self) {
        let names = self.port_names();
        for name in names {
            let _ = self.close_port(&name).await;
        }
    }
}

impl std::fmt::Debug for PortRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortRegistry")
            .field("ports", &self.port_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::propar::simulator::{BusSimulator, NodeConfig, SimLinkFactory};

    fn sim_config() -> SerialConfig {
        SerialConfig {
            port: "SIM0".to_string(),
            response_timeout_ms: 100,
            ..Default::default()
        }
    }

    async fn registry_with_sim() -> (PortRegistry, BusSimulator) {
        let sim = BusSimulator::new();
        sim.add_node(3, NodeConfig::flow_meter("AiR", 100.0)).await;
        let registry = PortRegistry::new(EventSink::disconnected(), PollerConfig::default());
        let factory = Arc::new(SimLinkFactory::new("SIM0", sim.clone()));
        registry
            .open_port_with_factory(factory, sim_config())
            .unwrap();
        (registry, sim)
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let (registry, sim) = registry_with_sim().await;
        let factory = Arc::new(SimLinkFactory::new("SIM0", sim));
        assert!(registry
            .open_port_with_factory(factory, sim_config())
            .is_err());
        registry.close_all().await;
    }

    #[tokio::test]
    async fn test_dde_access_through_registry() {
        let (registry, sim) = registry_with_sim().await;
        sim.set_value(3, 33, 0, ParameterValue::Float(4.5)).await;

        let value = registry.read_dde("SIM0", 3, 205).await.unwrap();
        assert_eq!(value, ParameterValue::Float(4.5));

        registry
            .write_dde("SIM0", 3, 206, ParameterValue::Float(9.0))
            .await
            .unwrap();
        assert_eq!(
            sim.get_value(3, 33, 3).await,
            Some(ParameterValue::Float(9.0))
        );
        registry.close_all().await;
    }

    #[tokio::test]
    async fn test_unknown_port() {
        let registry = PortRegistry::new(EventSink::disconnected(), PollerConfig::default());
        assert!(registry.get("NOPE").is_err());
        assert!(registry.read_dde("NOPE", 3, 205).await.is_err());
    }

    #[tokio::test]
    async fn test_close_port_removes_entry() {
        let (registry, _sim) = registry_with_sim().await;
        registry.close_port("SIM0").await.unwrap();
        assert!(registry.get("SIM0").is_err());
        assert!(registry.close_port("SIM0").await.is_err());
    }
}
