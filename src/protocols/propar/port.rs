//! Per-port serialization layer
//!
//! One logical port owns one driver at a time behind an exclusive gate. Many
//! instrument facades share the gate; operations are serialized, retried with
//! progressive sleeps on transient failures, and the driver is torn down and
//! recreated (bumping the recreation epoch) when the serial handle is lost.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::constants::{MAX_ATTEMPTS, RETRY_SLEEPS_MS};
use super::master::{FrameStats, ProparMaster};
use super::transport::LinkFactory;
use super::types::{Command, Parameter, ParameterValue, Status};
use crate::config::SerialConfig;
use crate::error::{FlowSrvError, Result};

/// Per-port operation statistics.
#[derive(Debug, Default, Clone, Serialize)]
pub struct PortStats {
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    /// Acquisitions that found the gate busy and had to wait
    pub concurrent_attempts_blocked: u64,
    /// Longest gate hold from acquire to release
    pub longest_operation_ms: u64,
}

#[derive(Default)]
struct MasterSlot {
    master: Option<Arc<ProparMaster>>,
}

#[derive(Clone, Copy)]
enum Op<'a> {
    Read(&'a [Parameter]),
    Write(&'a [Parameter], Command),
}

enum OpOutput {
    Values(Vec<ParameterValue>),
    Status(Status),
}

/// Exclusive-access manager for one physical port.
pub struct PortManager {
    name: Arc<str>,
    factory: Arc<dyn LinkFactory>,
    config: SerialConfig,
    /// The gate: holding this is holding the port
    gate: Mutex<MasterSlot>,
    stats: StdMutex<PortStats>,
    /// Bumped on every driver creation; stale handles never match
    epoch: AtomicU64,
}

impl PortManager {
    pub fn new(factory: Arc<dyn LinkFactory>, config: SerialConfig) -> Self {
        let name: Arc<str> = factory.port_name().into();
        Self {
            name,
            factory,
            config,
            gate: Mutex::new(MasterSlot::default()),
            stats: StdMutex::new(PortStats::default()),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current recreation epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> PortStats {
        self.stats.lock().expect("port stats poisoned").clone()
    }

    /// Frame counters of the current driver, if one exists.
    pub async fn frame_stats(&self) -> Option<FrameStats> {
        let slot = self.gate.lock().await;
        slot.master.as_ref().map(|m| m.frame_stats())
    }

    /// Serialized batched read with the full retry budget.
    pub async fn read_parameters(&self, params: &[Parameter]) -> Result<Vec<ParameterValue>> {
        match self.execute(Op::Read(params), MAX_ATTEMPTS).await? {
            OpOutput::Values(values) => Ok(values),
            OpOutput::Status(_) => Err(FlowSrvError::validation("read produced a status result")),
        }
    }

    /// Serialized batched read, single attempt; used by the bus scanner probe.
    pub async fn read_parameters_once(&self, params: &[Parameter]) -> Result<Vec<ParameterValue>> {
        match self.execute(Op::Read(params), 1).await? {
            OpOutput::Values(values) => Ok(values),
            OpOutput::Status(_) => Err(FlowSrvError::validation("read produced a status result")),
        }
    }

    /// Serialized batched write with the full retry budget.
    pub async fn write_parameters(
        &self,
        params: &[Parameter],
        command: Command,
    ) -> Result<Status> {
        match self.execute(Op::Write(params, command), MAX_ATTEMPTS).await? {
            OpOutput::Status(status) => Ok(status),
            OpOutput::Values(_) => Err(FlowSrvError::validation("write produced values")),
        }
    }

    /// Close and recreate the port driver, abandoning stale pending slots.
    ///
    /// Callers with requests in flight observe `PortLost`.
    pub async fn force_reconnect(&self) -> Result<u64> {
        let mut slot = self.gate.lock().await;
        if let Some(old) = slot.master.take() {
            info!(port = %self.name, epoch = old.epoch(), "forcing port reconnection");
            old.shutdown();
        }
        let master = self.ensure_master(&mut slot).await?;
        Ok(master.epoch())
    }

    /// Drop the driver without recreating it; the next operation reopens.
    pub async fn close(&self) {
        let mut slot = self.gate.lock().await;
        if let Some(old) = slot.master.take() {
            old.shutdown();
        }
    }

    async fn execute(&self, op: Op<'_>, max_attempts: u32) -> Result<OpOutput> {
        let mut last_err = None;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let idx = (attempt as usize - 1).min(RETRY_SLEEPS_MS.len() - 1);
                let pause = Duration::from_millis(RETRY_SLEEPS_MS[idx]);
                debug!(
                    port = %self.name,
                    attempt = attempt + 1,
                    "retrying after {:?}",
                    pause
                );
                sleep(pause).await;
            }

            // Count callers that found the port busy before blocking on it.
            let mut slot = match self.gate.try_lock() {
                Ok(slot) => slot,
                Err(_) => {
                    self.stats
                        .lock()
                        .expect("port stats poisoned")
                        .concurrent_attempts_blocked += 1;
                    self.gate.lock().await
                }
            };

            let acquired = Instant::now();
            self.stats
                .lock()
                .expect("port stats poisoned")
                .total_operations += 1;

            let result = match self.ensure_master(&mut slot).await {
                Ok(master) => match op {
                    Op::Read(params) => {
                        master.read_parameters(params).await.map(OpOutput::Values)
                    }
                    Op::Write(params, command) => master
                        .write_parameters(params, command)
                        .await
                        .map(OpOutput::Status),
                },
                Err(e) => Err(e),
            };

            let elapsed_ms = acquired.elapsed().as_millis() as u64;
            {
                let mut stats = self.stats.lock().expect("port stats poisoned");
                if result.is_ok() {
                    stats.successful_operations += 1;
                } else {
                    stats.failed_operations += 1;
                }
                if elapsed_ms > stats.longest_operation_ms {
                    stats.longest_operation_ms = elapsed_ms;
                }
            }

            match result {
                Ok(output) => return Ok(output),
                Err(e) => {
                    if e.needs_port_rebuild() {
                        // The handle is gone; rebuild before the next attempt.
                        if let Some(old) = slot.master.take() {
                            old.shutdown();
                        }
                    }
                    if !e.is_recoverable() {
                        return Err(e);
                    }
                    warn!(
                        port = %self.name,
                        attempt = attempt + 1,
                        max_attempts,
                        "recoverable failure: {e}"
                    );
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| FlowSrvError::validation("no attempts executed")))
    }

    async fn ensure_master(&self, slot: &mut MasterSlot) -> Result<Arc<ProparMaster>> {
        if let Some(master) = &slot.master {
            return Ok(master.clone());
        }

        let epoch = self.epoch.fetch_add(1, Ordering::Relaxed) + 1;
        info!(port = %self.name, epoch, "creating port driver");
        let master = Arc::new(
            ProparMaster::connect(
                self.factory.as_ref(),
                self.config.response_timeout(),
                epoch,
            )
            .await?,
        );
        slot.master = Some(master.clone());
        Ok(master)
    }
}

impl std::fmt::Debug for PortManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortManager")
            .field("name", &self.name)
            .field("epoch", &self.epoch())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::propar::simulator::{BusSimulator, NodeConfig, SimLinkFactory};
    use crate::protocols::propar::types::ParameterType;

    fn test_config() -> SerialConfig {
        SerialConfig {
            port: "SIM0".to_string(),
            response_timeout_ms: 150,
            ..Default::default()
        }
    }

    async fn port_with_node(node: u8) -> (Arc<PortManager>, BusSimulator) {
        let sim = BusSimulator::new();
        sim.add_node(node, NodeConfig::flow_meter("AiR", 100.0)).await;
        let factory = Arc::new(SimLinkFactory::new("SIM0", sim.clone()));
        (Arc::new(PortManager::new(factory, test_config())), sim)
    }

    fn fmeasure(node: u8) -> Parameter {
        Parameter::new(33, 0, ParameterType::Float).with_node(node)
    }

    #[tokio::test]
    async fn test_read_through_gate() {
        let (port, sim) = port_with_node(3).await;
        sim.set_value(3, 33, 0, ParameterValue::Float(12.5)).await;

        let values = port.read_parameters(&[fmeasure(3)]).await.unwrap();
        assert_eq!(values, vec![ParameterValue::Float(12.5)]);
        assert_eq!(port.epoch(), 1);

        let stats = port.stats();
        assert_eq!(stats.total_operations, 1);
        assert_eq!(stats.successful_operations, 1);
        assert_eq!(stats.failed_operations, 0);
    }

    #[tokio::test]
    async fn test_timeout_then_success_retries() {
        let (port, sim) = port_with_node(3).await;
        sim.set_value(3, 33, 0, ParameterValue::Float(5.0)).await;
        sim.drop_next_replies(3, 1).await;

        let started = Instant::now();
        let values = port.read_parameters(&[fmeasure(3)]).await.unwrap();
        assert_eq!(values, vec![ParameterValue::Float(5.0)]);

        // One timed-out attempt, one retry sleep, one good attempt.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(250));
        assert!(elapsed < Duration::from_millis(600));

        let stats = port.stats();
        assert_eq!(stats.failed_operations, 1);
        assert_eq!(stats.successful_operations, 1);
        assert_eq!(stats.total_operations, 2);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausts() {
        let (port, sim) = port_with_node(3).await;
        sim.set_silent(3, true).await;

        let started = Instant::now();
        let err = port.read_parameters(&[fmeasure(3)]).await.unwrap_err();
        assert_eq!(err, FlowSrvError::TimeoutAnswer);

        // Four attempts at 150 ms plus sleeps 100+200+300 ms.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1100));
        assert_eq!(port.stats().failed_operations, 4);
    }

    #[tokio::test]
    async fn test_non_recoverable_bypasses_retry() {
        let (port, sim) = port_with_node(3).await;
        sim.set_status_fault(3, 4).await;

        let err = port.read_parameters(&[fmeasure(3)]).await.unwrap_err();
        assert_eq!(err.status_code(), Some(4));
        assert_eq!(port.stats().total_operations, 1);
    }

    #[tokio::test]
    async fn test_port_lost_recreates_driver() {
        let (port, sim) = port_with_node(3).await;
        sim.set_value(3, 33, 0, ParameterValue::Float(1.0)).await;

        // Bring the driver up, then sever its link.
        port.read_parameters(&[fmeasure(3)]).await.unwrap();
        assert_eq!(port.epoch(), 1);
        sim.disconnect_links();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The lost handle is rebuilt behind the retry.
        let values = port.read_parameters(&[fmeasure(3)]).await.unwrap();
        assert_eq!(values, vec![ParameterValue::Float(1.0)]);
        assert_eq!(port.epoch(), 2);
    }

    #[tokio::test]
    async fn test_force_reconnect_bumps_epoch() {
        let (port, _sim) = port_with_node(3).await;
        port.read_parameters(&[fmeasure(3)]).await.ok();
        assert_eq!(port.epoch(), 1);

        let epoch = port.force_reconnect().await.unwrap();
        assert_eq!(epoch, 2);
        assert_eq!(port.epoch(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_callers_serialize() {
        let (port, sim) = port_with_node(3).await;
        sim.set_value(3, 33, 0, ParameterValue::Float(3.0)).await;
        sim.set_reply_delay(3, Duration::from_millis(60)).await;

        let mut handles = Vec::new();
        for _ in 0..4 {
            let port = port.clone();
            handles.push(tokio::spawn(async move {
                port.read_parameters(&[fmeasure(3)]).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        let stats = port.stats();
        assert_eq!(stats.successful_operations, 4);
        assert!(stats.concurrent_attempts_blocked >= 3);
        assert!(stats.longest_operation_ms >= 60);
    }
}
