//! Per-port poller
//!
//! One cooperative loop per port interleaves three kinds of work on the
//! shared bus: high-priority user commands, reply-gated asynchronous commands
//! and periodic node polling. Producers reach the loop through thread-safe
//! queues; nothing inside a tick blocks on user code.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, trace, warn};

use super::events::{EventSink, Measurement, TelemetryEvent, ValidationSkip};
use super::health::HealthSupervisor;
use crate::config::PollerConfig;
use crate::error::Result;
use crate::protocols::propar::db::dde;
use crate::protocols::propar::instrument::Instrument;
use crate::protocols::propar::port::PortManager;
use crate::protocols::propar::types::ParameterValue;

/// DDE bundle read on every periodic poll.
pub const POLL_BUNDLE: [u16; 8] = [
    dde::FMEASURE,
    dde::FLUID_NAME,
    dde::MEASURE,
    dde::SETPOINT,
    dde::FSETPOINT,
    dde::CAPACITY,
    dde::DEVICE_TYPE,
    dde::IDENT_NUMBER,
];

/// Ident number reported by digital mass-flow controllers.
const DMFC_IDENT: i64 = 7;
/// Measurements beyond this multiple of capacity are discarded on DMFCs.
const DMFC_CAPACITY_FACTOR: f32 = 1.5;
/// Window within which two due nodes count as simultaneously due.
const FAIR_WINDOW: Duration = Duration::from_millis(5);
/// First-poll offset applied per already-known node.
const STAGGER_STEP: Duration = Duration::from_millis(20);

/// Priority classes for queued commands, most urgent first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CommandPriority {
    /// Setpoints and safety stops
    Critical = 1,
    /// Fluid or mode changes
    High = 2,
    Normal = 3,
    Low = 4,
    Background = 5,
}

/// What a queued command does once the poller picks it up.
#[derive(Debug, Clone)]
pub enum CommandKind {
    /// Write fSetpoint in engineering units
    SetFlow(f32),
    /// Write the setpoint as a percentage of capacity
    SetPercent(f32),
    /// Select a fluid table entry
    SetFluid(u8),
    /// Rename the instrument
    SetUserTag(String),
    /// Write an arbitrary DDE parameter
    WriteDde { dde_nr: u16, value: ParameterValue },
    /// Read an arbitrary DDE parameter
    ReadDde { dde_nr: u16 },
}

/// A command executed ahead of polling, in priority order.
#[derive(Debug, Clone)]
pub struct PriorityCommand {
    pub address: u8,
    pub kind: CommandKind,
    pub priority: CommandPriority,
}

/// A command whose completion is gated on a reply latch.
#[derive(Debug, Clone)]
pub struct AsyncCommand {
    pub address: u8,
    pub kind: CommandKind,
    pub timeout: Duration,
}

impl AsyncCommand {
    /// Command with the default 400 ms reply deadline.
    pub fn new(address: u8, kind: CommandKind) -> Self {
        Self {
            address,
            kind,
            timeout: Duration::from_millis(400),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

enum PollerMsg {
    Priority(PriorityCommand),
    Async(AsyncCommand),
    AddNode {
        address: u8,
        period: Option<Duration>,
    },
    RemoveNode {
        address: u8,
    },
    ForceReconnect,
    Shutdown,
}

/// Producer handle into one port's poller.
#[derive(Clone)]
pub struct PollerHandle {
    tx: mpsc::UnboundedSender<PollerMsg>,
}

impl PollerHandle {
    fn send(&self, msg: PollerMsg) -> Result<()> {
        self.tx
            .send(msg)
            .map_err(|_| crate::error::FlowSrvError::validation("poller is not running"))
    }

    pub fn queue_priority(&self, command: PriorityCommand) -> Result<()> {
        self.send(PollerMsg::Priority(command))
    }

    pub fn queue_async(&self, command: AsyncCommand) -> Result<()> {
        self.send(PollerMsg::Async(command))
    }

    /// Enter an address into the polling rotation.
    pub fn add_node(&self, address: u8, period: Option<Duration>) -> Result<()> {
        self.send(PollerMsg::AddNode { address, period })
    }

    pub fn remove_node(&self, address: u8) -> Result<()> {
        self.send(PollerMsg::RemoveNode { address })
    }

    /// Ask the poller to rebuild its port and credit recoveries.
    pub fn force_reconnect(&self) -> Result<()> {
        self.send(PollerMsg::ForceReconnect)
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(PollerMsg::Shutdown);
    }
}

/// Heap entry ordering: lowest priority value first, FIFO within a class.
struct Queued {
    command: PriorityCommand,
    enqueue_seq: u64,
}

impl Queued {
    fn key(&self) -> (u8, u64) {
        (self.command.priority as u8, self.enqueue_seq)
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; invert so the smallest key pops first.
        other.key().cmp(&self.key())
    }
}

struct NodeEntry {
    period: Duration,
    next_due: Instant,
}

struct InFlightAsync {
    address: u8,
    started_at: Instant,
    timeout: Duration,
    latch: Arc<AtomicBool>,
}

/// The per-port scheduler loop.
pub struct PortPoller {
    port: Arc<PortManager>,
    config: PollerConfig,
    events: EventSink,
    rx: mpsc::UnboundedReceiver<PollerMsg>,
    nodes: HashMap<u8, NodeEntry>,
    priority: BinaryHeap<Queued>,
    async_queue: VecDeque<AsyncCommand>,
    in_flight: Option<InFlightAsync>,
    health: HealthSupervisor,
    instruments: HashMap<u8, Instrument>,
    enqueue_seq: u64,
    last_polled: Option<u8>,
}

impl PortPoller {
    /// Start the poller task for one port.
    pub fn spawn(
        port: Arc<PortManager>,
        config: PollerConfig,
        events: EventSink,
    ) -> (PollerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let poller = Self {
            port,
            config,
            events,
            rx,
            nodes: HashMap::new(),
            priority: BinaryHeap::new(),
            async_queue: VecDeque::new(),
            in_flight: None,
            health: HealthSupervisor::new(),
            instruments: HashMap::new(),
            enqueue_seq: 0,
            last_polled: None,
        };
        let task = tokio::spawn(poller.run());
        (PollerHandle { tx }, task)
    }

    async fn run(mut self) {
        info!(port = %self.port.name(), "poller started");

        loop {
            if !self.drain_messages().await {
                break;
            }
            self.run_priority_commands().await;
            self.step_async().await;
            self.poll_due_node().await;
            sleep(self.config.idle_slice()).await;
        }

        info!(port = %self.port.name(), "poller stopped");
    }

    /// Pull producer messages into the scheduler state; false to shut down.
    async fn drain_messages(&mut self) -> bool {
        loop {
            match self.rx.try_recv() {
                Ok(PollerMsg::Priority(command)) => {
                    self.enqueue_seq += 1;
                    self.priority.push(Queued {
                        command,
                        enqueue_seq: self.enqueue_seq,
                    });
                }
                Ok(PollerMsg::Async(command)) => self.async_queue.push_back(command),
                Ok(PollerMsg::AddNode { address, period }) => self.add_node(address, period),
                Ok(PollerMsg::RemoveNode { address }) => {
                    self.nodes.remove(&address);
                    self.instruments.remove(&address);
                }
                Ok(PollerMsg::ForceReconnect) => self.force_reconnect().await,
                Ok(PollerMsg::Shutdown) => return false,
                Err(mpsc::error::TryRecvError::Empty) => return true,
                Err(mpsc::error::TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn add_node(&mut self, address: u8, period: Option<Duration>) {
        if self.nodes.contains_key(&address) {
            return;
        }
        let period = period.unwrap_or_else(|| self.config.default_period());
        // Stagger first polls so a scan burst does not hit the bus at once.
        let next_due = Instant::now() + STAGGER_STEP * self.nodes.len() as u32;
        debug!(port = %self.port.name(), address, ?period, "node added to rotation");
        self.nodes.insert(address, NodeEntry { period, next_due });
    }

    /// Drain up to `priority_batch` queued commands, most urgent first.
    async fn run_priority_commands(&mut self) {
        for _ in 0..self.config.priority_batch {
            let Some(queued) = self.priority.pop() else {
                break;
            };
            let PriorityCommand { address, kind, .. } = queued.command;
            trace!(port = %self.port.name(), address, ?kind, "priority command");
            let result = self.execute_command(address, kind).await;
            self.note_result(address, result, "priority command");
        }
    }

    /// Advance the single in-flight async slot.
    async fn step_async(&mut self) {
        if let Some(flight) = self.in_flight.take() {
            if flight.latch.load(Ordering::Relaxed) {
                trace!(address = flight.address, "async reply latched");
            } else if flight.started_at.elapsed() >= flight.timeout {
                warn!(
                    port = %self.port.name(),
                    address = flight.address,
                    "async command timed out after {:?}",
                    flight.timeout
                );
                self.events.emit(TelemetryEvent::error(
                    self.port.name(),
                    flight.address,
                    "timeout",
                    "async command reply timeout".to_string(),
                    format!("no reply within {:?}", flight.timeout),
                ));
            } else {
                // Still waiting on the latch.
                self.in_flight = Some(flight);
                return;
            }
        }
        let Some(command) = self.async_queue.pop_front() else {
            return;
        };

        let latch = Arc::new(AtomicBool::new(false));
        self.in_flight = Some(InFlightAsync {
            address: command.address,
            started_at: Instant::now(),
            timeout: command.timeout,
            latch,
        });
        // A successful dispatch counts as the reply; later successful
        // operations for the same address also set the latch.
        let result = self.execute_command(command.address, command.kind).await;
        self.note_result(command.address, result, "async command");
    }

    /// Poll the most overdue node, if any is due and not quarantined.
    async fn poll_due_node(&mut self) {
        self.health.maintain();
        let now = Instant::now();

        let mut due: Vec<(Instant, u8)> = self
            .nodes
            .iter()
            .filter(|(_, entry)| entry.next_due <= now)
            .map(|(address, entry)| (entry.next_due, *address))
            .collect();
        if due.is_empty() {
            return;
        }
        due.sort();

        // Give another due node a turn if the same address just ran.
        let mut chosen = due[0].1;
        if due.len() > 1 && Some(chosen) == self.last_polled && due[1].0 <= now + FAIR_WINDOW {
            chosen = due[1].1;
        }

        if self.health.is_quarantined(chosen) {
            trace!(port = %self.port.name(), address = chosen, "skipping quarantined node");
            self.reschedule(chosen);
            return;
        }

        let result = self.poll_node(chosen).await;
        let settle = self
            .note_result_inner(chosen, result, "periodic poll")
            .map(|class| class.recovery_delay());

        self.reschedule(chosen);
        self.last_polled = Some(chosen);

        // Let the bus settle after a failure before the next transaction.
        if let Some(delay) = settle {
            sleep(delay).await;
        }
    }

    /// Drift-free rescheduling: advance by whole periods past "now".
    fn reschedule(&mut self, address: u8) {
        let now = Instant::now();
        if let Some(entry) = self.nodes.get_mut(&address) {
            let mut next = entry.next_due + entry.period;
            while next <= now {
                next += entry.period;
            }
            entry.next_due = next;
        }
    }

    /// One periodic read cycle for one node.
    async fn poll_node(&mut self, address: u8) -> Result<()> {
        let instrument = self.instrument(address)?;
        let values = instrument.read_ddes(&POLL_BUNDLE).await?;

        let fmeasure = values[0].as_f32().unwrap_or(0.0);
        let fluid = values[1].as_str().unwrap_or("").to_string();
        let measure = values[2].as_i64().unwrap_or(0).clamp(0, u16::MAX as i64) as u16;
        let setpoint = values[3].as_i64().unwrap_or(0).clamp(0, u16::MAX as i64) as u16;
        let fsetpoint = values[4].as_f32().unwrap_or(0.0);
        let capacity = values[5].as_f32().unwrap_or(0.0);
        let device_type = values[6].as_str().unwrap_or("").to_string();
        let ident_nr = values[7].as_i64();

        // DMFCs report garbage beyond 1.5x capacity during USB glitches.
        let threshold = DMFC_CAPACITY_FACTOR * capacity;
        if ident_nr == Some(DMFC_IDENT) && fmeasure > threshold {
            debug!(
                port = %self.port.name(),
                address,
                fmeasure,
                capacity,
                "dmfc measurement over threshold, skipping emission"
            );
            self.events
                .emit(TelemetryEvent::ValidationSkip(ValidationSkip {
                    ts: Utc::now(),
                    port: self.port.name().to_string(),
                    address,
                    kind: "dmfc_capacity_exceeded".to_string(),
                    value: fmeasure,
                    capacity,
                    threshold,
                    reason: format!(
                        "fMeasure {fmeasure} exceeds {DMFC_CAPACITY_FACTOR} x capacity {capacity}"
                    ),
                }));
            return Ok(());
        }

        self.events.emit(TelemetryEvent::Measurement(Measurement {
            ts: Utc::now(),
            port: self.port.name().to_string(),
            address,
            fmeasure,
            fsetpoint,
            measure,
            setpoint,
            fluid,
            capacity,
            device_type,
        }));
        Ok(())
    }

    /// Dispatch one command through the facade.
    async fn execute_command(&mut self, address: u8, kind: CommandKind) -> Result<()> {
        let instrument = self.instrument(address)?;
        match kind {
            CommandKind::SetFlow(flow) => {
                instrument
                    .write_dde(dde::FSETPOINT, ParameterValue::Float(flow))
                    .await
            }
            CommandKind::SetPercent(percent) => {
                let setpoint = (percent.clamp(0.0, 100.0) / 100.0 * 32_000.0).round() as u16;
                instrument
                    .write_dde(dde::SETPOINT, ParameterValue::Int16(setpoint))
                    .await
            }
            CommandKind::SetFluid(index) => {
                instrument
                    .write_dde(dde::FLUID_INDEX, ParameterValue::Int8(index as i8))
                    .await
            }
            CommandKind::SetUserTag(tag) => {
                instrument
                    .write_dde(dde::USER_TAG, ParameterValue::String(tag))
                    .await
            }
            CommandKind::WriteDde { dde_nr, value } => instrument.write_dde(dde_nr, value).await,
            CommandKind::ReadDde { dde_nr } => {
                let value = instrument.read_dde(dde_nr).await?;
                info!(
                    port = %self.port.name(),
                    address,
                    dde = dde_nr,
                    ?value,
                    "async read completed"
                );
                Ok(())
            }
        }
    }

    fn instrument(&mut self, address: u8) -> Result<Instrument> {
        if let Some(instrument) = self.instruments.get(&address) {
            return Ok(instrument.clone());
        }
        let instrument = Instrument::new(self.port.clone(), address)?;
        self.instruments.insert(address, instrument.clone());
        Ok(instrument)
    }

    fn note_result(&mut self, address: u8, result: Result<()>, context: &str) {
        self.note_result_inner(address, result, context);
    }

    /// Update health, emit events, feed the async latch. Returns the failure
    /// class on error so callers can apply the class's settle delay.
    fn note_result_inner(
        &mut self,
        address: u8,
        result: Result<()>,
        context: &str,
    ) -> Option<super::health::ErrorClass> {
        match result {
            Ok(()) => {
                if let Some(total) = self.health.record_success(address) {
                    self.events.emit(TelemetryEvent::connection_recovery(
                        self.port.name(),
                        address,
                        total,
                    ));
                }
                if let Some(flight) = &self.in_flight {
                    if flight.address == address {
                        flight.latch.store(true, Ordering::Relaxed);
                    }
                }
                None
            }
            Err(e) => {
                let report = self.health.record_failure(address, &e);
                self.events.emit(TelemetryEvent::error(
                    self.port.name(),
                    address,
                    report.class.as_str(),
                    e.to_string(),
                    context.to_string(),
                ));
                Some(report.class)
            }
        }
    }

    /// Rebuild the port and credit a recovery to every known address.
    async fn force_reconnect(&mut self) {
        info!(port = %self.port.name(), "forced reconnection requested");
        self.instruments.clear();

        match self.port.force_reconnect().await {
            Ok(epoch) => {
                info!(port = %self.port.name(), epoch, "port rebuilt");
                let addresses: Vec<u8> = self.nodes.keys().copied().collect();
                for address in addresses {
                    let total = self.health.force_recovery(address);
                    self.events.emit(TelemetryEvent::connection_recovery(
                        self.port.name(),
                        address,
                        total,
                    ));
                }
            }
            Err(e) => {
                warn!(port = %self.port.name(), "forced reconnection failed: {e}");
                self.events.emit(TelemetryEvent::error(
                    self.port.name(),
                    0,
                    super::health::ErrorClass::classify_error(&e).as_str(),
                    e.to_string(),
                    "forced reconnection".to_string(),
                ));
            }
        }
    }
}
