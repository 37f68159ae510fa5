//! PROPAR port driver
//!
//! Owns one serial link, allocates message sequence numbers, and runs a
//! dedicated receive worker that reassembles frames and completes the pending
//! request matching each reply's sequence number. At most one pending request
//! exists per sequence number; the sequence space is effectively non-wrapping
//! within a single deadline window.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use super::codec::{encode_frame, FrameDecoder};
use super::constants::{CMD_STATUS, HOST_ADDRESS};
use super::message::{self, Message, Response};
use super::transport::{Link, LinkFactory};
use super::types::{Command, Parameter, ParameterType, ParameterValue, Status};
use crate::error::{FlowSrvError, Result};

/// Frame-level counters kept by the receive worker.
#[derive(Debug, Default, Clone)]
pub struct FrameStats {
    /// Frames dropped by the framing layer or with a bad head
    pub malformed_frames: u64,
    /// Well-formed frames with no live pending request
    pub unknown_frames: u64,
}

struct PendingEntry {
    node: u8,
    /// Distinguishes reused sequence numbers across slot generations
    token: u64,
    tx: oneshot::Sender<Result<Message>>,
}

#[derive(Default)]
struct PendingTable {
    next_seq: u8,
    next_token: u64,
    slots: HashMap<u8, PendingEntry>,
}

impl PendingTable {
    /// Allocate the next free sequence number and register its slot.
    fn register(&mut self, node: u8) -> Result<(u8, u64, oneshot::Receiver<Result<Message>>)> {
        for _ in 0..=u8::MAX {
            let seq = self.next_seq;
            self.next_seq = self.next_seq.wrapping_add(1);
            if let std::collections::hash_map::Entry::Vacant(slot) = self.slots.entry(seq) {
                let (tx, rx) = oneshot::channel();
                self.next_token += 1;
                let token = self.next_token;
                slot.insert(PendingEntry { node, token, tx });
                return Ok((seq, token, rx));
            }
        }
        Err(FlowSrvError::validation("sequence space exhausted"))
    }
}

/// Removes its slot on drop unless a newer request owns the sequence number;
/// keeps the table clean when a caller times out or is cancelled.
struct PendingGuard {
    shared: Arc<Shared>,
    seq: u8,
    token: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut table = self.shared.pending.lock().expect("pending table poisoned");
        if table
            .slots
            .get(&self.seq)
            .map(|entry| entry.token == self.token)
            .unwrap_or(false)
        {
            table.slots.remove(&self.seq);
        }
    }
}

struct Shared {
    port_name: Arc<str>,
    pending: Mutex<PendingTable>,
    malformed_frames: AtomicU64,
    unknown_frames: AtomicU64,
}

impl Shared {
    /// Fail every pending request; used when the link dies.
    fn fail_all(&self, reason: &str) {
        let slots = {
            let mut table = self.pending.lock().expect("pending table poisoned");
            std::mem::take(&mut table.slots)
        };
        if !slots.is_empty() {
            warn!(
                port = %self.port_name,
                count = slots.len(),
                "failing pending requests: {reason}"
            );
        }
        for (_, entry) in slots {
            let _ = entry.tx.send(Err(FlowSrvError::port_lost(reason)));
        }
    }

    /// Route one completed frame body to its pending request.
    fn dispatch(&self, body: Vec<u8>) {
        let msg = match message::decode_message(&body) {
            Ok(msg) => msg,
            Err(e) => {
                // A bad frame is dropped without disturbing pending requests.
                self.malformed_frames.fetch_add(1, Ordering::Relaxed);
                debug!(port = %self.port_name, "dropping malformed frame: {e}");
                return;
            }
        };

        let entry = {
            let mut table = self.pending.lock().expect("pending table poisoned");
            let matches = table.slots.get(&msg.seq).map(|entry| {
                entry.node == msg.node
                    || (msg.command() == Some(CMD_STATUS) && entry.node == HOST_ADDRESS)
            });
            match matches {
                Some(true) => table.slots.remove(&msg.seq),
                _ => None,
            }
        };

        match entry {
            Some(entry) => {
                trace!(port = %self.port_name, seq = msg.seq, node = msg.node, "frame matched");
                let _ = entry.tx.send(Ok(msg));
            }
            None => {
                self.unknown_frames.fetch_add(1, Ordering::Relaxed);
                debug!(
                    port = %self.port_name,
                    seq = msg.seq,
                    node = msg.node,
                    "dropping frame with no pending request"
                );
            }
        }
    }
}

/// One port's driver: serial handle, sequence counter, pending table and
/// receive worker.
pub struct ProparMaster {
    port_name: Arc<str>,
    epoch: u64,
    response_timeout: Duration,
    writer: tokio::sync::Mutex<WriteHalf<Box<dyn Link>>>,
    shared: Arc<Shared>,
    rx_task: JoinHandle<()>,
}

impl std::fmt::Debug for ProparMaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProparMaster")
            .field("port", &self.port_name)
            .field("epoch", &self.epoch)
            .finish()
    }
}

impl ProparMaster {
    /// Open the link and start the receive worker.
    pub async fn connect(
        factory: &dyn LinkFactory,
        response_timeout: Duration,
        epoch: u64,
    ) -> Result<Self> {
        let link = factory.open().await?;
        let (reader, writer) = tokio::io::split(link);

        let port_name: Arc<str> = factory.port_name().into();
        let shared = Arc::new(Shared {
            port_name: port_name.clone(),
            pending: Mutex::new(PendingTable::default()),
            malformed_frames: AtomicU64::new(0),
            unknown_frames: AtomicU64::new(0),
        });

        let rx_task = tokio::spawn(Self::receive_loop(reader, shared.clone()));
        debug!(port = %port_name, epoch, "port driver started");

        Ok(Self {
            port_name,
            epoch,
            response_timeout,
            writer: tokio::sync::Mutex::new(writer),
            shared,
            rx_task,
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Recreation epoch this driver belongs to.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn frame_stats(&self) -> FrameStats {
        FrameStats {
            malformed_frames: self.shared.malformed_frames.load(Ordering::Relaxed),
            unknown_frames: self.shared.unknown_frames.load(Ordering::Relaxed),
        }
    }

    /// Stop the receive worker and fail anything still pending.
    pub fn shutdown(&self) {
        self.rx_task.abort();
        self.shared.fail_all("port driver shut down");
    }

    /// Read one parameter from a node.
    pub async fn read(
        &self,
        node: u8,
        proc_nr: u8,
        parm_nr: u8,
        parm_type: ParameterType,
    ) -> Result<ParameterValue> {
        let parm = Parameter::new(proc_nr, parm_nr, parm_type).with_node(node);
        let mut values = self.read_parameters(std::slice::from_ref(&parm)).await?;
        values
            .pop()
            .ok_or_else(|| FlowSrvError::malformed("empty parameter reply"))
    }

    /// Write one parameter to a node with acknowledgement.
    pub async fn write(
        &self,
        node: u8,
        proc_nr: u8,
        parm_nr: u8,
        parm_type: ParameterType,
        value: ParameterValue,
    ) -> Result<Status> {
        let parm = Parameter::new(proc_nr, parm_nr, parm_type)
            .with_node(node)
            .with_value(value);
        self.write_parameters(std::slice::from_ref(&parm), Command::SendWithAck)
            .await
    }

    /// Read a batch of parameters; every descriptor must carry the same node.
    pub async fn read_parameters(&self, params: &[Parameter]) -> Result<Vec<ParameterValue>> {
        let node = Self::uniform_node(params)?;

        let msg = self
            .transact(node, |seq| message::build_read_request(seq, node, params))
            .await?;

        match message::decode_response(&msg.payload)? {
            Response::Parameters(raw) => {
                if raw.len() != params.len() {
                    return Err(FlowSrvError::malformed(format!(
                        "requested {} parameters, reply carries {}",
                        params.len(),
                        raw.len()
                    )));
                }
                params
                    .iter()
                    .zip(raw)
                    .map(|(parm, field)| {
                        if field.type_bits != parm.parm_type.wire_bits() {
                            return Err(FlowSrvError::malformed(format!(
                                "reply type bits 0x{:02X} do not match requested {:?}",
                                field.type_bits, parm.parm_type
                            )));
                        }
                        ParameterValue::from_wire(parm.parm_type, &field.data)
                            .map(|(value, _)| value)
                    })
                    .collect()
            }
            Response::Status { status, .. } => {
                if status.is_ok() {
                    Err(FlowSrvError::malformed("status reply to a read request"))
                } else {
                    Err(FlowSrvError::StatusError(status))
                }
            }
            Response::UnknownCommand(cmd) => Err(FlowSrvError::malformed(format!(
                "unknown reply command 0x{cmd:02X}"
            ))),
        }
    }

    /// Write a batch of parameters; every descriptor must carry the same node.
    ///
    /// `SendWithAck` waits for the status frame; `Send` and `SendBroadcast`
    /// are fire-and-forget and report `Status::Ok` once the bytes are out.
    pub async fn write_parameters(
        &self,
        params: &[Parameter],
        command: Command,
    ) -> Result<Status> {
        let node = if command == Command::SendBroadcast {
            HOST_ADDRESS
        } else {
            Self::uniform_node(params)?
        };

        if !command.expects_ack() {
            let seq = self.allocate_unpended_seq();
            let body = message::build_write_request(seq, node, command, params)?;
            self.write_frame(&encode_frame(&body)).await?;
            return Ok(Status::Ok);
        }

        let msg = self
            .transact(node, |seq| {
                message::build_write_request(seq, node, command, params)
            })
            .await?;

        match message::decode_response(&msg.payload)? {
            Response::Status { status, .. } => Ok(status),
            Response::Parameters(_) => {
                Err(FlowSrvError::malformed("parameter reply to a write request"))
            }
            Response::UnknownCommand(cmd) => Err(FlowSrvError::malformed(format!(
                "unknown reply command 0x{cmd:02X}"
            ))),
        }
    }

    /// Every descriptor must have been stamped with the same node address.
    fn uniform_node(params: &[Parameter]) -> Result<u8> {
        let mut node = None;
        for parm in params {
            let parm_node = parm.node.ok_or_else(|| {
                FlowSrvError::validation(format!(
                    "descriptor proc {} parm {} carries no node address",
                    parm.proc_nr, parm.parm_nr
                ))
            })?;
            match node {
                None => node = Some(parm_node),
                Some(n) if n != parm_node => {
                    return Err(FlowSrvError::validation(
                        "descriptors address different nodes in one message",
                    ))
                }
                Some(_) => {}
            }
        }
        node.ok_or_else(|| FlowSrvError::validation("empty parameter list"))
    }

    /// Sequence number for a fire-and-forget message; nothing will await it.
    fn allocate_unpended_seq(&self) -> u8 {
        let mut table = self.shared.pending.lock().expect("pending table poisoned");
        let seq = table.next_seq;
        table.next_seq = table.next_seq.wrapping_add(1);
        seq
    }

    /// Register a pending slot, send the built frame, await the reply.
    async fn transact<F>(&self, node: u8, build: F) -> Result<Message>
    where
        F: FnOnce(u8) -> Result<Vec<u8>>,
    {
        let (seq, token, rx) = {
            let mut table = self.shared.pending.lock().expect("pending table poisoned");
            table.register(node)?
        };
        let _guard = PendingGuard {
            shared: self.shared.clone(),
            seq,
            token,
        };

        let body = build(seq)?;
        self.write_frame(&encode_frame(&body)).await?;

        match timeout(self.response_timeout, rx).await {
            Err(_) => {
                trace!(port = %self.port_name, seq, node, "response deadline expired");
                Err(FlowSrvError::TimeoutAnswer)
            }
            Ok(Err(_)) => Err(FlowSrvError::port_lost("receive worker stopped")),
            Ok(Ok(result)) => result,
        }
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        trace!(
            port = %self.port_name,
            hex = %frame.iter().map(|b| format!("{b:02X}")).collect::<Vec<_>>().join(" "),
            "tx frame"
        );
        writer
            .write_all(frame)
            .await
            .map_err(|e| FlowSrvError::port_lost(format!("write failed: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| FlowSrvError::port_lost(format!("write failed: {e}")))?;
        Ok(())
    }

    async fn receive_loop(mut reader: ReadHalf<Box<dyn Link>>, shared: Arc<Shared>) {
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 256];

        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    shared.fail_all("serial connection lost: stream closed");
                    break;
                }
                Ok(n) => {
                    let before = decoder.malformed_frames();
                    let bodies = decoder.feed(&buf[..n]);
                    let dropped = decoder.malformed_frames() - before;
                    if dropped > 0 {
                        shared.malformed_frames.fetch_add(dropped, Ordering::Relaxed);
                    }

                    for body in bodies {
                        shared.dispatch(body);
                    }

                    let junk = decoder.take_non_propar();
                    if !junk.is_empty() {
                        trace!(
                            port = %shared.port_name,
                            hex = %junk.iter().map(|b| format!("{b:02X}")).collect::<Vec<_>>().join(" "),
                            "non-propar bytes"
                        );
                    }
                }
                Err(e) => {
                    shared.fail_all(&format!("read failed: {e}"));
                    break;
                }
            }
        }
    }
}

impl Drop for ProparMaster {
    fn drop(&mut self) {
        self.rx_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::propar::simulator::SimLinkFactory;
    use crate::protocols::propar::simulator::{BusSimulator, NodeConfig};

    async fn master_with_node(node: u8) -> (ProparMaster, BusSimulator) {
        let sim = BusSimulator::new();
        sim.add_node(node, NodeConfig::flow_meter("AiR", 100.0)).await;
        let factory = SimLinkFactory::new("SIM0", sim.clone());
        let master = ProparMaster::connect(&factory, Duration::from_millis(200), 1)
            .await
            .unwrap();
        (master, sim)
    }

    #[tokio::test]
    async fn test_read_float_parameter() {
        let (master, sim) = master_with_node(3).await;
        sim.set_value(3, 33, 0, ParameterValue::Float(45.67)).await;

        let value = master.read(3, 33, 0, ParameterType::Float).await.unwrap();
        assert_eq!(value, ParameterValue::Float(45.67));
    }

    #[tokio::test]
    async fn test_write_with_ack() {
        let (master, sim) = master_with_node(3).await;

        let status = master
            .write(3, 1, 1, ParameterType::Int16, ParameterValue::Int16(32000))
            .await
            .unwrap();
        assert!(status.is_ok());
        assert_eq!(
            sim.get_value(3, 1, 1).await,
            Some(ParameterValue::Int16(32000))
        );
    }

    #[tokio::test]
    async fn test_fire_and_forget_write() {
        let (master, sim) = master_with_node(3).await;

        let status = master
            .write_parameters(
                &[Parameter::new(1, 1, ParameterType::Int16)
                    .with_node(3)
                    .with_value(ParameterValue::Int16(100))],
                Command::Send,
            )
            .await
            .unwrap();
        assert!(status.is_ok());

        // The write reaches the simulator without any reply frame.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            sim.get_value(3, 1, 1).await,
            Some(ParameterValue::Int16(100))
        );
    }

    #[tokio::test]
    async fn test_timeout_when_node_silent() {
        let (master, _sim) = master_with_node(3).await;

        let started = std::time::Instant::now();
        let err = master.read(9, 33, 0, ParameterType::Float).await.unwrap_err();
        assert_eq!(err, FlowSrvError::TimeoutAnswer);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_concurrent_requests_correlate_by_seq() {
        let sim = BusSimulator::new();
        sim.add_node(3, NodeConfig::flow_meter("AiR", 100.0)).await;
        sim.add_node(5, NodeConfig::flow_meter("N2", 50.0)).await;
        sim.set_value(3, 33, 0, ParameterValue::Float(1.0)).await;
        sim.set_value(5, 33, 0, ParameterValue::Float(2.0)).await;
        // Shuffle reply order so correlation does the work.
        sim.set_reply_delay(3, Duration::from_millis(40)).await;

        let factory = SimLinkFactory::new("SIM0", sim.clone());
        let master = Arc::new(
            ProparMaster::connect(&factory, Duration::from_millis(500), 1)
                .await
                .unwrap(),
        );

        let m1 = master.clone();
        let m2 = master.clone();
        let (a, b) = tokio::join!(
            tokio::spawn(async move { m1.read(3, 33, 0, ParameterType::Float).await }),
            tokio::spawn(async move { m2.read(5, 33, 0, ParameterType::Float).await }),
        );
        assert_eq!(a.unwrap().unwrap(), ParameterValue::Float(1.0));
        assert_eq!(b.unwrap().unwrap(), ParameterValue::Float(2.0));
    }

    #[tokio::test]
    async fn test_garbage_frames_do_not_disturb_requests() {
        let (master, sim) = master_with_node(3).await;
        sim.set_value(3, 33, 0, ParameterValue::Float(7.5)).await;
        sim.set_garbage_before_reply(true).await;

        let value = master.read(3, 33, 0, ParameterType::Float).await.unwrap();
        assert_eq!(value, ParameterValue::Float(7.5));
    }

    #[tokio::test]
    async fn test_status_error_surfaces() {
        let (master, sim) = master_with_node(3).await;
        sim.set_status_fault(3, 4).await;

        let err = master.read(3, 33, 0, ParameterType::Float).await.unwrap_err();
        assert_eq!(err.status_code(), Some(4));
    }

    #[tokio::test]
    async fn test_missing_node_rejected() {
        let (master, _sim) = master_with_node(3).await;
        let err = master
            .read_parameters(&[Parameter::new(33, 0, ParameterType::Float)])
            .await
            .unwrap_err();
        assert!(matches!(err, FlowSrvError::ValidationError(_)));
    }
}
