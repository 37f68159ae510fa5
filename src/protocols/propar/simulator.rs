//! In-memory PROPAR bus simulator
//!
//! A register-map instrument bus served over an in-process byte stream, used
//! by unit and integration tests. Supports the fault modes the health and
//! retry paths care about: silent nodes, swallowed replies, delayed replies,
//! status faults and inter-frame garbage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::codec::{encode_frame, FrameDecoder};
use super::constants::{
    CHAIN_FLAG, CMD_REQUEST, CMD_SEND, CMD_SEND_BROADCAST, CMD_SEND_WITH_ACK, CMD_STATUS,
    HOST_ADDRESS, PARM_MASK, STATUS_PARM_NUMBER, TYPE_MASK,
};
use super::message::{self, Message};
use super::transport::{Link, LinkFactory};
use super::types::{Command, Parameter, ParameterType, ParameterValue};
use crate::error::Result;

/// Initial register map for one simulated instrument.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub usertag: String,
    pub fluid: String,
    pub capacity: f32,
    pub unit: String,
    pub model: String,
    pub serial: String,
    pub device_type: String,
    pub ident_nr: i8,
}

impl NodeConfig {
    /// A digital mass-flow controller with sensible registers.
    pub fn flow_meter(fluid: &str, capacity: f32) -> Self {
        Self {
            usertag: "Instrument".to_string(),
            fluid: fluid.to_string(),
            capacity,
            unit: "ln/min".to_string(),
            model: "F-201CV".to_string(),
            serial: "SNM1234".to_string(),
            device_type: "DMFC".to_string(),
            ident_nr: 7,
        }
    }

    pub fn with_ident(mut self, ident_nr: i8) -> Self {
        self.ident_nr = ident_nr;
        self
    }
}

#[derive(Debug, Default)]
struct NodeState {
    registers: HashMap<(u8, u8), ParameterValue>,
    reply_delay: Duration,
    drop_next: u32,
    silent: bool,
    status_fault: Option<u8>,
}

impl NodeState {
    fn from_config(config: &NodeConfig) -> Self {
        let mut registers = HashMap::new();
        registers.insert((1, 0), ParameterValue::Int16(0)); // measure
        registers.insert((1, 1), ParameterValue::Int16(0)); // setpoint
        registers.insert((1, 13), ParameterValue::Float(config.capacity));
        registers.insert((1, 16), ParameterValue::Int8(0)); // fluid index
        registers.insert((1, 17), ParameterValue::String(config.fluid.clone()));
        registers.insert((1, 31), ParameterValue::String(config.unit.clone()));
        registers.insert((33, 0), ParameterValue::Float(0.0)); // fmeasure
        registers.insert((33, 3), ParameterValue::Float(0.0)); // fsetpoint
        registers.insert((113, 1), ParameterValue::String(config.device_type.clone()));
        registers.insert((113, 2), ParameterValue::String(config.model.clone()));
        registers.insert((113, 3), ParameterValue::String(config.serial.clone()));
        registers.insert((113, 6), ParameterValue::String(config.usertag.clone()));
        registers.insert((113, 12), ParameterValue::Int8(config.ident_nr));
        Self {
            registers,
            ..Default::default()
        }
    }
}

/// One parsed request field.
struct RequestField {
    proc_nr: u8,
    parm_nr: u8,
    type_bits: u8,
    data: Vec<u8>,
}

/// Shared simulated bus; cheap to clone.
#[derive(Clone, Default)]
pub struct BusSimulator {
    nodes: Arc<RwLock<HashMap<u8, NodeState>>>,
    garbage_before_reply: Arc<AtomicBool>,
    tasks: Arc<StdMutex<Vec<JoinHandle<()>>>>,
}

impl BusSimulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_node(&self, address: u8, config: NodeConfig) {
        self.nodes
            .write()
            .await
            .insert(address, NodeState::from_config(&config));
    }

    pub async fn remove_node(&self, address: u8) {
        self.nodes.write().await.remove(&address);
    }

    pub async fn set_value(&self, address: u8, proc_nr: u8, parm_nr: u8, value: ParameterValue) {
        if let Some(state) = self.nodes.write().await.get_mut(&address) {
            state.registers.insert((proc_nr, parm_nr), value);
        }
    }

    pub async fn remove_value(&self, address: u8, proc_nr: u8, parm_nr: u8) {
        if let Some(state) = self.nodes.write().await.get_mut(&address) {
            state.registers.remove(&(proc_nr, parm_nr));
        }
    }

    pub async fn get_value(&self, address: u8, proc_nr: u8, parm_nr: u8) -> Option<ParameterValue> {
        self.nodes
            .read()
            .await
            .get(&address)?
            .registers
            .get(&(proc_nr, parm_nr))
            .cloned()
    }

    pub async fn set_reply_delay(&self, address: u8, delay: Duration) {
        if let Some(state) = self.nodes.write().await.get_mut(&address) {
            state.reply_delay = delay;
        }
    }

    /// Swallow the next `count` replies for an address.
    pub async fn drop_next_replies(&self, address: u8, count: u32) {
        if let Some(state) = self.nodes.write().await.get_mut(&address) {
            state.drop_next = count;
        }
    }

    pub async fn set_silent(&self, address: u8, silent: bool) {
        if let Some(state) = self.nodes.write().await.get_mut(&address) {
            state.silent = silent;
        }
    }

    /// Answer every request for an address with the given status code.
    pub async fn set_status_fault(&self, address: u8, code: u8) {
        if let Some(state) = self.nodes.write().await.get_mut(&address) {
            state.status_fault = Some(code);
        }
    }

    pub async fn clear_status_fault(&self, address: u8) {
        if let Some(state) = self.nodes.write().await.get_mut(&address) {
            state.status_fault = None;
        }
    }

    pub async fn set_garbage_before_reply(&self, enabled: bool) {
        self.garbage_before_reply.store(enabled, Ordering::Relaxed);
    }

    /// Sever every link served so far; the next factory open starts fresh.
    pub fn disconnect_links(&self) {
        let mut tasks = self.tasks.lock().expect("simulator task list poisoned");
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    /// Serve one link until it closes.
    pub fn attach(&self, link: Box<dyn Link>) {
        let sim = self.clone();
        let task = tokio::spawn(sim.run(link));
        self.tasks
            .lock()
            .expect("simulator task list poisoned")
            .push(task);
    }

    async fn run(self, link: Box<dyn Link>) {
        let (mut reader, writer) = tokio::io::split(link);
        let writer = Arc::new(Mutex::new(writer));
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 256];

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            for body in decoder.feed(&buf[..n]) {
                self.handle_frame(body, writer.clone()).await;
            }
        }
        debug!("simulator link closed");
    }

    async fn handle_frame(&self, body: Vec<u8>, writer: Arc<Mutex<WriteHalf<Box<dyn Link>>>>) {
        let msg = match message::decode_message(&body) {
            Ok(msg) => msg,
            Err(e) => {
                trace!("simulator ignoring malformed message: {e}");
                return;
            }
        };

        let command = match msg.command() {
            Some(cmd) => cmd,
            None => return,
        };

        if command == CMD_SEND_BROADCAST && msg.node == HOST_ADDRESS {
            self.apply_broadcast(&msg).await;
            return;
        }

        let (reply, delay) = {
            let mut nodes = self.nodes.write().await;
            let state = match nodes.get_mut(&msg.node) {
                Some(state) => state,
                None => return,
            };
            if state.silent {
                return;
            }
            if state.drop_next > 0 {
                state.drop_next -= 1;
                trace!(node = msg.node, "simulator swallowing reply");
                return;
            }

            let reply = self.build_reply(state, &msg, command);
            (reply, state.reply_delay)
        };

        let reply = match reply {
            Some(reply) => reply,
            None => return,
        };

        let frame = encode_frame(&reply);
        let garbage = self.garbage_before_reply.load(Ordering::Relaxed);
        tokio::spawn(async move {
            if delay > Duration::ZERO {
                tokio::time::sleep(delay).await;
            }
            let mut writer = writer.lock().await;
            if garbage {
                let _ = writer.write_all(&[0xAA, 0x55, 0x5A]).await;
            }
            let _ = writer.write_all(&frame).await;
            let _ = writer.flush().await;
        });
    }

    fn build_reply(&self, state: &mut NodeState, msg: &Message, command: u8) -> Option<Vec<u8>> {
        if let Some(code) = state.status_fault {
            if command == CMD_REQUEST || command == CMD_SEND_WITH_ACK {
                return Some(status_body(msg, code, 0));
            }
            return None;
        }

        match command {
            CMD_REQUEST => {
                let fields = parse_fields(&msg.payload[1..], false)?;
                let mut params = Vec::with_capacity(fields.len());
                for field in &fields {
                    match state.registers.get(&(field.proc_nr, field.parm_nr)) {
                        Some(value) => params.push(
                            Parameter::new(field.proc_nr, field.parm_nr, value.parameter_type())
                                .with_node(msg.node)
                                .with_value(value.clone()),
                        ),
                        None => return Some(status_body(msg, STATUS_PARM_NUMBER, 0)),
                    }
                }
                message::build_write_request(msg.seq, msg.node, Command::Send, &params).ok()
            }
            CMD_SEND_WITH_ACK => {
                self.apply_writes(state, &msg.payload[1..]);
                Some(status_body(msg, 0, 0))
            }
            CMD_SEND => {
                self.apply_writes(state, &msg.payload[1..]);
                None
            }
            CMD_STATUS => None,
            _ => None,
        }
    }

    fn apply_writes(&self, state: &mut NodeState, body: &[u8]) {
        let fields = match parse_fields(body, true) {
            Some(fields) => fields,
            None => return,
        };
        for field in fields {
            let key = (field.proc_nr, field.parm_nr);
            let parm_type = state
                .registers
                .get(&key)
                .map(|v| v.parameter_type())
                .or_else(|| ParameterType::from_wire_bits(field.type_bits).ok());
            if let Some(parm_type) = parm_type {
                if let Ok((value, _)) = ParameterValue::from_wire(parm_type, &field.data) {
                    state.registers.insert(key, value);
                }
            }
        }
    }

    async fn apply_broadcast(&self, msg: &Message) {
        let mut nodes = self.nodes.write().await;
        let addresses: Vec<u8> = nodes.keys().copied().collect();
        for address in addresses {
            if let Some(state) = nodes.get_mut(&address) {
                // Broadcast body is identical to a plain send.
                self.apply_writes(state, &msg.payload[1..]);
            }
        }
    }
}

/// `seq | node | len | 0x00 status position`
fn status_body(msg: &Message, status: u8, position: u8) -> Vec<u8> {
    vec![msg.seq, msg.node, 3, CMD_STATUS, status, position]
}

/// Walk a chained request body, optionally consuming value bytes.
fn parse_fields(body: &[u8], with_values: bool) -> Option<Vec<RequestField>> {
    let mut fields = Vec::new();
    let mut offset = 0;

    loop {
        let proc_byte = *body.get(offset)?;
        offset += 1;
        let more_groups = proc_byte & CHAIN_FLAG != 0;
        let proc_nr = proc_byte & 0x7F;

        loop {
            let index_byte = *body.get(offset)?;
            offset += 1;
            let more_params = index_byte & CHAIN_FLAG != 0;
            let type_bits = index_byte & TYPE_MASK;

            let data = if with_values {
                let span = message::value_span(type_bits, &body[offset..]).ok()?;
                let data = body[offset..offset + span].to_vec();
                offset += span;
                data
            } else {
                Vec::new()
            };

            fields.push(RequestField {
                proc_nr,
                parm_nr: index_byte & PARM_MASK,
                type_bits,
                data,
            });

            if !more_params {
                break;
            }
        }

        if !more_groups {
            break;
        }
    }

    (offset == body.len()).then_some(fields)
}

/// Link factory serving the simulated bus over duplex pipes.
pub struct SimLinkFactory {
    name: String,
    sim: BusSimulator,
}

impl SimLinkFactory {
    pub fn new(name: &str, sim: BusSimulator) -> Self {
        Self {
            name: name.to_string(),
            sim,
        }
    }
}

#[async_trait]
impl LinkFactory for SimLinkFactory {
    async fn open(&self) -> Result<Box<dyn Link>> {
        let (ours, theirs) = tokio::io::duplex(4096);
        self.sim.attach(Box::new(theirs));
        Ok(Box::new(ours))
    }

    fn port_name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fields_read_request() {
        // proc 1 (two parms) then proc 33 (one parm).
        let fields = parse_fields(&[0x81, 0xA0, 0x71, 0x21, 0x40], false).unwrap();
        assert_eq!(fields.len(), 3);
        assert_eq!((fields[0].proc_nr, fields[0].parm_nr), (1, 0));
        assert_eq!((fields[1].proc_nr, fields[1].parm_nr), (1, 17));
        assert_eq!((fields[2].proc_nr, fields[2].parm_nr), (33, 0));
    }

    #[test]
    fn test_parse_fields_write_request() {
        let fields = parse_fields(&[0x01, 0x21, 0x7D, 0x00], true).unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].data, vec![0x7D, 0x00]);
    }

    #[test]
    fn test_parse_fields_rejects_trailing_bytes() {
        assert!(parse_fields(&[0x01, 0x21, 0x7D, 0x00], false).is_none());
    }
}
