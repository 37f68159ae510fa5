//! PROPAR message encoding and decoding
//!
//! A message is `seq | node | len | payload[len]`. Payloads start with a
//! command byte; multi-parameter bodies chain process groups with bit 7 of
//! the process byte and parameters within a group with bit 7 of the
//! parameter-index byte.

use tracing::trace;

use super::constants::{self, CHAIN_FLAG, CMD_REQUEST, CMD_STATUS, PARM_MASK, TYPE_MASK};
use super::types::{Command, Parameter, ParameterType, RawParameter, Status};
use crate::error::{FlowSrvError, Result};

/// A decoded message head with its raw payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub seq: u8,
    pub node: u8,
    pub payload: Vec<u8>,
}

impl Message {
    /// Command byte, if the payload carries one.
    pub fn command(&self) -> Option<u8> {
        self.payload.first().copied()
    }
}

/// Decoded reply payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// `0x00`: status with the byte position it refers to
    Status { status: Status, position: u8 },
    /// `0x02`: one or more parameter groups
    Parameters(Vec<RawParameter>),
    /// Anything else is surfaced, not dropped
    UnknownCommand(u8),
}

/// Assemble the `seq | node | len | payload` head around a payload.
fn with_head(seq: u8, node: u8, payload: Vec<u8>) -> Result<Vec<u8>> {
    if payload.len() > u8::MAX as usize {
        return Err(FlowSrvError::validation(format!(
            "payload too large: {} bytes",
            payload.len()
        )));
    }
    let mut body = Vec::with_capacity(payload.len() + 3);
    body.push(seq);
    body.push(node);
    body.push(payload.len() as u8);
    body.extend_from_slice(&payload);
    Ok(body)
}

/// Group consecutive parameters by process number, preserving order.
fn group_by_process(params: &[Parameter]) -> Vec<(u8, Vec<&Parameter>)> {
    let mut groups: Vec<(u8, Vec<&Parameter>)> = Vec::new();
    for parm in params {
        match groups.last_mut() {
            Some((proc_nr, members)) if *proc_nr == parm.proc_nr => members.push(parm),
            _ => groups.push((parm.proc_nr, vec![parm])),
        }
    }
    groups
}

/// Append the chained `proc / index [value]` body shared by reads and writes.
fn push_chained(payload: &mut Vec<u8>, params: &[Parameter], with_values: bool) -> Result<()> {
    let groups = group_by_process(params);
    let group_count = groups.len();

    for (group_idx, (proc_nr, members)) in groups.into_iter().enumerate() {
        let mut proc_byte = proc_nr & 0x7F;
        if group_idx + 1 < group_count {
            proc_byte |= CHAIN_FLAG;
        }
        payload.push(proc_byte);

        let member_count = members.len();
        for (parm_idx, parm) in members.into_iter().enumerate() {
            let mut index_byte = parm.index_byte();
            if parm_idx + 1 < member_count {
                index_byte |= CHAIN_FLAG;
            }
            payload.push(index_byte);

            if with_values {
                let value = parm.value.as_ref().ok_or_else(|| {
                    FlowSrvError::validation(format!(
                        "write descriptor proc {} parm {} carries no value",
                        parm.proc_nr, parm.parm_nr
                    ))
                })?;
                if value.parameter_type().wire_bits() != parm.parm_type.wire_bits() {
                    return Err(FlowSrvError::validation(format!(
                        "value type {:?} does not match descriptor type {:?}",
                        value.parameter_type(),
                        parm.parm_type
                    )));
                }
                payload.extend_from_slice(&value.to_wire()?);
            }
        }
    }
    Ok(())
}

/// Build a parameter-request message (`0x04`).
pub fn build_read_request(seq: u8, node: u8, params: &[Parameter]) -> Result<Vec<u8>> {
    if params.is_empty() {
        return Err(FlowSrvError::validation("empty parameter request"));
    }
    let mut payload = vec![CMD_REQUEST];
    push_chained(&mut payload, params, false)?;
    trace!(seq, node, len = payload.len(), "built read request");
    with_head(seq, node, payload)
}

/// Build a send-parameter message (`0x01`/`0x02`/`0x03`).
pub fn build_write_request(
    seq: u8,
    node: u8,
    command: Command,
    params: &[Parameter],
) -> Result<Vec<u8>> {
    if params.is_empty() {
        return Err(FlowSrvError::validation("empty parameter write"));
    }
    let mut payload = vec![command.code()];
    push_chained(&mut payload, params, true)?;
    trace!(seq, node, len = payload.len(), "built write request");
    with_head(seq, node, payload)
}

/// Split a frame body into its message head and payload.
///
/// Fails with `MalformedMessage` when the head is incomplete or the length
/// byte disagrees with the body size.
pub fn decode_message(body: &[u8]) -> Result<Message> {
    if body.len() < 3 {
        return Err(FlowSrvError::malformed(format!(
            "message head incomplete: {} bytes",
            body.len()
        )));
    }
    let (seq, node, len) = (body[0], body[1], body[2] as usize);
    let payload = &body[3..];
    if payload.len() != len {
        return Err(FlowSrvError::malformed(format!(
            "length byte says {} but payload is {} bytes",
            len,
            payload.len()
        )));
    }
    Ok(Message {
        seq,
        node,
        payload: payload.to_vec(),
    })
}

/// Width of one value field, driven by the reply's own type bits so group
/// traversal never desynchronizes.
pub(crate) fn value_span(type_bits: u8, data: &[u8]) -> Result<usize> {
    let parm_type = ParameterType::from_wire_bits(type_bits)?;
    if let Some(width) = parm_type.fixed_width() {
        if data.len() < width {
            return Err(FlowSrvError::TruncatedValue("parameter"));
        }
        return Ok(width);
    }
    // String: length byte, zero meaning "scan to NUL".
    let len = *data.first().ok_or(FlowSrvError::TruncatedValue("string"))? as usize;
    if len == 0 {
        let nul = data[1..]
            .iter()
            .position(|&b| b == 0)
            .ok_or(FlowSrvError::TruncatedValue("string"))?;
        Ok(1 + nul + 1)
    } else {
        if data.len() < 1 + len {
            return Err(FlowSrvError::TruncatedValue("string"));
        }
        Ok(1 + len)
    }
}

/// Decode a reply payload.
pub fn decode_response(payload: &[u8]) -> Result<Response> {
    let command = *payload
        .first()
        .ok_or_else(|| FlowSrvError::malformed("empty payload"))?;

    match command {
        CMD_STATUS => {
            let status = *payload
                .get(1)
                .ok_or_else(|| FlowSrvError::malformed("status payload missing code"))?;
            let position = payload.get(2).copied().unwrap_or(0);
            Ok(Response::Status {
                status: Status::from_code(status),
                position,
            })
        }
        constants::CMD_SEND => {
            let mut params = Vec::new();
            let mut offset = 1;

            loop {
                let proc_byte = *payload
                    .get(offset)
                    .ok_or_else(|| FlowSrvError::malformed("reply missing process byte"))?;
                offset += 1;
                let more_groups = proc_byte & CHAIN_FLAG != 0;
                let proc_nr = proc_byte & 0x7F;

                loop {
                    let index_byte = *payload
                        .get(offset)
                        .ok_or_else(|| FlowSrvError::malformed("reply missing index byte"))?;
                    offset += 1;
                    let more_params = index_byte & CHAIN_FLAG != 0;

                    let span = value_span(index_byte & TYPE_MASK, &payload[offset..])?;
                    params.push(RawParameter {
                        proc_nr,
                        parm_nr: index_byte & PARM_MASK,
                        type_bits: index_byte & TYPE_MASK,
                        data: payload[offset..offset + span].to_vec(),
                    });
                    offset += span;

                    if !more_params {
                        break;
                    }
                }

                if !more_groups {
                    break;
                }
            }

            if offset != payload.len() {
                return Err(FlowSrvError::malformed(format!(
                    "{} trailing bytes after last parameter",
                    payload.len() - offset
                )));
            }
            Ok(Response::Parameters(params))
        }
        other => Ok(Response::UnknownCommand(other)),
    }
}
