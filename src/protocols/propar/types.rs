//! PROPAR data types
//!
//! Parameter types, typed values with their wire encoding, command and status
//! codes, and the parameter descriptor passed through the whole stack.

use serde::{Deserialize, Serialize};

use super::constants;
use crate::error::{FlowSrvError, Result};

/// Logical parameter type.
///
/// Seven logical types share four wire classes: the three 16-bit flavours all
/// travel as two big-endian bytes, and `Int32`/`Float` both travel as four.
/// The requested type decides how the bytes are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterType {
    /// One signed byte
    Int8,
    /// Two bytes, unsigned big-endian
    Int16,
    /// Two bytes, signed big-endian
    SInt16,
    /// Two bytes, signed big-endian (Bronkhorst scaled-integer flavour)
    BSInt16,
    /// Four bytes, unsigned big-endian
    Int32,
    /// Four bytes, IEEE-754 big-endian
    Float,
    /// Length-prefixed, NUL-terminated ASCII
    String,
}

impl ParameterType {
    /// Wire type class packed into bits 6..5 of the parameter-index byte.
    pub fn wire_bits(&self) -> u8 {
        match self {
            ParameterType::Int8 => constants::TYPE_INT8,
            ParameterType::Int16 | ParameterType::SInt16 | ParameterType::BSInt16 => {
                constants::TYPE_INT16
            }
            ParameterType::Int32 | ParameterType::Float => constants::TYPE_INT32,
            ParameterType::String => constants::TYPE_STRING,
        }
    }

    /// Canonical type for a raw wire class, for decoding replies whose
    /// requested type is unknown.
    pub fn from_wire_bits(bits: u8) -> Result<Self> {
        match bits & constants::TYPE_MASK {
            constants::TYPE_INT8 => Ok(ParameterType::Int8),
            constants::TYPE_INT16 => Ok(ParameterType::Int16),
            constants::TYPE_INT32 => Ok(ParameterType::Int32),
            constants::TYPE_STRING => Ok(ParameterType::String),
            other => Err(FlowSrvError::UnknownType(other)),
        }
    }

    /// Fixed wire width in bytes, or `None` for strings.
    pub fn fixed_width(&self) -> Option<usize> {
        match self.wire_bits() {
            constants::TYPE_INT8 => Some(1),
            constants::TYPE_INT16 => Some(2),
            constants::TYPE_INT32 => Some(4),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ParameterType::Int8 => "int8",
            ParameterType::Int16 => "int16",
            ParameterType::SInt16 => "sint16",
            ParameterType::BSInt16 => "bsint16",
            ParameterType::Int32 => "int32",
            ParameterType::Float => "float",
            ParameterType::String => "string",
        }
    }
}

/// A typed parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int8(i8),
    Int16(u16),
    SInt16(i16),
    BSInt16(i16),
    Int32(u32),
    Float(f32),
    String(String),
}

impl ParameterValue {
    /// The logical type this value belongs to.
    pub fn parameter_type(&self) -> ParameterType {
        match self {
            ParameterValue::Int8(_) => ParameterType::Int8,
            ParameterValue::Int16(_) => ParameterType::Int16,
            ParameterValue::SInt16(_) => ParameterType::SInt16,
            ParameterValue::BSInt16(_) => ParameterType::BSInt16,
            ParameterValue::Int32(_) => ParameterType::Int32,
            ParameterValue::Float(_) => ParameterType::Float,
            ParameterValue::String(_) => ParameterType::String,
        }
    }

    /// Encode the value bytes as they appear after the parameter-index byte.
    pub fn to_wire(&self) -> Result<Vec<u8>> {
        match self {
            ParameterValue::Int8(v) => Ok(vec![*v as u8]),
            ParameterValue::Int16(v) => Ok(v.to_be_bytes().to_vec()),
            ParameterValue::SInt16(v) | ParameterValue::BSInt16(v) => {
                Ok(v.to_be_bytes().to_vec())
            }
            ParameterValue::Int32(v) => Ok(v.to_be_bytes().to_vec()),
            ParameterValue::Float(v) => Ok(v.to_be_bytes().to_vec()),
            ParameterValue::String(s) => {
                let bytes = s.as_bytes();
                if bytes.len() + 2 > constants::MAX_STRING_WIRE_LEN {
                    return Err(FlowSrvError::validation(format!(
                        "string parameter too long: {} bytes",
                        bytes.len()
                    )));
                }
                let mut out = Vec::with_capacity(bytes.len() + 2);
                out.push((bytes.len() + 1) as u8);
                out.extend_from_slice(bytes);
                out.push(0);
                Ok(out)
            }
        }
    }

    /// Decode a value of `parm_type` from the front of `data`.
    ///
    /// Returns the value and the number of bytes consumed. Fails with
    /// `TruncatedValue` when fewer bytes remain than the type requires.
    pub fn from_wire(parm_type: ParameterType, data: &[u8]) -> Result<(Self, usize)> {
        let truncated = || FlowSrvError::TruncatedValue(parm_type.name());

        match parm_type {
            ParameterType::Int8 => {
                let b = *data.first().ok_or_else(truncated)?;
                Ok((ParameterValue::Int8(b as i8), 1))
            }
            ParameterType::Int16 => {
                let b = data.get(..2).ok_or_else(truncated)?;
                Ok((ParameterValue::Int16(u16::from_be_bytes([b[0], b[1]])), 2))
            }
            ParameterType::SInt16 => {
                let b = data.get(..2).ok_or_else(truncated)?;
                Ok((ParameterValue::SInt16(i16::from_be_bytes([b[0], b[1]])), 2))
            }
            ParameterType::BSInt16 => {
                let b = data.get(..2).ok_or_else(truncated)?;
                Ok((ParameterValue::BSInt16(i16::from_be_bytes([b[0], b[1]])), 2))
            }
            ParameterType::Int32 => {
                let b = data.get(..4).ok_or_else(truncated)?;
                Ok((
                    ParameterValue::Int32(u32::from_be_bytes([b[0], b[1], b[2], b[3]])),
                    4,
                ))
            }
            ParameterType::Float => {
                let b = data.get(..4).ok_or_else(truncated)?;
                Ok((
                    ParameterValue::Float(f32::from_be_bytes([b[0], b[1], b[2], b[3]])),
                    4,
                ))
            }
            ParameterType::String => {
                let len = *data.first().ok_or_else(truncated)? as usize;
                if len == 0 {
                    // Zero length: scan to the terminating NUL.
                    let nul = data[1..]
                        .iter()
                        .position(|&b| b == 0)
                        .ok_or_else(truncated)?;
                    let text = String::from_utf8_lossy(&data[1..1 + nul]).trim().to_string();
                    Ok((ParameterValue::String(text), 1 + nul + 1))
                } else {
                    let bytes = data.get(1..1 + len).ok_or_else(truncated)?;
                    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                    let text = String::from_utf8_lossy(&bytes[..end]).trim().to_string();
                    Ok((ParameterValue::String(text), 1 + len))
                }
            }
        }
    }

    /// Numeric view of the value, if it has one.
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            ParameterValue::Int8(v) => Some(*v as f32),
            ParameterValue::Int16(v) => Some(*v as f32),
            ParameterValue::SInt16(v) | ParameterValue::BSInt16(v) => Some(*v as f32),
            ParameterValue::Int32(v) => Some(*v as f32),
            ParameterValue::Float(v) => Some(*v),
            ParameterValue::String(_) => None,
        }
    }

    /// Integer view of the value, if it has one.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParameterValue::Int8(v) => Some(*v as i64),
            ParameterValue::Int16(v) => Some(*v as i64),
            ParameterValue::SInt16(v) | ParameterValue::BSInt16(v) => Some(*v as i64),
            ParameterValue::Int32(v) => Some(*v as i64),
            ParameterValue::Float(_) | ParameterValue::String(_) => None,
        }
    }

    /// String view of the value, if it has one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParameterValue::String(s) => Some(s),
            _ => None,
        }
    }
}

/// Outbound command selection for parameter writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `0x01`: write demanding a status acknowledgement
    SendWithAck,
    /// `0x02`: fire-and-forget write
    Send,
    /// `0x03`: broadcast write, answered (if at all) toward the host address
    SendBroadcast,
}

impl Command {
    pub fn code(&self) -> u8 {
        match self {
            Command::SendWithAck => constants::CMD_SEND_WITH_ACK,
            Command::Send => constants::CMD_SEND,
            Command::SendBroadcast => constants::CMD_SEND_BROADCAST,
        }
    }

    /// Whether the instrument answers this command with a status frame.
    pub fn expects_ack(&self) -> bool {
        matches!(self, Command::SendWithAck)
    }
}

/// PROPAR status code, with unknown values passed through opaquely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    ProcessClaimed,
    Command,
    ProcNumber,
    ParmNumber,
    ParmType,
    ParmValue,
    NetworkNotActive,
    TimeoutStartChar,
    TimeoutSerialLine,
    TimeoutAnswer,
    Other(u8),
}

impl Status {
    pub fn from_code(code: u8) -> Self {
        match code {
            constants::STATUS_OK => Status::Ok,
            constants::STATUS_PROCESS_CLAIMED => Status::ProcessClaimed,
            constants::STATUS_COMMAND => Status::Command,
            constants::STATUS_PROC_NUMBER => Status::ProcNumber,
            constants::STATUS_PARM_NUMBER => Status::ParmNumber,
            constants::STATUS_PARM_TYPE => Status::ParmType,
            constants::STATUS_PARM_VALUE => Status::ParmValue,
            constants::STATUS_NETWORK_NOT_ACTIVE => Status::NetworkNotActive,
            constants::STATUS_TIMEOUT_START_CHAR => Status::TimeoutStartChar,
            constants::STATUS_TIMEOUT_SERIAL_LINE => Status::TimeoutSerialLine,
            constants::STATUS_TIMEOUT_ANSWER => Status::TimeoutAnswer,
            other => Status::Other(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Status::Ok => constants::STATUS_OK,
            Status::ProcessClaimed => constants::STATUS_PROCESS_CLAIMED,
            Status::Command => constants::STATUS_COMMAND,
            Status::ProcNumber => constants::STATUS_PROC_NUMBER,
            Status::ParmNumber => constants::STATUS_PARM_NUMBER,
            Status::ParmType => constants::STATUS_PARM_TYPE,
            Status::ParmValue => constants::STATUS_PARM_VALUE,
            Status::NetworkNotActive => constants::STATUS_NETWORK_NOT_ACTIVE,
            Status::TimeoutStartChar => constants::STATUS_TIMEOUT_START_CHAR,
            Status::TimeoutSerialLine => constants::STATUS_TIMEOUT_SERIAL_LINE,
            Status::TimeoutAnswer => constants::STATUS_TIMEOUT_ANSWER,
            Status::Other(code) => *code,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }

    pub fn description(&self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::ProcessClaimed => "process claimed",
            Status::Command => "command error",
            Status::ProcNumber => "process number error",
            Status::ParmNumber => "parameter number error",
            Status::ParmType => "parameter type error",
            Status::ParmValue => "parameter value error",
            Status::NetworkNotActive => "network not active",
            Status::TimeoutStartChar => "timeout start character",
            Status::TimeoutSerialLine => "timeout serial line",
            Status::TimeoutAnswer => "timeout answer",
            Status::Other(_) => "device-specific status",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.code(), self.description())
    }
}

/// Parameter descriptor as it travels through the stack.
///
/// `node` is stamped in by the instrument facade before the descriptor
/// reaches the port driver; `value` is present only on writes.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    /// PROPAR node address, filled in by the owning facade
    pub node: Option<u8>,
    /// Process number, 0..=127
    pub proc_nr: u8,
    /// Parameter number, 0..=31
    pub parm_nr: u8,
    /// Logical parameter type
    pub parm_type: ParameterType,
    /// Value to write, unset on reads
    pub value: Option<ParameterValue>,
}

impl Parameter {
    pub fn new(proc_nr: u8, parm_nr: u8, parm_type: ParameterType) -> Self {
        Self {
            node: None,
            proc_nr,
            parm_nr,
            parm_type,
            value: None,
        }
    }

    pub fn with_value(mut self, value: ParameterValue) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_node(mut self, node: u8) -> Self {
        self.node = Some(node);
        self
    }

    /// Parameter-index byte without the chain flag.
    pub fn index_byte(&self) -> u8 {
        (self.parm_nr & constants::PARM_MASK) | self.parm_type.wire_bits()
    }
}

/// One decoded parameter from a reply body.
#[derive(Debug, Clone, PartialEq)]
pub struct RawParameter {
    pub proc_nr: u8,
    pub parm_nr: u8,
    /// Wire type class of the reply field
    pub type_bits: u8,
    /// Value bytes exactly as received
    pub data: Vec<u8>,
}
