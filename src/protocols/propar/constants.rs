//! PROPAR protocol constants

/// Data link escape byte; frames start with `DLE STX` and end with `DLE ETX`.
pub const DLE: u8 = 0x10;
/// Start-of-text control byte.
pub const STX: u8 = 0x02;
/// End-of-text control byte.
pub const ETX: u8 = 0x03;

/// Command byte: status reply.
pub const CMD_STATUS: u8 = 0x00;
/// Command byte: send parameter, status acknowledgement demanded.
pub const CMD_SEND_WITH_ACK: u8 = 0x01;
/// Command byte: send parameter, fire and forget.
pub const CMD_SEND: u8 = 0x02;
/// Command byte: send parameter to all nodes.
pub const CMD_SEND_BROADCAST: u8 = 0x03;
/// Command byte: request parameter.
pub const CMD_REQUEST: u8 = 0x04;

/// Wire type class: one signed byte.
pub const TYPE_INT8: u8 = 0x00;
/// Wire type class: two bytes, big-endian.
pub const TYPE_INT16: u8 = 0x20;
/// Wire type class: four bytes, big-endian.
pub const TYPE_INT32: u8 = 0x40;
/// Wire type class: length-prefixed, NUL-terminated ASCII.
pub const TYPE_STRING: u8 = 0x60;

/// Mask selecting the wire type class inside a parameter-index byte.
pub const TYPE_MASK: u8 = 0x60;
/// Mask selecting the parameter number inside a parameter-index byte.
pub const PARM_MASK: u8 = 0x1F;
/// Chain flag: on a process byte, another process group follows; on a
/// parameter-index byte, another parameter in the same group follows.
pub const CHAIN_FLAG: u8 = 0x80;

/// Lowest addressable node on a PROPAR bus.
pub const MIN_ADDRESS: u8 = 1;
/// Highest addressable node on a PROPAR bus.
pub const MAX_ADDRESS: u8 = 247;
/// Highest address probed by the bus scanner.
pub const MAX_SCAN_ADDRESS: u8 = 127;
/// The host's own address, used as the broadcast response target.
pub const HOST_ADDRESS: u8 = 0x80;

/// Maximum bytes a string parameter may occupy on the wire, length byte and
/// terminating NUL included.
pub const MAX_STRING_WIRE_LEN: usize = 61;

/// PROPAR status codes; everything else passes through opaquely.
pub const STATUS_OK: u8 = 0;
pub const STATUS_PROCESS_CLAIMED: u8 = 1;
pub const STATUS_COMMAND: u8 = 2;
pub const STATUS_PROC_NUMBER: u8 = 3;
pub const STATUS_PARM_NUMBER: u8 = 4;
pub const STATUS_PARM_TYPE: u8 = 5;
pub const STATUS_PARM_VALUE: u8 = 6;
pub const STATUS_NETWORK_NOT_ACTIVE: u8 = 7;
pub const STATUS_TIMEOUT_START_CHAR: u8 = 8;
pub const STATUS_TIMEOUT_SERIAL_LINE: u8 = 9;
pub const STATUS_TIMEOUT_ANSWER: u8 = 25;

/// Default line rate for Bronkhorst instruments.
pub const DEFAULT_BAUD_RATE: u32 = 38_400;
/// Per-read byte timeout on the serial handle.
pub const DEFAULT_BYTE_TIMEOUT_MS: u64 = 10;
/// Overall response deadline for one transaction.
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 2_000;

/// Retry sleeps applied by the port serializer between attempts.
pub const RETRY_SLEEPS_MS: [u64; 3] = [100, 200, 300];
/// Attempts per serialized operation (first try plus retries).
pub const MAX_ATTEMPTS: u32 = 4;
