//! Binary frame codec for the Eviqo dashboard WebSocket protocol.
//!
//! Every message is a fixed 3-byte header followed by a variable payload:
//!
//! ```text
//! opcode : u8 | msg_id : u16 big-endian | payload...
//! ```
//!
//! The wire has also been seen with a 4-byte header in one build of the
//! official client; this codec implements the 3-byte shape, which every
//! captured operation (including the command write below) uses.
//!
//! Payloads carry either JSON documents (login, device query, device page),
//! plain ASCII (device numbers), or the NUL-separated "virtual write" records
//! used for widget updates and command writes:
//!
//! ```text
//! deviceId \0 "vw" \0 pin \0 value
//! ```

use serde_json::Value;
use std::fmt;

// -------------------- Opcodes --------------------

pub const OP_LOGIN: u8 = 0x02;
pub const OP_DEVICE_PAGE: u8 = 0x04;
pub const OP_KEEPALIVE: u8 = 0x06;
/// Outbound write and inbound widget update share an opcode; direction
/// disambiguates.
pub const OP_WIDGET_WRITE: u8 = 0x14;
/// Inbound widget update driven by another client of the same account.
pub const OP_WIDGET_EVENT: u8 = 0x19;
pub const OP_DEVICE_QUERY: u8 = 0x1B;
pub const OP_INIT: u8 = 0x30;
pub const OP_DEVICE_NUMBER: u8 = 0x49;

pub const HEADER_LEN: usize = 3;

const VIRTUAL_WRITE_MARKER: &str = "vw";

// -------------------- Errors --------------------

/// Codec failures. Malformed inbound frames are dropped by the session read
/// loop; the hex dump keeps the raw bytes available for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Fewer bytes than the fixed header.
    ShortFrame { len: usize },
    /// A widget-update payload that does not follow the `vw` record shape.
    MalformedWidgetUpdate { hex: String },
    /// A payload that announced JSON (`{` or `[`) but does not parse.
    BadJson { detail: String },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::ShortFrame { len } => {
                write!(f, "short frame: {} bytes, header needs {}", len, HEADER_LEN)
            }
            CodecError::MalformedWidgetUpdate { hex } => {
                write!(f, "malformed widget update: {}", hex)
            }
            CodecError::BadJson { detail } => write!(f, "unparseable json payload: {}", detail),
        }
    }
}

impl std::error::Error for CodecError {}

pub fn hex_dump(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

// -------------------- Frames --------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub opcode: u8,
    pub msg_id: u16,
}

/// Outbound payload forms accepted by [`encode_frame`], in the priority order
/// the protocol defines.
#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Text(String),
    Bytes(Vec<u8>),
}

/// Inbound payload after content classification.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Empty,
    WidgetUpdate(WidgetUpdate),
    Json(Value),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub header: FrameHeader,
    pub body: ResponseBody,
}

/// A decoded `vw` record. `widget_id` is the charger's logical pin, not the
/// widget's database id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WidgetUpdate {
    pub device_id: String,
    pub widget_id: String,
    pub widget_value: String,
}

pub fn encode_frame(opcode: u8, msg_id: u16, body: &RequestBody) -> Vec<u8> {
    let payload: Vec<u8> = match body {
        RequestBody::Empty => Vec::new(),
        // A struct payload is serialized to JSON text with no length prefix.
        RequestBody::Json(value) => value.to_string().into_bytes(),
        RequestBody::Text(text) => text.clone().into_bytes(),
        RequestBody::Bytes(bytes) => bytes.clone(),
    };
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.push(opcode);
    frame.extend_from_slice(&msg_id.to_be_bytes());
    frame.extend_from_slice(&payload);
    frame
}

pub fn decode_frame(bytes: &[u8]) -> Result<Frame, CodecError> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::ShortFrame { len: bytes.len() });
    }
    let header = FrameHeader {
        opcode: bytes[0],
        msg_id: u16::from_be_bytes([bytes[1], bytes[2]]),
    };
    let payload = &bytes[HEADER_LEN..];

    let body = if header.opcode == OP_WIDGET_WRITE || header.opcode == OP_WIDGET_EVENT {
        ResponseBody::WidgetUpdate(parse_widget_update(payload)?)
    } else if payload.is_empty() {
        ResponseBody::Empty
    } else if payload[0] == b'{' || payload[0] == b'[' {
        let value = serde_json::from_slice(payload).map_err(|e| CodecError::BadJson {
            detail: e.to_string(),
        })?;
        ResponseBody::Json(value)
    } else {
        ResponseBody::Text(String::from_utf8_lossy(payload).into_owned())
    };

    Ok(Frame { header, body })
}

/// Encode an outbound command write: a `vw` record under opcode `0x14` with a
/// fresh message id. No trailing NUL.
pub fn encode_command(device_id: &str, pin: &str, value: &str, msg_id: u16) -> Vec<u8> {
    let mut payload = Vec::with_capacity(device_id.len() + pin.len() + value.len() + 5);
    payload.extend_from_slice(device_id.as_bytes());
    payload.push(0);
    payload.extend_from_slice(VIRTUAL_WRITE_MARKER.as_bytes());
    payload.push(0);
    payload.extend_from_slice(pin.as_bytes());
    payload.push(0);
    payload.extend_from_slice(value.as_bytes());
    encode_frame(OP_WIDGET_WRITE, msg_id, &RequestBody::Bytes(payload))
}

/// Parse a `deviceId \0 "vw" \0 pin \0 value` record. The value field keeps
/// any remaining bytes verbatim.
pub fn parse_widget_update(payload: &[u8]) -> Result<WidgetUpdate, CodecError> {
    let malformed = || CodecError::MalformedWidgetUpdate {
        hex: hex_dump(payload),
    };
    let text = std::str::from_utf8(payload).map_err(|_| malformed())?;
    let mut fields = text.splitn(4, '\0');
    let device_id = fields.next().ok_or_else(malformed)?;
    let marker = fields.next().ok_or_else(malformed)?;
    let pin = fields.next().ok_or_else(malformed)?;
    let value = fields.next().ok_or_else(malformed)?;
    if marker != VIRTUAL_WRITE_MARKER || device_id.is_empty() || pin.is_empty() {
        return Err(malformed());
    }
    Ok(WidgetUpdate {
        device_id: device_id.to_string(),
        widget_id: pin.to_string(),
        widget_value: value.to_string(),
    })
}

// -------------------- Message counter --------------------

/// Monotonic outbound message id allocator. Ids are strictly increasing
/// modulo the u16 width within one session; a fresh counter is built per
/// connection.
#[derive(Debug)]
pub struct MsgCounter {
    next: u16,
}

impl MsgCounter {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn next_id(&mut self) -> u16 {
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        id
    }
}

impl Default for MsgCounter {
    fn default() -> Self {
        Self::new()
    }
}
