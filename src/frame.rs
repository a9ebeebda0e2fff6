use crate::error::Error;

pub const STATUS_NORMAL_CLOSURE: u16 = 1000;
pub const STATUS_INTERNAL_ENDPOINT_ERROR: u16 = 1011;

#[derive(Debug, Clone, PartialEq)]
pub enum OpCode {
    Continue,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    pub fn from(byte: u8) -> Result<Self, Error> {
        match byte {
            0x0 => Ok(OpCode::Continue),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            _ => Err(Error::InvalidOpcode),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            OpCode::Continue => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub final_fragment: bool,
    pub opcode: OpCode,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(final_fragment: bool, opcode: OpCode, payload: Vec<u8>) -> Self {
        Self {
            final_fragment,
            opcode,
            payload,
        }
    }
}

/// Builds a frame header for the given raw opcode bits. The mask bit is never
/// set: frames produced on the server side travel unmasked, and reconstructed
/// encapsulated frames are parsed after the physical stream already removed
/// the client mask.
pub fn create_header(
    final_fragment: bool,
    rsv1: bool,
    rsv2: bool,
    rsv3: bool,
    opcode: u8,
    payload_len: usize,
) -> Vec<u8> {
    let first_byte = (final_fragment as u8) << 7
        | (rsv1 as u8) << 6
        | (rsv2 as u8) << 5
        | (rsv3 as u8) << 4
        | (opcode & 0x0f);

    let mut header = vec![first_byte];

    // According to Websockets RFC, if the payload length is less or equal 125,
    // it's written as an 8-bit unsigned integer, if it's between 126 and 65535,
    // it's represented by 2 additional bytes, and by 8 additional bytes beyond.
    if payload_len <= 125 {
        header.push(payload_len as u8);
    } else if payload_len <= 65535 {
        header.push(126);
        header.extend_from_slice(&(payload_len as u16).to_be_bytes());
    } else {
        header.push(127);
        header.extend_from_slice(&(payload_len as u64).to_be_bytes());
    }

    header
}

/// A complete unfragmented binary frame, ready for the physical socket.
pub fn create_binary_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = create_header(true, false, false, false, OpCode::Binary.as_u8(), payload.len());
    frame.extend_from_slice(payload);
    frame
}

/// Closing handshake body: a 2-byte big-endian status code followed by an
/// optional UTF-8 reason.
pub fn create_closing_handshake_body(code: u16, reason: &str) -> Vec<u8> {
    let mut body = code.to_be_bytes().to_vec();
    body.extend_from_slice(reason.as_bytes());
    body
}

/// A complete close frame for the physical connection.
pub fn create_close_frame(code: u16, reason: &str) -> Vec<u8> {
    let body = create_closing_handshake_body(code, reason);
    let mut frame = create_header(true, false, false, false, OpCode::Close.as_u8(), body.len());
    frame.extend_from_slice(&body);
    frame
}
