use httparse::Error as HttpParseError;
use std::io;
use std::string::FromUtf8Error;
use thiserror::Error;
use tokio::time::error::Elapsed;

use crate::codec::ChannelId;

/// Reason codes carried in DropChannel blocks. The 2xxx range is fatal to
/// the physical connection, the 3xxx range to a single logical channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropCode {
    NormalClosure,
    InvalidEncapsulatingMessage,
    ChannelIdTruncated,
    EncapsulatedFrameIsTruncated,
    UnknownMuxOpcode,
    InvalidMuxControlBlock,
    ChannelAlreadyExists,
    NewChannelSlotViolation,
    UnknownRequestEncoding,
    SendQuotaViolation,
    Acknowledged,
}

impl DropCode {
    pub fn as_u16(&self) -> u16 {
        match self {
            DropCode::NormalClosure => 1000,
            DropCode::InvalidEncapsulatingMessage => 2001,
            DropCode::ChannelIdTruncated => 2002,
            DropCode::EncapsulatedFrameIsTruncated => 2003,
            DropCode::UnknownMuxOpcode => 2004,
            DropCode::InvalidMuxControlBlock => 2005,
            DropCode::ChannelAlreadyExists => 2006,
            DropCode::NewChannelSlotViolation => 2007,
            DropCode::UnknownRequestEncoding => 3002,
            DropCode::SendQuotaViolation => 3005,
            DropCode::Acknowledged => 3008,
        }
    }

    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            1000 => Some(DropCode::NormalClosure),
            2001 => Some(DropCode::InvalidEncapsulatingMessage),
            2002 => Some(DropCode::ChannelIdTruncated),
            2003 => Some(DropCode::EncapsulatedFrameIsTruncated),
            2004 => Some(DropCode::UnknownMuxOpcode),
            2005 => Some(DropCode::InvalidMuxControlBlock),
            2006 => Some(DropCode::ChannelAlreadyExists),
            2007 => Some(DropCode::NewChannelSlotViolation),
            3002 => Some(DropCode::UnknownRequestEncoding),
            3005 => Some(DropCode::SendQuotaViolation),
            3008 => Some(DropCode::Acknowledged),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    // Sender / Receiver Errors
    #[error("channel communication error")]
    CommunicationError,

    // General Errors
    #[error("{source}")]
    Timeout {
        #[from]
        source: Elapsed,
    },

    #[error("IO Error happened: {source}")]
    IOError {
        #[from]
        source: io::Error,
    },

    #[error("{source}")]
    FromUtf8Error {
        #[from]
        source: FromUtf8Error,
    },

    // Multiplexing errors.
    // A protocol violation that poisons the whole physical connection. The
    // reader announces `code` in a DropChannel block against `channel_id`
    // (0 when no channel is involved) and closes the connection.
    #[error("physical connection error on channel {channel_id}: {reason}")]
    PhysicalConnection {
        code: DropCode,
        channel_id: ChannelId,
        reason: String,
    },

    #[error("logical channel has been gracefully closed")]
    LogicalConnectionClosed,

    #[error("connection terminated")]
    ConnectionTerminated,

    #[error("a write is already in flight on this logical connection")]
    WriteAlreadyInFlight,

    #[error("send requested after sending out a closing handshake")]
    SendAfterClosingHandshake,

    #[error("multiplexing handler already started")]
    AlreadyStarted,

    // Handshake Errors
    #[error("Invalid handshake request method and version")]
    InvalidHTTPHandshake,

    #[error("Incomplete HTTP request")]
    IncompleteHTTPRequest,

    #[error("Connection: Upgrade header missing in the request")]
    NoConnectionHeaderPresent,

    #[error("Upgrade: websocket header missing in the request")]
    NoUpgradeHeaderPresent,

    #[error("Host header missing in the request")]
    NoHostHeaderPresent,

    #[error("Unsupported Sec-WebSocket-Version: {0}")]
    UnsupportedVersion(String),

    #[error("handshake aborted by the application handler")]
    HandshakeAborted,

    #[error("{source}")]
    HttpParseError {
        #[from]
        source: HttpParseError,
    },

    // Framing Errors
    #[error("RSV not zero")]
    RSVNotZero,

    #[error("Control frames must not be fragmented")]
    ControlFramesFragmented,

    #[error("Control frame with invalid payload size, can't be greater than 125")]
    ControlFramePayloadSize,

    #[error("Max frame size reached")]
    MaxFrameSize,

    #[error("Max message size reached")]
    MaxMessageSize,

    // Fragmentation Errors
    #[error("Invalid frame while there is a fragmented message in progress")]
    InvalidFrameFragmentation,

    #[error("Incoming fragmented message but there is one already in progress")]
    FragmentedInProgress,

    #[error("Invalid continuation frame: no fragmented message to continue")]
    InvalidContinuationFrame,

    #[error("Invalid Opcode")]
    InvalidOpcode,
}

impl Error {
    pub(crate) fn physical(code: DropCode, channel_id: ChannelId, reason: &str) -> Self {
        Error::PhysicalConnection {
            code,
            channel_id,
            reason: reason.to_string(),
        }
    }
}
