use crate::codec::encode_channel_id;
use crate::config::MuxConfig;
use crate::error::Error;
use crate::frame::{
    create_binary_frame, create_closing_handshake_body, Frame, OpCode, STATUS_NORMAL_CLOSURE,
};
use crate::request::LogicalRequest;
use log::debug;
use std::sync::Arc;

/// Every message costs one extra byte of quota on top of its payload.
const PER_MESSAGE_EXTRA_COST: u64 = 1;

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

impl Message {
    // Converts a Frame into a Message variant
    pub fn from_frame(frame: Frame) -> Result<Self, Error> {
        match frame.opcode {
            OpCode::Text => Ok(Message::Text(String::from_utf8(frame.payload)?)),
            OpCode::Binary => Ok(Message::Binary(frame.payload)),
            _ => Err(Error::InvalidOpcode),
        }
    }

    // Function to get the payload as binary (Vec<u8>)
    pub fn as_binary(&self) -> Vec<u8> {
        match self {
            Message::Text(text) => text.as_bytes().to_vec(),
            Message::Binary(data) => data.clone(),
        }
    }

    // Function to get the payload as a String
    pub fn as_text(&self) -> Result<String, Error> {
        match self {
            Message::Text(text) => Ok(text.clone()),
            Message::Binary(data) => Ok(String::from_utf8(data.clone())?),
        }
    }
}

#[derive(Clone)]
struct FragmentedMessage {
    fragments: Vec<u8>,
    op_code: OpCode,
}

/// A WebSocket stream facade over one logical channel. Outgoing frames are
/// wrapped as `channel_id || inner_header || payload` inside an unmasked
/// binary frame of the physical connection; incoming frames were already
/// unwrapped by the multiplexing handler and arrive through the logical
/// connection's buffer.
pub struct LogicalStream {
    request: Arc<LogicalRequest>,
    fragmented_message: Option<FragmentedMessage>,
    config: MuxConfig,
}

impl LogicalStream {
    pub(crate) fn new(request: Arc<LogicalRequest>, config: MuxConfig) -> Self {
        Self {
            request,
            fragmented_message: None,
            config,
        }
    }

    fn create_inner_frame(&self, opcode: &OpCode, payload: &[u8], end: bool) -> Vec<u8> {
        let bits = (end as u8) << 7 | opcode.as_u8();
        let mut data = encode_channel_id(self.request.channel_id);
        data.push(bits);
        data.extend_from_slice(payload);
        data
    }

    /// Wraps and ships one inner frame. Masking is left to the physical
    /// stream; server-to-client frames travel unmasked.
    async fn write_inner_frame(
        &self,
        opcode: OpCode,
        payload: Vec<u8>,
        consume_quota: bool,
    ) -> Result<(), Error> {
        if consume_quota {
            self.request
                .connection
                .consume_send_quota(payload.len() as u64 + PER_MESSAGE_EXTRA_COST)
                .await?;
        }

        let inner = self.create_inner_frame(&opcode, &payload, true);
        let frame_data = create_binary_frame(&inner);
        self.request.connection.write(frame_data).await
    }

    pub async fn send_message(&mut self, message: Message) -> Result<(), Error> {
        if self.request.server_terminated() {
            return Err(Error::SendAfterClosingHandshake);
        }

        let payload = message.as_binary();
        if payload.len() > self.config.max_message_size.unwrap_or(usize::MAX) {
            return Err(Error::MaxMessageSize);
        }

        let opcode = match message {
            Message::Text(_) => OpCode::Text,
            Message::Binary(_) => OpCode::Binary,
        };
        self.write_inner_frame(opcode, payload, true).await
    }

    pub async fn send_ping(&mut self, body: Vec<u8>) -> Result<(), Error> {
        if body.len() > 125 {
            return Err(Error::ControlFramePayloadSize);
        }
        debug!(
            "sending ping on logical channel {}",
            self.request.channel_id
        );
        self.write_inner_frame(OpCode::Ping, body, true).await
    }

    async fn send_pong(&mut self, body: Vec<u8>) -> Result<(), Error> {
        debug!(
            "sending pong on logical channel {}",
            self.request.channel_id
        );
        self.write_inner_frame(OpCode::Pong, body, true).await
    }

    /// Answers the client's closing handshake. Close frames are exempt from
    /// the send-quota gate, otherwise a channel with an exhausted budget
    /// could never complete its closing handshake.
    async fn send_closing_handshake(&mut self, code: u16) -> Result<(), Error> {
        let body = create_closing_handshake_body(code, "");
        self.request.set_server_terminated();
        debug!(
            "sending closing handshake for logical channel {}",
            self.request.channel_id
        );
        self.write_inner_frame(OpCode::Close, body, false).await
    }

    /// Marks this side of the channel closed. No more sends are attempted;
    /// the handler tears the channel down once the worker returns.
    pub fn close_connection(&mut self) {
        debug!("closing logical connection {}", self.request.channel_id);
        self.request.set_server_terminated();
    }

    /// Receives the next complete message. `Ok(None)` means the channel was
    /// closed gracefully and the worker should wind down.
    pub async fn receive_message(&mut self) -> Result<Option<Message>, Error> {
        loop {
            let frame = match self.read_frame().await {
                Ok(frame) => frame,
                // The closing handshake already completed; to the worker this
                // is a normal end of stream.
                Err(Error::LogicalConnectionClosed) => return Ok(None),
                Err(err) => return Err(err),
            };

            match frame.opcode {
                OpCode::Text | OpCode::Binary if !frame.final_fragment => {
                    if self.fragmented_message.is_none() {
                        self.fragmented_message = Some(FragmentedMessage {
                            op_code: frame.opcode,
                            fragments: frame.payload,
                        });
                    } else {
                        Err(Error::FragmentedInProgress)?
                    }
                }
                OpCode::Continue => {
                    if let Some(ref mut fragmented_message) = self.fragmented_message {
                        fragmented_message
                            .fragments
                            .extend_from_slice(&frame.payload);

                        if fragmented_message.fragments.len()
                            > self.config.max_message_size.unwrap_or(usize::MAX)
                        {
                            Err(Error::MaxMessageSize)?;
                        }

                        if frame.final_fragment {
                            let complete = self.fragmented_message.take().unwrap();
                            return Ok(Some(Message::from_frame(Frame::new(
                                true,
                                complete.op_code,
                                complete.fragments,
                            ))?));
                        }
                    } else {
                        Err(Error::InvalidContinuationFrame)?
                    }
                }
                OpCode::Text | OpCode::Binary => {
                    if self.fragmented_message.is_some() {
                        Err(Error::InvalidFrameFragmentation)?
                    }
                    return Ok(Some(Message::from_frame(frame)?));
                }
                OpCode::Close => {
                    self.request.set_client_terminated();
                    if !self.request.server_terminated() {
                        let code = if frame.payload.len() >= 2 {
                            u16::from_be_bytes([frame.payload[0], frame.payload[1]])
                        } else {
                            STATUS_NORMAL_CLOSURE
                        };
                        self.send_closing_handshake(code).await?;
                    }
                    self.request
                        .connection
                        .set_read_state(crate::connection::ReadState::GracefullyClosed)
                        .await;
                    return Ok(None);
                }
                OpCode::Ping => {
                    self.send_pong(frame.payload).await?;
                }
                OpCode::Pong => {
                    // absorb; no ping bookkeeping on logical channels
                }
            }
        }
    }

    /// Reads one reconstructed frame out of the logical connection's buffer.
    /// The header was rebuilt by the multiplexing handler with the mask bit
    /// cleared, so this is plain unmasked frame parsing.
    async fn read_frame(&mut self) -> Result<Frame, Error> {
        let header = self.request.connection.read(2).await?;

        let final_fragment = (header[0] & 0b10000000) != 0;
        let opcode = OpCode::from(header[0] & 0b00001111)?;

        // No extension negotiates reserved bits inside a logical channel.
        let rsv1 = (header[0] & 0b01000000) != 0;
        let rsv2 = (header[0] & 0b00100000) != 0;
        let rsv3 = (header[0] & 0b00010000) != 0;
        if rsv1 || rsv2 || rsv3 {
            return Err(Error::RSVNotZero);
        }

        if !final_fragment && opcode.is_control() {
            Err(Error::ControlFramesFragmented)?;
        }

        let mut length = (header[1] & 0b01111111) as usize;
        if length > 125 && opcode.is_control() {
            Err(Error::ControlFramePayloadSize)?;
        }

        if length == 126 {
            let be_bytes = self.request.connection.read(2).await?;
            length = u16::from_be_bytes([be_bytes[0], be_bytes[1]]) as usize;
        } else if length == 127 {
            let be_bytes = self.request.connection.read(8).await?;
            length = u64::from_be_bytes([
                be_bytes[0], be_bytes[1], be_bytes[2], be_bytes[3], be_bytes[4], be_bytes[5],
                be_bytes[6], be_bytes[7],
            ]) as usize;
        }

        if length > self.config.max_frame_size.unwrap_or(usize::MAX) {
            Err(Error::MaxFrameSize)?;
        }

        let payload = self.request.connection.read(length).await?;

        Ok(Frame {
            final_fragment,
            opcode,
            payload,
        })
    }
}
