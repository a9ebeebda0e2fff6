use crate::error::{DropCode, Error};
use crate::frame::{create_binary_frame, create_header};

/// Logical channel identifier. The wire form is limited to 29 bits.
pub type ChannelId = u32;

pub const MAX_CHANNEL_ID: ChannelId = (1 << 29) - 1;

/// Channel id 0 is reserved for control blocks and never carries data.
pub const CONTROL_CHANNEL_ID: ChannelId = 0;

/// Channel id 1 is implicitly opened from the physical handshake.
pub const DEFAULT_CHANNEL_ID: ChannelId = 1;

pub const MUX_OPCODE_ADD_CHANNEL_REQUEST: u8 = 0;
pub const MUX_OPCODE_ADD_CHANNEL_RESPONSE: u8 = 1;
pub const MUX_OPCODE_FLOW_CONTROL: u8 = 2;
pub const MUX_OPCODE_DROP_CHANNEL: u8 = 3;
pub const MUX_OPCODE_NEW_CHANNEL_SLOT: u8 = 4;

pub const ENCODING_IDENTITY: u8 = 0;
pub const ENCODING_DELTA: u8 = 1;

/// Encodes a channel id in its shortest legal form. The leading bits of the
/// first byte select the width: `0` for 1 byte, `10` for 2, `110` for 3 and
/// `111` for 4.
pub fn encode_channel_id(channel_id: ChannelId) -> Vec<u8> {
    assert!(
        channel_id <= MAX_CHANNEL_ID,
        "channel id {} is too large",
        channel_id
    );

    if channel_id < 1 << 7 {
        vec![channel_id as u8]
    } else if channel_id < 1 << 14 {
        (0x8000 | channel_id as u16).to_be_bytes().to_vec()
    } else if channel_id < 1 << 21 {
        let mut encoded = vec![0xc0 | (channel_id >> 16) as u8];
        encoded.extend_from_slice(&(channel_id as u16).to_be_bytes());
        encoded
    } else {
        (0xe000_0000 | channel_id).to_be_bytes().to_vec()
    }
}

/// Encodes a number the way control blocks carry lengths and quotas: the
/// value itself when below 126, `126` plus 2 bytes, or `127` plus 8 bytes,
/// big-endian.
pub fn encode_number(value: u64) -> Vec<u8> {
    if value < 126 {
        vec![value as u8]
    } else if value <= 0xffff {
        let mut encoded = vec![126];
        encoded.extend_from_slice(&(value as u16).to_be_bytes());
        encoded
    } else {
        let mut encoded = vec![127];
        encoded.extend_from_slice(&value.to_be_bytes());
        encoded
    }
}

/// A control block parsed from a channel-0 payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlBlock {
    AddChannelRequest {
        channel_id: ChannelId,
        encoding: u8,
        encoded_handshake: Vec<u8>,
    },
    AddChannelResponse {
        channel_id: ChannelId,
        encoding: u8,
        rejected: bool,
        encoded_handshake: Vec<u8>,
    },
    FlowControl {
        channel_id: ChannelId,
        send_quota: u64,
    },
    DropChannel {
        channel_id: ChannelId,
        drop_code: Option<u16>,
        drop_message: String,
        mux_error: bool,
    },
    NewChannelSlot {
        slots: u64,
        send_quota: u64,
        fallback: bool,
    },
}

/// An encapsulated frame: the single header byte that follows the channel id
/// plus the remaining payload of the outer frame.
#[derive(Debug, Clone, PartialEq)]
pub struct InnerFrame {
    pub final_fragment: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: u8,
    pub payload: Vec<u8>,
}

impl InnerFrame {
    /// Rebuilds a standard unmasked WebSocket frame so the logical stream can
    /// feed it through the ordinary frame parser.
    pub fn encapsulate(&self) -> Vec<u8> {
        let mut data = create_header(
            self.final_fragment,
            self.rsv1,
            self.rsv2,
            self.rsv3,
            self.opcode,
            self.payload.len(),
        );
        data.extend_from_slice(&self.payload);
        data
    }
}

/// Parses the payload of a multiplexed physical frame: the leading channel
/// id, then either one encapsulated frame or a sequence of control blocks.
pub struct MuxFrameParser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> MuxFrameParser<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn has_remaining(&self) -> bool {
        self.pos < self.data.len()
    }

    fn take(&mut self, length: usize, on_short: Error) -> Result<&'a [u8], Error> {
        if self.pos + length > self.data.len() {
            return Err(on_short);
        }
        let slice = &self.data[self.pos..self.pos + length];
        self.pos += length;
        Ok(slice)
    }

    pub fn read_channel_id(&mut self) -> Result<ChannelId, Error> {
        let truncated =
            || Error::physical(DropCode::ChannelIdTruncated, 0, "invalid channel id format");

        if self.pos >= self.data.len() {
            return Err(Error::physical(
                DropCode::ChannelIdTruncated,
                0,
                "no channel id found",
            ));
        }

        let first = self.data[self.pos];
        let (channel_id, length, minimum): (ChannelId, usize, ChannelId) = if first & 0xe0 == 0xe0
        {
            let bytes = self.take(4, truncated())?;
            let value = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) & 0x1fff_ffff;
            (value, 4, 1 << 21)
        } else if first & 0xc0 == 0xc0 {
            let bytes = self.take(3, truncated())?;
            let value =
                ((bytes[0] as u32 & 0x1f) << 16) | u16::from_be_bytes([bytes[1], bytes[2]]) as u32;
            (value, 3, 1 << 14)
        } else if first & 0x80 == 0x80 {
            let bytes = self.take(2, truncated())?;
            let value = u16::from_be_bytes([bytes[0], bytes[1]]) as u32 & 0x3fff;
            (value, 2, 1 << 7)
        } else {
            self.pos += 1;
            (first as u32, 1, 0)
        };

        // A value carried in a longer form than its shortest encoding is not
        // a legal channel id.
        if length > 1 && channel_id < minimum {
            return Err(Error::physical(
                DropCode::ChannelIdTruncated,
                0,
                "channel id is not encoded in its shortest form",
            ));
        }

        Ok(channel_id)
    }

    pub fn read_number(&mut self) -> Result<u64, Error> {
        let invalid = |reason: &str| Error::physical(DropCode::InvalidMuxControlBlock, 0, reason);

        if self.pos >= self.data.len() {
            return Err(invalid("no number field found"));
        }

        let first = self.data[self.pos];
        if first & 0x80 != 0 {
            return Err(invalid("the most significant bit of a number field is set"));
        }
        self.pos += 1;

        match first {
            126 => {
                let bytes = self.take(2, invalid("truncated 2-byte number field"))?;
                let value = u16::from_be_bytes([bytes[0], bytes[1]]) as u64;
                if value <= 125 {
                    return Err(invalid("over-long 2-byte number encoding"));
                }
                Ok(value)
            }
            127 => {
                let bytes = self.take(8, invalid("truncated 8-byte number field"))?;
                let value = u64::from_be_bytes([
                    bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
                ]);
                if value & 0x8000_0000_0000_0000 != 0 {
                    return Err(invalid("the most significant bit of a number field is set"));
                }
                if value <= 0xffff {
                    return Err(invalid("over-long 8-byte number encoding"));
                }
                Ok(value)
            }
            _ => Ok(first as u64),
        }
    }

    /// Reads a number-encoded size followed by that many bytes of contents.
    pub fn read_size_and_contents(&mut self) -> Result<Vec<u8>, Error> {
        let size = self.read_number()? as usize;
        let contents = self.take(
            size,
            Error::physical(
                DropCode::InvalidMuxControlBlock,
                0,
                "control block contents are shorter than the advertised size",
            ),
        )?;
        Ok(contents.to_vec())
    }

    /// Reads the encapsulated frame that follows a data channel id, consuming
    /// the rest of the payload.
    pub fn read_inner_frame(&mut self) -> Result<InnerFrame, Error> {
        if self.pos >= self.data.len() {
            return Err(Error::physical(
                DropCode::EncapsulatedFrameIsTruncated,
                0,
                "no encapsulated frame bits found",
            ));
        }

        let bits = self.data[self.pos];
        self.pos += 1;
        let payload = self.data[self.pos..].to_vec();
        self.pos = self.data.len();

        Ok(InnerFrame {
            final_fragment: bits & 0x80 != 0,
            rsv1: bits & 0x40 != 0,
            rsv2: bits & 0x20 != 0,
            rsv3: bits & 0x10 != 0,
            opcode: bits & 0x0f,
            payload,
        })
    }

    pub fn read_control_block(&mut self) -> Result<ControlBlock, Error> {
        if self.pos >= self.data.len() {
            return Err(Error::physical(
                DropCode::InvalidMuxControlBlock,
                0,
                "no control opcode found",
            ));
        }
        let first_byte = self.data[self.pos];
        self.pos += 1;

        let opcode = (first_byte >> 5) & 0x7;
        match opcode {
            MUX_OPCODE_ADD_CHANNEL_REQUEST => {
                let encoding = first_byte & 0x3;
                let channel_id = self.read_channel_id()?;
                let encoded_handshake = self.read_size_and_contents()?;
                Ok(ControlBlock::AddChannelRequest {
                    channel_id,
                    encoding,
                    encoded_handshake,
                })
            }
            MUX_OPCODE_ADD_CHANNEL_RESPONSE => {
                let rejected = first_byte & 0x10 != 0;
                let encoding = first_byte & 0x3;
                let channel_id = self.read_channel_id()?;
                let encoded_handshake = self.read_size_and_contents()?;
                Ok(ControlBlock::AddChannelResponse {
                    channel_id,
                    encoding,
                    rejected,
                    encoded_handshake,
                })
            }
            MUX_OPCODE_FLOW_CONTROL => {
                let channel_id = self.read_channel_id()?;
                let send_quota = self.read_number()?;
                Ok(ControlBlock::FlowControl {
                    channel_id,
                    send_quota,
                })
            }
            MUX_OPCODE_DROP_CHANNEL => {
                let mux_error = first_byte & 0x10 != 0;
                let channel_id = self.read_channel_id()?;
                let reason = self.read_size_and_contents()?;

                let (drop_code, drop_message) = if reason.is_empty() {
                    (None, String::new())
                } else {
                    if reason.len() < 2 {
                        return Err(Error::physical(
                            DropCode::InvalidMuxControlBlock,
                            0,
                            "DropChannel reason is too short",
                        ));
                    }
                    if !mux_error {
                        return Err(Error::physical(
                            DropCode::InvalidMuxControlBlock,
                            0,
                            "DropChannel carries a reason without the F bit",
                        ));
                    }
                    let code = u16::from_be_bytes([reason[0], reason[1]]);
                    let message = String::from_utf8_lossy(&reason[2..]).into_owned();
                    (Some(code), message)
                };

                Ok(ControlBlock::DropChannel {
                    channel_id,
                    drop_code,
                    drop_message,
                    mux_error,
                })
            }
            MUX_OPCODE_NEW_CHANNEL_SLOT => {
                let fallback = first_byte & 0x1 != 0;
                let slots = self.read_number()?;
                let send_quota = self.read_number()?;
                if fallback && (slots != 0 || send_quota != 0) {
                    return Err(Error::physical(
                        DropCode::InvalidMuxControlBlock,
                        0,
                        "fallback NewChannelSlot must carry zero slots and quota",
                    ));
                }
                Ok(ControlBlock::NewChannelSlot {
                    slots,
                    send_quota,
                    fallback,
                })
            }
            _ => Err(Error::physical(
                DropCode::UnknownMuxOpcode,
                0,
                "invalid multiplexing opcode",
            )),
        }
    }

    /// Parses every remaining control block. Handy for tests; the handler
    /// processes blocks one at a time so earlier blocks take effect even when
    /// a later one is malformed.
    pub fn read_control_blocks(&mut self) -> Result<Vec<ControlBlock>, Error> {
        let mut blocks = Vec::new();
        while self.has_remaining() {
            blocks.push(self.read_control_block()?);
        }
        Ok(blocks)
    }
}

fn create_control_block(opcode: u8, flags: u8, channel_id: ChannelId, value: &[u8]) -> Vec<u8> {
    let mut block = vec![(opcode << 5) | (flags & 0x1f)];
    block.extend_from_slice(&encode_channel_id(channel_id));
    block.extend_from_slice(&encode_number(value.len() as u64));
    block.extend_from_slice(value);
    block
}

/// Builds a complete physical frame carrying an AddChannelResponse block.
pub fn create_add_channel_response(
    channel_id: ChannelId,
    encoded_handshake: &[u8],
    encoding: u8,
    rejected: bool,
) -> Vec<u8> {
    let flags = ((rejected as u8) << 4) | (encoding & 0x3);
    let block = create_control_block(
        MUX_OPCODE_ADD_CHANNEL_RESPONSE,
        flags,
        channel_id,
        encoded_handshake,
    );
    let mut payload = encode_channel_id(CONTROL_CHANNEL_ID);
    payload.extend_from_slice(&block);
    create_binary_frame(&payload)
}

/// Builds a complete physical frame carrying a DropChannel block. The F bit
/// is set whenever a code travels with the block, so that the reason survives
/// the receive-side validity rule.
pub fn create_drop_channel(
    channel_id: ChannelId,
    code: Option<DropCode>,
    message: &str,
) -> Vec<u8> {
    let mut reason = Vec::new();
    if let Some(code) = code {
        reason.extend_from_slice(&code.as_u16().to_be_bytes());
        reason.extend_from_slice(message.as_bytes());
    }

    let flags = (code.is_some() as u8) << 4;
    let block = create_control_block(MUX_OPCODE_DROP_CHANNEL, flags, channel_id, &reason);
    let mut payload = encode_channel_id(CONTROL_CHANNEL_ID);
    payload.extend_from_slice(&block);
    create_binary_frame(&payload)
}

/// Builds a complete physical frame carrying a FlowControl block.
pub fn create_flow_control(channel_id: ChannelId, replenished_quota: u64) -> Vec<u8> {
    let mut block = vec![MUX_OPCODE_FLOW_CONTROL << 5];
    block.extend_from_slice(&encode_channel_id(channel_id));
    block.extend_from_slice(&encode_number(replenished_quota));
    let mut payload = encode_channel_id(CONTROL_CHANNEL_ID);
    payload.extend_from_slice(&block);
    create_binary_frame(&payload)
}

/// Builds a complete physical frame carrying a NewChannelSlot block.
pub fn create_new_channel_slot(slots: u64, send_quota: u64) -> Vec<u8> {
    let mut block = vec![MUX_OPCODE_NEW_CHANNEL_SLOT << 5];
    block.extend_from_slice(&encode_number(slots));
    block.extend_from_slice(&encode_number(send_quota));
    let mut payload = encode_channel_id(CONTROL_CHANNEL_ID);
    payload.extend_from_slice(&block);
    create_binary_frame(&payload)
}
