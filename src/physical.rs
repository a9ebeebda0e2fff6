use crate::config::MuxConfig;
use crate::error::Error;
use crate::frame::{Frame, OpCode};
use async_trait::async_trait;
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::{timeout, Duration};

/// The read side of the physical WebSocket connection, owned exclusively by
/// the reader task. Yields complete frames with client masks already
/// removed; fragmented data messages are reassembled here, so the
/// multiplexing core only ever sees whole encapsulating messages.
#[async_trait]
pub trait PhysicalRead: Send {
    async fn receive_frame(&mut self) -> Result<Frame, Error>;
}

/// The write side of the physical connection, owned exclusively by the
/// writer task. Takes complete frames as raw bytes.
#[async_trait]
pub trait PhysicalWrite: Send {
    async fn write(&mut self, data: &[u8]) -> Result<(), Error>;
}

#[derive(Clone)]
struct FragmentedMessage {
    fragments: Vec<u8>,
    op_code: OpCode,
}

/// Frame reader over the read half of a tokio stream.
pub struct FrameReader<R: AsyncRead + Unpin + Send> {
    buf_reader: BufReader<R>,
    fragmented_message: Option<FragmentedMessage>,
    config: MuxConfig,
}

impl<R: AsyncRead + Unpin + Send> FrameReader<R> {
    pub fn new(read: R, config: MuxConfig) -> Self {
        Self {
            buf_reader: BufReader::new(read),
            fragmented_message: None,
            config,
        }
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        match self.buf_reader.read_exact(buf).await {
            Ok(_) => Ok(()),
            // The peer going away mid-frame and a clean EOF both end the
            // physical connection for the multiplexer.
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => Err(Error::ConnectionTerminated),
            Err(err) => Err(err.into()),
        }
    }

    async fn read_frame(&mut self) -> Result<Frame, Error> {
        let mut header = [0u8; 2];
        self.read_exact(&mut header).await?;

        // The first bit in the first byte tells us whether the current frame
        // is the final fragment of a message, the last 4 bits carry the
        // opcode.
        let final_fragment = (header[0] & 0b10000000) != 0;
        let opcode = OpCode::from(header[0] & 0b00001111)?;

        // The multiplexing extension lives entirely inside the payload, so
        // the reserved bits of encapsulating frames stay zero.
        let rsv1 = (header[0] & 0b01000000) != 0;
        let rsv2 = (header[0] & 0b00100000) != 0;
        let rsv3 = (header[0] & 0b00010000) != 0;
        if rsv1 || rsv2 || rsv3 {
            return Err(Error::RSVNotZero);
        }

        // As a rule in websockets protocol, if your opcode is a control
        // opcode (ping, pong, close), your message can't be fragmented.
        if !final_fragment && opcode.is_control() {
            Err(Error::ControlFramesFragmented)?;
        }

        // The first bit of the second byte is the mask bit, the next 7 bits
        // carry the payload length or an escape to a wider length field.
        let masked = (header[1] & 0b10000000) != 0;
        let mut length = (header[1] & 0b01111111) as usize;

        // Control frames are only allowed to have a payload up to and
        // including 125 octets.
        if length > 125 && opcode.is_control() {
            Err(Error::ControlFramePayloadSize)?;
        }

        if length == 126 {
            let mut be_bytes = [0u8; 2];
            self.read_exact(&mut be_bytes).await?;
            length = u16::from_be_bytes(be_bytes) as usize;
        } else if length == 127 {
            let mut be_bytes = [0u8; 8];
            self.read_exact(&mut be_bytes).await?;
            length = u64::from_be_bytes(be_bytes) as usize;
        }

        if length > self.config.max_frame_size.unwrap_or(usize::MAX) {
            Err(Error::MaxFrameSize)?;
        }

        // Frames sent from client to server are always masked; the mask is
        // removed here so the rest of the stack never deals with it.
        let mask = if masked {
            let mut mask = [0u8; 4];
            self.read_exact(&mut mask).await?;
            Some(mask)
        } else {
            None
        };

        let mut payload = vec![0u8; length];

        // A timeout bounds how long a peer may sit on a half-sent payload
        // after a valid header, which would otherwise pin the reader task.
        let read_result = timeout(Duration::from_secs(5), self.read_exact(&mut payload)).await;
        match read_result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => Err(e)?,
            Err(elapsed) => Err(elapsed)?,
        }

        if let Some(mask) = mask {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= mask[i % 4];
            }
        }

        Ok(Frame {
            final_fragment,
            opcode,
            payload,
        })
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> PhysicalRead for FrameReader<R> {
    async fn receive_frame(&mut self) -> Result<Frame, Error> {
        loop {
            let frame = self.read_frame().await?;
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
                            return Ok(Frame::new(true, complete.op_code, complete.fragments));
                        }
                    } else {
                        Err(Error::InvalidContinuationFrame)?
                    }
                }
                OpCode::Text | OpCode::Binary => {
                    if self.fragmented_message.is_some() {
                        Err(Error::InvalidFrameFragmentation)?
                    }
                    return Ok(frame);
                }
                // Control frames may arrive between fragments and are passed
                // through to the reader task right away.
                OpCode::Close | OpCode::Ping | OpCode::Pong => return Ok(frame),
            }
        }
    }
}

/// Frame writer over the write half of a tokio stream. Frames produced by
/// the multiplexing core are already fully encoded (server frames are never
/// masked), so writing is a plain copy.
pub struct FrameWriter<W: AsyncWrite + Unpin + Send> {
    write_half: W,
}

impl<W: AsyncWrite + Unpin + Send> FrameWriter<W> {
    pub fn new(write_half: W) -> Self {
        Self { write_half }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> PhysicalWrite for FrameWriter<W> {
    async fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        self.write_half.write_all(data).await?;
        self.write_half.flush().await?;
        Ok(())
    }
}
