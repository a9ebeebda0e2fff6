#[cfg(test)]
mod tests {
    use crate::codec::{
        create_add_channel_response, create_drop_channel, create_flow_control,
        create_new_channel_slot, encode_channel_id, encode_number, ChannelId, ControlBlock,
        InnerFrame, MuxFrameParser, ENCODING_DELTA, ENCODING_IDENTITY,
    };
    use crate::config::MuxConfig;
    use crate::dispatch::Dispatcher;
    use crate::error::{DropCode, Error};
    use crate::frame::{
        create_close_frame, create_closing_handshake_body, create_header, Frame, OpCode,
        STATUS_INTERNAL_ENDPOINT_ERROR, STATUS_NORMAL_CLOSURE,
    };
    use crate::handler::MuxHandler;
    use crate::handshake::{generate_websocket_accept_value, parse_encoded_handshake, ParsedRequest};
    use crate::physical::{PhysicalRead, PhysicalWrite};
    use crate::request::LogicalRequest;
    use crate::stream::LogicalStream;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::mpsc::{channel, Receiver, Sender};

    fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn test_create_header() {
        // Short, extended, and wide length forms, always with the mask bit
        // clear: server frames and reconstructed encapsulated frames travel
        // unmasked.
        assert_eq!(
            create_header(true, false, false, false, OpCode::Binary.as_u8(), 5),
            b"\x82\x05"
        );
        assert_eq!(
            create_header(false, false, false, false, OpCode::Continue.as_u8(), 126),
            b"\x00\x7e\x00\x7e"
        );
        assert_eq!(
            create_header(true, false, false, false, OpCode::Binary.as_u8(), 0x10000),
            b"\x82\x7f\x00\x00\x00\x00\x00\x01\x00\x00"
        );

        // Reserved bits of an encapsulated frame survive the rebuild.
        assert_eq!(
            create_header(true, true, false, false, OpCode::Text.as_u8(), 0),
            b"\xc1\x00"
        );
    }

    #[test]
    fn test_create_close_frame() {
        assert_eq!(
            create_closing_handshake_body(STATUS_NORMAL_CLOSURE, "done"),
            b"\x03\xe8done"
        );
        // The close the handler emits on a fatal protocol error.
        assert_eq!(
            create_close_frame(STATUS_INTERNAL_ENDPOINT_ERROR, ""),
            b"\x88\x02\x03\xf3"
        );
    }

    #[test]
    fn test_channel_id_encode() {
        assert_eq!(encode_channel_id(0), b"\x00");
        assert_eq!(encode_channel_id(1), b"\x01");
        assert_eq!(encode_channel_id((1 << 14) - 1), b"\xbf\xff");
        assert_eq!(encode_channel_id(1 << 14), b"\xc0\x40\x00");
        assert_eq!(encode_channel_id((1 << 21) - 1), b"\xdf\xff\xff");
        assert_eq!(encode_channel_id(1 << 21), b"\xe0\x20\x00\x00");
        assert_eq!(encode_channel_id((1 << 29) - 1), b"\xff\xff\xff\xff");
    }

    #[test]
    #[should_panic]
    fn test_channel_id_encode_too_large() {
        encode_channel_id(1 << 29);
    }

    #[test]
    fn test_channel_id_decode() {
        let data = b"\x00\x01\xbf\xff\xdf\xff\xff\xff\xff\xff\xff";
        let mut parser = MuxFrameParser::new(data);
        assert_eq!(parser.read_channel_id().unwrap(), 0);
        assert_eq!(parser.read_channel_id().unwrap(), 1);
        assert_eq!(parser.read_channel_id().unwrap(), (1 << 14) - 1);
        assert_eq!(parser.read_channel_id().unwrap(), (1 << 21) - 1);
        assert_eq!(parser.read_channel_id().unwrap(), (1 << 29) - 1);
        assert!(!parser.has_remaining());
    }

    #[test]
    fn test_channel_id_decode_round_trip() {
        for channel_id in [0, 1, 127, 128, (1 << 14) - 1, 1 << 14, (1 << 21) - 1, 1 << 21] {
            let encoded = encode_channel_id(channel_id);
            let mut parser = MuxFrameParser::new(&encoded);
            assert_eq!(parser.read_channel_id().unwrap(), channel_id);
        }
    }

    #[test]
    fn test_channel_id_decode_truncated() {
        // The last byte of the channel id is missing.
        let mut parser = MuxFrameParser::new(b"\x80");
        assert!(parser.read_channel_id().is_err());

        let mut parser = MuxFrameParser::new(b"\xe0\x00\x00");
        assert!(parser.read_channel_id().is_err());

        let mut parser = MuxFrameParser::new(b"");
        assert!(parser.read_channel_id().is_err());
    }

    #[test]
    fn test_channel_id_decode_rejects_longer_forms() {
        // Value 1 in the 2-byte, 3-byte and 4-byte forms.
        for data in [&b"\x80\x01"[..], &b"\xc0\x00\x01"[..], &b"\xe0\x00\x00\x01"[..]] {
            let mut parser = MuxFrameParser::new(data);
            assert!(parser.read_channel_id().is_err());
        }
    }

    #[test]
    fn test_number_encode() {
        assert_eq!(encode_number(0), b"\x00");
        assert_eq!(encode_number(125), b"\x7d");
        assert_eq!(encode_number(126), b"\x7e\x00\x7e");
        assert_eq!(encode_number(0xffff), b"\x7e\xff\xff");
        assert_eq!(encode_number(0x10000), b"\x7f\x00\x00\x00\x00\x00\x01\x00\x00");
    }

    #[test]
    fn test_number_decode_rejections() {
        // No number field.
        assert!(MuxFrameParser::new(b"").read_number().is_err());
        // The last two bytes are missing.
        assert!(MuxFrameParser::new(b"\x7e").read_number().is_err());
        // Missing the last one byte.
        assert!(MuxFrameParser::new(b"\x7f\x00\x00\x00\x00\x00\x01\x00")
            .read_number()
            .is_err());
        // The msb of the 8-byte value is set.
        assert!(MuxFrameParser::new(b"\x7f\xff\xff\xff\xff\xff\xff\xff\xff")
            .read_number()
            .is_err());
        // The msb of the first byte is set.
        assert!(MuxFrameParser::new(b"\x80").read_number().is_err());
        // Using 3 bytes encoding for 125.
        assert!(MuxFrameParser::new(b"\x7e\x00\x7d").read_number().is_err());
        // Using 9 bytes encoding for 0xffff.
        assert!(MuxFrameParser::new(b"\x7f\x00\x00\x00\x00\x00\x00\xff\xff")
            .read_number()
            .is_err());
    }

    #[test]
    fn test_read_size_and_contents_truncated() {
        // Only contains the size field.
        assert!(MuxFrameParser::new(b"\x01").read_size_and_contents().is_err());
    }

    #[test]
    fn test_read_add_channel_request() {
        let data = b"\x00\x01\x01a";
        let blocks = MuxFrameParser::new(data).read_control_blocks().unwrap();
        assert_eq!(
            blocks,
            vec![ControlBlock::AddChannelRequest {
                channel_id: 1,
                encoding: ENCODING_IDENTITY,
                encoded_handshake: b"a".to_vec(),
            }]
        );
    }

    #[test]
    fn test_read_multiple_control_blocks() {
        // AddChannelRequest can carry an arbitrary length of data, which makes
        // it exercise every width of the number encoding.
        let mut data = Vec::new();
        data.extend_from_slice(b"\x00\x01\x01a");
        data.extend_from_slice(b"\x00\x02\x7d");
        data.extend_from_slice(&vec![b'a'; 0x7d]);
        data.extend_from_slice(b"\x00\x03\x7e\xff\xff");
        data.extend_from_slice(&vec![b'b'; 0xffff]);
        data.extend_from_slice(b"\x00\x04\x7f\x00\x00\x00\x00\x00\x01\x00\x00");
        data.extend_from_slice(&vec![b'c'; 0x10000]);

        let blocks = MuxFrameParser::new(&data).read_control_blocks().unwrap();
        assert_eq!(blocks.len(), 4);

        for (index, (channel_id, size)) in
            [(1u32, 1usize), (2, 0x7d), (3, 0xffff), (4, 0x10000)].iter().enumerate()
        {
            match &blocks[index] {
                ControlBlock::AddChannelRequest {
                    channel_id: id,
                    encoded_handshake,
                    ..
                } => {
                    assert_eq!(id, channel_id);
                    assert_eq!(encoded_handshake.len(), *size);
                }
                other => panic!("unexpected block {:?}", other),
            }
        }
    }

    #[test]
    fn test_read_drop_channel() {
        let blocks = MuxFrameParser::new(b"\x60\x01\x00")
            .read_control_blocks()
            .unwrap();
        assert_eq!(
            blocks,
            vec![ControlBlock::DropChannel {
                channel_id: 1,
                drop_code: None,
                drop_message: String::new(),
                mux_error: false,
            }]
        );

        let blocks = MuxFrameParser::new(b"\x70\x02\x09\x03\xe8Success")
            .read_control_blocks()
            .unwrap();
        assert_eq!(
            blocks,
            vec![ControlBlock::DropChannel {
                channel_id: 2,
                drop_code: Some(1000),
                drop_message: "Success".to_string(),
                mux_error: true,
            }]
        );

        // Reason is too short to carry a code.
        assert!(MuxFrameParser::new(b"\x60\x01\x01\x00")
            .read_control_blocks()
            .is_err());

        // A reason without the F bit is not allowed.
        assert!(MuxFrameParser::new(b"\x60\x02\x09\x03\xe8Success")
            .read_control_blocks()
            .is_err());
    }

    #[test]
    fn test_read_flow_control() {
        let blocks = MuxFrameParser::new(b"\x40\x01\x02")
            .read_control_blocks()
            .unwrap();
        assert_eq!(
            blocks,
            vec![ControlBlock::FlowControl {
                channel_id: 1,
                send_quota: 2,
            }]
        );
    }

    #[test]
    fn test_read_new_channel_slot() {
        let blocks = MuxFrameParser::new(b"\x80\x01\x02")
            .read_control_blocks()
            .unwrap();
        assert_eq!(
            blocks,
            vec![ControlBlock::NewChannelSlot {
                slots: 1,
                send_quota: 2,
                fallback: false,
            }]
        );

        // A fallback slot block must carry zero slots and quota.
        assert!(MuxFrameParser::new(b"\x81\x00\x00")
            .read_control_blocks()
            .is_ok());
        assert!(MuxFrameParser::new(b"\x81\x01\x00")
            .read_control_blocks()
            .is_err());
    }

    #[test]
    fn test_read_unknown_mux_opcode() {
        let result = MuxFrameParser::new(b"\xa0").read_control_blocks();
        match result {
            Err(Error::PhysicalConnection { code, .. }) => {
                assert_eq!(code, DropCode::UnknownMuxOpcode)
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_read_inner_frame() {
        let mut parser = MuxFrameParser::new(b"\x82Hi");
        let inner = parser.read_inner_frame().unwrap();
        assert!(inner.final_fragment);
        assert_eq!(inner.opcode, OpCode::Binary.as_u8());
        assert_eq!(inner.payload, b"Hi");
        assert!(!parser.has_remaining());

        // The rebuilt frame is a plain unmasked WebSocket frame.
        assert_eq!(inner.encapsulate(), b"\x82\x02Hi");

        let result = MuxFrameParser::new(b"").read_inner_frame();
        match result {
            Err(Error::PhysicalConnection { code, .. }) => {
                assert_eq!(code, DropCode::EncapsulatedFrameIsTruncated)
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_create_add_channel_response() {
        let data = create_add_channel_response(1, b"FooBar", ENCODING_IDENTITY, false);
        assert_eq!(data, b"\x82\x0a\x00\x20\x01\x06FooBar");

        let data = create_add_channel_response(2, b"Hello", ENCODING_DELTA, true);
        assert_eq!(data, b"\x82\x09\x00\x31\x02\x05Hello");
    }

    #[test]
    fn test_create_drop_channel() {
        let data = create_drop_channel(1, None, "");
        assert_eq!(data, b"\x82\x04\x00\x60\x01\x00");

        let data = create_drop_channel(1, Some(DropCode::NormalClosure), "Success");
        assert_eq!(data, b"\x82\x0d\x00\x70\x01\x09\x03\xe8Success");
    }

    #[test]
    fn test_create_flow_control() {
        let data = create_flow_control(2, 6);
        assert_eq!(data, b"\x82\x04\x00\x40\x02\x06");
    }

    #[test]
    fn test_create_new_channel_slot() {
        let data = create_new_channel_slot(64, 8192);
        assert_eq!(data, b"\x82\x06\x00\x80\x40\x7e\x20\x00");
    }

    #[test]
    fn test_parse_encoded_handshake() {
        let parsed = parse_encoded_handshake(
            b"GET /echo HTTP/1.1\r\n\
              Host: server.example.com\r\n\
              Origin: http://example.com\r\n\
              \r\n",
        )
        .unwrap();
        assert_eq!(parsed.method, "GET");
        assert_eq!(parsed.uri, "/echo");
        assert_eq!(
            parsed.headers.get("host"),
            Some(&"server.example.com".to_string())
        );
        assert_eq!(
            parsed.headers.get("origin"),
            Some(&"http://example.com".to_string())
        );

        // Missing the final blank line.
        let result = parse_encoded_handshake(b"GET /echo HTTP/1.1");
        assert!(matches!(result, Err(Error::IncompleteHTTPRequest)));
    }

    #[test]
    fn test_apply_delta() {
        let base = parse_encoded_handshake(
            b"GET /echo HTTP/1.1\r\n\
              Host: server.example.com\r\n\
              Sec-WebSocket-Protocol: x-foo\r\n\
              \r\n",
        )
        .unwrap();

        // An empty delta keeps every base header.
        let delta = parse_encoded_handshake(b"GET /chat HTTP/1.1\r\n\r\n").unwrap();
        let resolved = base.apply_delta(&delta);
        assert_eq!(resolved.uri, "/chat");
        assert_eq!(
            resolved.headers.get("sec-websocket-protocol"),
            Some(&"x-foo".to_string())
        );

        // A non-empty value overrides the base's.
        let delta = parse_encoded_handshake(
            b"GET /echo HTTP/1.1\r\nSec-WebSocket-Protocol: x-bar\r\n\r\n",
        )
        .unwrap();
        let resolved = base.apply_delta(&delta);
        assert_eq!(
            resolved.headers.get("sec-websocket-protocol"),
            Some(&"x-bar".to_string())
        );

        // An empty value removes the header from the base.
        let delta =
            parse_encoded_handshake(b"GET /echo HTTP/1.1\r\nSec-WebSocket-Protocol:\r\n\r\n")
                .unwrap();
        let resolved = base.apply_delta(&delta);
        assert_eq!(resolved.headers.get("sec-websocket-protocol"), None);
    }

    #[test]
    fn test_generate_websocket_accept_value() {
        assert_eq!(
            generate_websocket_accept_value("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    // ---- multiplexing handler tests over a mock physical connection ----

    struct MockPhysicalRead {
        frames: Receiver<Frame>,
    }

    #[async_trait]
    impl PhysicalRead for MockPhysicalRead {
        async fn receive_frame(&mut self) -> Result<Frame, Error> {
            self.frames.recv().await.ok_or(Error::ConnectionTerminated)
        }
    }

    struct MockPhysicalWrite {
        written: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    #[async_trait]
    impl PhysicalWrite for MockPhysicalWrite {
        async fn write(&mut self, data: &[u8]) -> Result<(), Error> {
            self.written.lock().unwrap().push(data.to_vec());
            Ok(())
        }
    }

    /// Everything the server wrote to the physical connection, decoded.
    struct WrittenLog {
        control_blocks: Vec<ControlBlock>,
        inner_frames: HashMap<ChannelId, Vec<InnerFrame>>,
        server_close_code: Option<u16>,
    }

    impl WrittenLog {
        fn decode(written: &Arc<Mutex<Vec<Vec<u8>>>>) -> Self {
            let mut log = WrittenLog {
                control_blocks: Vec::new(),
                inner_frames: HashMap::new(),
                server_close_code: None,
            };

            for frame in written.lock().unwrap().iter() {
                let opcode = frame[0] & 0x0f;
                let mut offset = 2;
                let mut length = (frame[1] & 0x7f) as usize;
                if length == 126 {
                    length = u16::from_be_bytes([frame[2], frame[3]]) as usize;
                    offset = 4;
                } else if length == 127 {
                    let mut bytes = [0u8; 8];
                    bytes.copy_from_slice(&frame[2..10]);
                    length = u64::from_be_bytes(bytes) as usize;
                    offset = 10;
                }
                let payload = &frame[offset..offset + length];

                if opcode == OpCode::Close.as_u8() {
                    if payload.len() >= 2 {
                        log.server_close_code =
                            Some(u16::from_be_bytes([payload[0], payload[1]]));
                    }
                    continue;
                }
                if opcode != OpCode::Binary.as_u8() {
                    continue;
                }

                let mut parser = MuxFrameParser::new(payload);
                let channel_id = parser.read_channel_id().unwrap();
                if channel_id == 0 {
                    log.control_blocks
                        .extend(parser.read_control_blocks().unwrap());
                } else {
                    let inner = parser.read_inner_frame().unwrap();
                    log.inner_frames.entry(channel_id).or_default().push(inner);
                }
            }

            log
        }

        fn messages(&self, channel_id: ChannelId) -> Vec<Vec<u8>> {
            self.inner_frames
                .get(&channel_id)
                .map(|frames| {
                    frames
                        .iter()
                        .filter(|inner| {
                            inner.opcode == OpCode::Binary.as_u8()
                                || inner.opcode == OpCode::Text.as_u8()
                        })
                        .map(|inner| inner.payload.clone())
                        .collect()
                })
                .unwrap_or_default()
        }

        fn control_messages(&self, channel_id: ChannelId) -> Vec<(u8, Vec<u8>)> {
            self.inner_frames
                .get(&channel_id)
                .map(|frames| {
                    frames
                        .iter()
                        .filter(|inner| OpCode::from(inner.opcode).unwrap().is_control())
                        .map(|inner| (inner.opcode, inner.payload.clone()))
                        .collect()
                })
                .unwrap_or_default()
        }

        fn drop_channel(&self, channel_id: ChannelId) -> Option<(Option<u16>, String)> {
            self.control_blocks.iter().find_map(|block| match block {
                ControlBlock::DropChannel {
                    channel_id: id,
                    drop_code,
                    drop_message,
                    ..
                } if *id == channel_id => Some((*drop_code, drop_message.clone())),
                _ => None,
            })
        }

        fn add_channel_response(&self, channel_id: ChannelId) -> Option<(bool, Vec<u8>)> {
            self.control_blocks.iter().find_map(|block| match block {
                ControlBlock::AddChannelResponse {
                    channel_id: id,
                    rejected,
                    encoded_handshake,
                    ..
                } if *id == channel_id => Some((*rejected, encoded_handshake.clone())),
                _ => None,
            })
        }

        fn flow_controls(&self, channel_id: ChannelId) -> Vec<u64> {
            self.control_blocks
                .iter()
                .filter_map(|block| match block {
                    ControlBlock::FlowControl {
                        channel_id: id,
                        send_quota,
                    } if *id == channel_id => Some(*send_quota),
                    _ => None,
                })
                .collect()
        }
    }

    /// Echoes messages until "Goodbye"; a `/ping` resource sends one ping and
    /// returns. The first offered subprotocol is always selected.
    struct TestDispatcher;

    #[async_trait]
    impl Dispatcher for TestDispatcher {
        async fn do_extra_handshake(&self, request: &LogicalRequest) -> Result<(), Error> {
            if let Some(protocol) = request.requested_protocols().first() {
                request.select_subprotocol(protocol.clone());
            }
            Ok(())
        }

        async fn transfer_data(
            &self,
            request: Arc<LogicalRequest>,
            stream: &mut LogicalStream,
        ) -> Result<(), Error> {
            if request.uri.ends_with("ping") {
                stream.send_ping(b"Ping!".to_vec()).await?;
            } else {
                loop {
                    match stream.receive_message().await? {
                        Some(message) => {
                            if message.as_binary() == b"Goodbye" {
                                break;
                            }
                            stream.send_message(message).await?;
                        }
                        None => break,
                    }
                }
            }
            stream.close_connection();
            Ok(())
        }
    }

    fn physical_handshake() -> ParsedRequest {
        let mut headers = HashMap::new();
        headers.insert("host".to_string(), "server.example.com".to_string());
        headers.insert("upgrade".to_string(), "websocket".to_string());
        headers.insert("connection".to_string(), "Upgrade".to_string());
        headers.insert(
            "sec-websocket-key".to_string(),
            "dGhlIHNhbXBsZSBub25jZQ==".to_string(),
        );
        headers.insert("sec-websocket-version".to_string(), "13".to_string());
        headers.insert("origin".to_string(), "http://example.com".to_string());
        ParsedRequest::new("GET".to_string(), "/echo".to_string(), headers)
    }

    async fn start_mux() -> (Arc<MuxHandler>, Sender<Frame>, Arc<Mutex<Vec<Vec<u8>>>>) {
        init_logs();
        let (frame_tx, frame_rx) = channel(64);
        let written = Arc::new(Mutex::new(Vec::new()));
        let handler = MuxHandler::new(
            physical_handshake(),
            Arc::new(TestDispatcher),
            Box::new(MockPhysicalRead { frames: frame_rx }),
            Box::new(MockPhysicalWrite {
                written: Arc::clone(&written),
            }),
            MuxConfig::default(),
        );
        handler.start().await.unwrap();
        (handler, frame_tx, written)
    }

    fn request_header(path: &str) -> Vec<u8> {
        format!(
            "GET {} HTTP/1.1\r\n\
             Host: server.example.com\r\n\
             Origin: http://example.com\r\n\
             \r\n",
            path
        )
        .into_bytes()
    }

    fn add_channel_request_frame(
        channel_id: ChannelId,
        encoding: u8,
        encoded_handshake: &[u8],
    ) -> Frame {
        let mut payload = encode_channel_id(0);
        payload.push(encoding & 0x3);
        payload.extend_from_slice(&encode_channel_id(channel_id));
        payload.extend_from_slice(&encode_number(encoded_handshake.len() as u64));
        payload.extend_from_slice(encoded_handshake);
        Frame::new(true, OpCode::Binary, payload)
    }

    fn flow_control_frame(channel_id: ChannelId, quota: u64) -> Frame {
        let mut payload = encode_channel_id(0);
        payload.push(2 << 5);
        payload.extend_from_slice(&encode_channel_id(channel_id));
        payload.extend_from_slice(&encode_number(quota));
        Frame::new(true, OpCode::Binary, payload)
    }

    fn drop_channel_frame(channel_id: ChannelId) -> Frame {
        let mut payload = encode_channel_id(0);
        payload.push(3 << 5);
        payload.extend_from_slice(&encode_channel_id(channel_id));
        payload.push(0);
        Frame::new(true, OpCode::Binary, payload)
    }

    fn logical_frame(channel_id: ChannelId, opcode: &OpCode, data: &[u8]) -> Frame {
        let mut payload = encode_channel_id(channel_id);
        payload.push(0x80 | opcode.as_u8());
        payload.extend_from_slice(data);
        Frame::new(true, OpCode::Binary, payload)
    }

    fn binary_frame(channel_id: ChannelId, data: &[u8]) -> Frame {
        logical_frame(channel_id, &OpCode::Binary, data)
    }

    #[tokio::test]
    async fn test_echo_on_two_interleaved_channels() {
        let (handler, frames, written) = start_mux().await;
        handler.add_channel_slots(64, 8192).await.unwrap();

        frames
            .send(add_channel_request_frame(2, 0, &request_header("/echo")))
            .await
            .unwrap();
        frames.send(flow_control_frame(2, 6)).await.unwrap();
        frames
            .send(add_channel_request_frame(3, 0, &request_header("/echo")))
            .await
            .unwrap();
        frames.send(flow_control_frame(3, 6)).await.unwrap();

        frames.send(binary_frame(2, b"Hello")).await.unwrap();
        frames.send(binary_frame(3, b"World")).await.unwrap();
        frames.send(binary_frame(1, b"Goodbye")).await.unwrap();
        frames.send(binary_frame(2, b"Goodbye")).await.unwrap();
        frames.send(binary_frame(3, b"Goodbye")).await.unwrap();

        assert!(handler.wait_until_done(Duration::from_secs(2)).await);

        let log = WrittenLog::decode(&written);
        assert_eq!(log.add_channel_response(2).unwrap().0, false);
        assert_eq!(log.add_channel_response(3).unwrap().0, false);
        assert_eq!(log.messages(1), Vec::<Vec<u8>>::new());
        assert_eq!(log.messages(2), vec![b"Hello".to_vec()]);
        assert_eq!(log.messages(3), vec![b"World".to_vec()]);

        // Replenishment for 'Hello' + the per-message extra cost.
        assert_eq!(log.flow_controls(2), vec![6, 8]);

        // One NewChannelSlot, two AddChannelResponses, and six FlowControls:
        // the default channel's initial grant plus one per received message.
        assert_eq!(log.control_blocks.len(), 9);
    }

    #[tokio::test]
    async fn test_quota_violation_by_client() {
        let (handler, frames, written) = start_mux().await;
        handler.add_channel_slots(64, 0).await.unwrap();

        frames
            .send(add_channel_request_frame(2, 0, &request_header("/echo")))
            .await
            .unwrap();
        frames.send(binary_frame(2, b"HelloWorld")).await.unwrap();
        frames.send(binary_frame(1, b"Goodbye")).await.unwrap();

        assert!(handler.wait_until_done(Duration::from_secs(2)).await);

        let log = WrittenLog::decode(&written);
        let (code, _) = log.drop_channel(2).unwrap();
        assert_eq!(code, Some(DropCode::SendQuotaViolation.as_u16()));
        // Nothing is echoed on the violating channel; the default channel
        // kept working.
        assert_eq!(log.messages(2), Vec::<Vec<u8>>::new());
        assert!(log.server_close_code.is_none());
    }

    #[tokio::test]
    async fn test_empty_message_consumes_extra_cost() {
        let (handler, frames, written) = start_mux().await;
        // The client may send one byte in total.
        handler.add_channel_slots(64, 1).await.unwrap();

        frames
            .send(add_channel_request_frame(2, 0, &request_header("/echo")))
            .await
            .unwrap();
        frames.send(flow_control_frame(2, 2)).await.unwrap();
        // An empty message still costs one byte and gets one byte replenished.
        frames.send(binary_frame(2, b"")).await.unwrap();
        frames.send(binary_frame(1, b"Goodbye")).await.unwrap();
        // This message violates the quota on channel 2.
        frames.send(binary_frame(2, b"Goodbye")).await.unwrap();

        assert!(handler.wait_until_done(Duration::from_secs(2)).await);

        let log = WrittenLog::decode(&written);
        // One byte is replenished even though the message was empty.
        assert_eq!(log.flow_controls(2), vec![1]);
        let (code, _) = log.drop_channel(2).unwrap();
        assert_eq!(code, Some(DropCode::SendQuotaViolation.as_u16()));
    }

    #[tokio::test]
    async fn test_channel_slot_violation() {
        let (handler, frames, written) = start_mux().await;
        handler.add_channel_slots(1, 8192).await.unwrap();

        frames
            .send(add_channel_request_frame(2, 0, &request_header("/echo")))
            .await
            .unwrap();
        frames.send(flow_control_frame(2, 6)).await.unwrap();
        frames.send(binary_frame(2, b"Hello")).await.unwrap();

        // The only slot is taken; this request must be turned down.
        frames
            .send(add_channel_request_frame(3, 0, &request_header("/echo")))
            .await
            .unwrap();
        frames.send(binary_frame(3, b"Hello")).await.unwrap();

        frames.send(binary_frame(1, b"Goodbye")).await.unwrap();
        frames.send(binary_frame(2, b"Goodbye")).await.unwrap();

        assert!(handler.wait_until_done(Duration::from_secs(2)).await);

        let log = WrittenLog::decode(&written);
        assert_eq!(log.messages(2), vec![b"Hello".to_vec()]);
        let (code, _) = log.drop_channel(3).unwrap();
        assert_eq!(code, Some(DropCode::NewChannelSlotViolation.as_u16()));
        assert!(log.add_channel_response(3).is_none());
        assert!(log.server_close_code.is_none());
    }

    #[tokio::test]
    async fn test_unknown_request_encoding() {
        let (handler, frames, written) = start_mux().await;
        handler.add_channel_slots(64, 8192).await.unwrap();

        frames
            .send(add_channel_request_frame(2, 3, &request_header("/echo")))
            .await
            .unwrap();

        assert!(handler.wait_until_done(Duration::from_secs(2)).await);

        let log = WrittenLog::decode(&written);
        let (code, _) = log.drop_channel(2).unwrap();
        assert_eq!(code, Some(DropCode::UnknownRequestEncoding.as_u16()));
        assert_eq!(log.server_close_code, Some(STATUS_INTERNAL_ENDPOINT_ERROR));
    }

    #[tokio::test]
    async fn test_duplicate_channel_id() {
        let (handler, frames, written) = start_mux().await;
        handler.add_channel_slots(64, 8192).await.unwrap();

        frames
            .send(add_channel_request_frame(2, 0, &request_header("/echo")))
            .await
            .unwrap();
        frames
            .send(add_channel_request_frame(2, 0, &request_header("/echo")))
            .await
            .unwrap();

        assert!(handler.wait_until_done(Duration::from_secs(2)).await);

        let log = WrittenLog::decode(&written);
        let (code, _) = log.drop_channel(2).unwrap();
        assert_eq!(code, Some(DropCode::ChannelAlreadyExists.as_u16()));
        assert_eq!(log.server_close_code, Some(STATUS_INTERNAL_ENDPOINT_ERROR));
    }

    #[tokio::test]
    async fn test_incomplete_handshake_is_rejected() {
        let (handler, frames, written) = start_mux().await;
        handler.add_channel_slots(64, 8192).await.unwrap();

        frames
            .send(add_channel_request_frame(2, 0, b"GET /echo HTTP/1.1"))
            .await
            .unwrap();
        frames.send(binary_frame(1, b"Goodbye")).await.unwrap();

        assert!(handler.wait_until_done(Duration::from_secs(2)).await);

        let log = WrittenLog::decode(&written);
        let (rejected, response) = log.add_channel_response(2).unwrap();
        assert!(rejected);
        assert!(String::from_utf8(response).unwrap().starts_with("HTTP/1.1 400"));
        assert!(log.server_close_code.is_none());
    }

    #[tokio::test]
    async fn test_receive_drop_channel_is_acknowledged() {
        let (handler, frames, written) = start_mux().await;
        handler.add_channel_slots(64, 8192).await.unwrap();

        frames
            .send(add_channel_request_frame(2, 0, &request_header("/echo")))
            .await
            .unwrap();
        frames.send(drop_channel_frame(2)).await.unwrap();
        frames.send(binary_frame(1, b"Goodbye")).await.unwrap();

        assert!(handler.wait_until_done(Duration::from_secs(2)).await);

        let log = WrittenLog::decode(&written);
        let (code, _) = log.drop_channel(2).unwrap();
        assert_eq!(code, Some(DropCode::Acknowledged.as_u16()));
    }

    #[tokio::test]
    async fn test_graceful_logical_close() {
        let (handler, frames, written) = start_mux().await;
        handler.add_channel_slots(64, 8192).await.unwrap();

        frames
            .send(add_channel_request_frame(2, 0, &request_header("/echo")))
            .await
            .unwrap();
        let close_body = STATUS_NORMAL_CLOSURE.to_be_bytes().to_vec();
        frames
            .send(logical_frame(2, &OpCode::Close, &close_body))
            .await
            .unwrap();
        frames.send(binary_frame(1, b"Goodbye")).await.unwrap();

        assert!(handler.wait_until_done(Duration::from_secs(2)).await);

        let log = WrittenLog::decode(&written);
        // The closing handshake is answered even with no granted quota, and
        // the teardown is acknowledged.
        let control = log.control_messages(2);
        assert_eq!(control.len(), 1);
        assert_eq!(control[0].0, OpCode::Close.as_u8());
        assert_eq!(control[0].1, close_body);
        let (code, _) = log.drop_channel(2).unwrap();
        assert_eq!(code, Some(DropCode::Acknowledged.as_u16()));
    }

    #[tokio::test]
    async fn test_delta_encoded_handshakes() {
        let (handler, frames, written) = start_mux().await;
        handler.add_channel_slots(64, 8192).await.unwrap();

        // Identity request carrying a subprotocol; it becomes the delta base.
        let with_protocol = b"GET /echo HTTP/1.1\r\n\
            Host: server.example.com\r\n\
            Sec-WebSocket-Protocol: x-foo\r\n\
            Origin: http://example.com\r\n\
            \r\n";
        frames
            .send(add_channel_request_frame(2, 0, with_protocol))
            .await
            .unwrap();

        // A delta removing the subprotocol header.
        frames
            .send(add_channel_request_frame(
                3,
                1,
                b"GET /echo HTTP/1.1\r\nSec-WebSocket-Protocol:\r\n\r\n",
            ))
            .await
            .unwrap();

        // A plain delta inherits the base's subprotocol.
        frames
            .send(add_channel_request_frame(4, 1, b"GET /echo HTTP/1.1\r\n\r\n"))
            .await
            .unwrap();

        for channel_id in [1, 2, 3, 4] {
            frames.send(binary_frame(channel_id, b"Goodbye")).await.unwrap();
        }

        assert!(handler.wait_until_done(Duration::from_secs(2)).await);

        let log = WrittenLog::decode(&written);
        let response_2 = String::from_utf8(log.add_channel_response(2).unwrap().1).unwrap();
        let response_3 = String::from_utf8(log.add_channel_response(3).unwrap().1).unwrap();
        let response_4 = String::from_utf8(log.add_channel_response(4).unwrap().1).unwrap();
        assert!(response_2.contains("Sec-WebSocket-Protocol: x-foo"));
        assert!(!response_3.contains("Sec-WebSocket-Protocol"));
        assert!(response_4.contains("Sec-WebSocket-Protocol: x-foo"));
    }

    #[tokio::test]
    async fn test_logical_ping_and_pong() {
        let (handler, frames, written) = start_mux().await;
        handler.add_channel_slots(64, 8192).await.unwrap();

        // The /ping handler needs 6 bytes of budget, granted in pieces.
        frames
            .send(add_channel_request_frame(2, 0, &request_header("/ping")))
            .await
            .unwrap();
        frames.send(flow_control_frame(2, 1)).await.unwrap();
        frames.send(flow_control_frame(2, 2)).await.unwrap();
        frames.send(flow_control_frame(2, 3)).await.unwrap();

        // An echo channel answers a client ping with a pong.
        frames
            .send(add_channel_request_frame(3, 0, &request_header("/echo")))
            .await
            .unwrap();
        frames.send(flow_control_frame(3, 13)).await.unwrap();
        frames
            .send(logical_frame(3, &OpCode::Ping, b"Hello World!"))
            .await
            .unwrap();

        frames.send(binary_frame(1, b"Goodbye")).await.unwrap();
        frames.send(binary_frame(3, b"Goodbye")).await.unwrap();

        assert!(handler.wait_until_done(Duration::from_secs(2)).await);

        let log = WrittenLog::decode(&written);
        let pings = log.control_messages(2);
        assert_eq!(pings, vec![(OpCode::Ping.as_u8(), b"Ping!".to_vec())]);
        let pongs = log.control_messages(3);
        assert_eq!(pongs, vec![(OpCode::Pong.as_u8(), b"Hello World!".to_vec())]);
    }

    #[tokio::test]
    async fn test_wait_until_done_times_out() {
        let (handler, _frames, _written) = start_mux().await;
        // The default channel's worker is still waiting for messages.
        assert!(!handler.wait_until_done(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn test_physical_termination_unblocks_workers() {
        let (handler, frames, written) = start_mux().await;
        handler.add_channel_slots(64, 8192).await.unwrap();

        frames
            .send(add_channel_request_frame(2, 0, &request_header("/echo")))
            .await
            .unwrap();
        // Close the physical connection while channel workers are blocked.
        drop(frames);

        assert!(handler.wait_until_done(Duration::from_secs(2)).await);

        let log = WrittenLog::decode(&written);
        assert_eq!(log.add_channel_response(2).unwrap().0, false);
    }

    #[tokio::test]
    async fn test_text_outer_frame_is_fatal() {
        let (handler, frames, written) = start_mux().await;

        frames
            .send(Frame::new(true, OpCode::Text, b"\x00\x01".to_vec()))
            .await
            .unwrap();

        assert!(handler.wait_until_done(Duration::from_secs(2)).await);

        let log = WrittenLog::decode(&written);
        let (code, _) = log.drop_channel(0).unwrap();
        assert_eq!(code, Some(DropCode::InvalidEncapsulatingMessage.as_u16()));
        assert_eq!(log.server_close_code, Some(STATUS_INTERNAL_ENDPOINT_ERROR));
    }

    #[tokio::test]
    async fn test_truncated_channel_id_is_fatal() {
        let (handler, frames, written) = start_mux().await;

        // The last byte of the channel id is missing.
        frames
            .send(Frame::new(true, OpCode::Binary, b"\x80".to_vec()))
            .await
            .unwrap();

        assert!(handler.wait_until_done(Duration::from_secs(2)).await);

        let log = WrittenLog::decode(&written);
        let (code, _) = log.drop_channel(0).unwrap();
        assert_eq!(code, Some(DropCode::ChannelIdTruncated.as_u16()));
        assert_eq!(log.server_close_code, Some(STATUS_INTERNAL_ENDPOINT_ERROR));
    }

    #[tokio::test]
    async fn test_truncated_inner_frame_is_fatal() {
        let (handler, frames, written) = start_mux().await;

        // Just the channel id, no encapsulated frame.
        frames
            .send(Frame::new(true, OpCode::Binary, b"\x01".to_vec()))
            .await
            .unwrap();

        assert!(handler.wait_until_done(Duration::from_secs(2)).await);

        let log = WrittenLog::decode(&written);
        let (code, _) = log.drop_channel(0).unwrap();
        assert_eq!(
            code,
            Some(DropCode::EncapsulatedFrameIsTruncated.as_u16())
        );
        assert_eq!(log.server_close_code, Some(STATUS_INTERNAL_ENDPOINT_ERROR));
    }

    #[tokio::test]
    async fn test_frame_reader_unmasks_client_frames() {
        use crate::physical::FrameReader;

        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = FrameReader::new(server, MuxConfig::default());

        // A masked binary frame carrying "Hi".
        let mask = [0x11u8, 0x22, 0x33, 0x44];
        let mut frame = vec![0x82, 0x80 | 2];
        frame.extend_from_slice(&mask);
        frame.push(b'H' ^ mask[0]);
        frame.push(b'i' ^ mask[1]);
        tokio::io::AsyncWriteExt::write_all(&mut client, &frame)
            .await
            .unwrap();

        let received = reader.receive_frame().await.unwrap();
        assert_eq!(received.opcode, OpCode::Binary);
        assert_eq!(received.payload, b"Hi");

        // Closing the client side ends the physical connection.
        drop(client);
        assert!(matches!(
            reader.receive_frame().await,
            Err(Error::ConnectionTerminated)
        ));
    }
}
