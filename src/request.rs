use crate::codec::ChannelId;
use crate::connection::LogicalConnection;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// The request side of one logical channel: the decoded opening handshake
/// plus the connection the worker reads from and writes to.
///
/// Header keys are stored lowercased, the way they come out of the handshake
/// parser.
pub struct LogicalRequest {
    pub channel_id: ChannelId,
    pub method: String,
    pub uri: String,
    pub headers: HashMap<String, String>,
    pub connection: Arc<LogicalConnection>,
    server_terminated: AtomicBool,
    client_terminated: AtomicBool,
    subprotocol: Mutex<Option<String>>,
}

impl LogicalRequest {
    pub fn new(
        channel_id: ChannelId,
        method: String,
        uri: String,
        headers: HashMap<String, String>,
        connection: Arc<LogicalConnection>,
    ) -> Self {
        Self {
            channel_id,
            method,
            uri,
            headers,
            connection,
            server_terminated: AtomicBool::new(false),
            client_terminated: AtomicBool::new(false),
            subprotocol: Mutex::new(None),
        }
    }

    pub fn get_header_value(&self, key: &str) -> Option<String> {
        self.headers.get(&key.to_lowercase()).cloned()
    }

    /// Subprotocols the client offered in Sec-WebSocket-Protocol, in order.
    pub fn requested_protocols(&self) -> Vec<String> {
        self.get_header_value("sec-websocket-protocol")
            .map(|value| {
                value
                    .split(',')
                    .map(|protocol| protocol.trim().to_string())
                    .filter(|protocol| !protocol.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Picks the subprotocol to be echoed in the handshake response. Meant to
    /// be called from `Dispatcher::do_extra_handshake`.
    pub fn select_subprotocol(&self, protocol: String) {
        *self.subprotocol.lock().unwrap() = Some(protocol);
    }

    pub fn subprotocol(&self) -> Option<String> {
        self.subprotocol.lock().unwrap().clone()
    }

    /// Set once this side has sent its closing handshake; no further sends
    /// are attempted afterwards.
    pub fn server_terminated(&self) -> bool {
        self.server_terminated.load(Ordering::SeqCst)
    }

    pub fn set_server_terminated(&self) {
        self.server_terminated.store(true, Ordering::SeqCst);
    }

    /// Set when the client closed the channel, either with an encapsulated
    /// closing handshake or a DropChannel block.
    pub fn client_terminated(&self) -> bool {
        self.client_terminated.load(Ordering::SeqCst)
    }

    pub fn set_client_terminated(&self) {
        self.client_terminated.store(true, Ordering::SeqCst);
    }
}
