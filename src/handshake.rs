use crate::dispatch::Dispatcher;
use crate::error::Error;
use crate::request::LogicalRequest;
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};
use std::collections::HashMap;

const UUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const HTTP_BAD_REQUEST: u16 = 400;

pub(crate) fn generate_websocket_accept_value(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(UUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

/// A decoded opening handshake: the request line plus headers, with header
/// names lowercased. Doubles as the delta base the next delta-encoded
/// request is resolved against.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub method: String,
    pub uri: String,
    pub headers: HashMap<String, String>,
}

impl ParsedRequest {
    pub fn new(method: String, uri: String, headers: HashMap<String, String>) -> Self {
        Self {
            method,
            uri,
            headers,
        }
    }

    /// Resolves a delta-encoded handshake against this base: the delta's
    /// request line wins, a delta header with a non-empty value replaces the
    /// base's, and one with an empty value removes it.
    pub fn apply_delta(&self, delta: &ParsedRequest) -> ParsedRequest {
        let mut headers = self.headers.clone();
        for (name, value) in &delta.headers {
            if value.is_empty() {
                headers.remove(name);
            } else {
                headers.insert(name.clone(), value.clone());
            }
        }
        ParsedRequest {
            method: delta.method.clone(),
            uri: delta.uri.clone(),
            headers,
        }
    }
}

/// Parses the encoded handshake bytes carried in an AddChannelRequest block
/// as an HTTP/1.1 request line plus header block.
pub fn parse_encoded_handshake(data: &[u8]) -> Result<ParsedRequest, Error> {
    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    let mut request = httparse::Request::new(&mut header_storage);

    match request.parse(data)? {
        httparse::Status::Partial => return Err(Error::IncompleteHTTPRequest),
        httparse::Status::Complete(_) => {}
    }

    if request.version != Some(1) {
        return Err(Error::InvalidHTTPHandshake);
    }

    let method = request.method.ok_or(Error::InvalidHTTPHandshake)?.to_string();
    let uri = request.path.ok_or(Error::InvalidHTTPHandshake)?.to_string();

    let mut headers = HashMap::new();
    for header in request.headers.iter() {
        let value = String::from_utf8(header.value.to_vec())?;
        headers.insert(header.name.to_lowercase(), value.trim().to_string());
    }

    Ok(ParsedRequest::new(method, uri, headers))
}

/// Runs the opening handshake for one logical channel and builds the
/// HTTP/1.1 101 response to be carried in the AddChannelResponse block.
///
/// Encapsulated handshakes are allowed to omit the Upgrade, Connection,
/// Sec-WebSocket-Key and Sec-WebSocket-Version headers (the multiplexing
/// extension strips them); when present they still have to carry the right
/// values. Host is always required.
pub(crate) async fn do_opening_handshake(
    request: &LogicalRequest,
    dispatcher: &dyn Dispatcher,
) -> Result<Vec<u8>, Error> {
    if request.method != "GET" {
        return Err(Error::InvalidHTTPHandshake);
    }
    if request.get_header_value("host").is_none() {
        return Err(Error::NoHostHeaderPresent);
    }
    if let Some(upgrade) = request.get_header_value("upgrade") {
        if !upgrade.to_lowercase().contains("websocket") {
            return Err(Error::NoUpgradeHeaderPresent);
        }
    }
    if let Some(connection) = request.get_header_value("connection") {
        if !connection.to_lowercase().contains("upgrade") {
            return Err(Error::NoConnectionHeaderPresent);
        }
    }
    if let Some(version) = request.get_header_value("sec-websocket-version") {
        if version != "13" {
            return Err(Error::UnsupportedVersion(version));
        }
    }

    // Subprotocol and any application-level vetting happen before the
    // response is built, so the selected protocol can be echoed back.
    dispatcher
        .do_extra_handshake(request)
        .await
        .map_err(|_| Error::HandshakeAborted)?;

    let mut response = String::from(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n",
    );
    if let Some(key) = request.get_header_value("sec-websocket-key") {
        response.push_str(&format!(
            "Sec-WebSocket-Accept: {}\r\n",
            generate_websocket_accept_value(&key)
        ));
    }
    if let Some(protocol) = request.subprotocol() {
        response.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", protocol));
    }
    response.push_str("\r\n");

    Ok(response.into_bytes())
}

/// The error response carried in a rejecting AddChannelResponse.
pub(crate) fn build_rejection_response(status: u16) -> Vec<u8> {
    let message = match status {
        HTTP_BAD_REQUEST => "Bad Request",
        _ => "???",
    };
    format!("HTTP/1.1 {} {}\r\n\r\n", status, message).into_bytes()
}

/// Maps a failed opening handshake onto the HTTP status the client sees.
pub(crate) fn rejection_status(_error: &Error) -> u16 {
    HTTP_BAD_REQUEST
}
