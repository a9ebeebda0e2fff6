//! Server-side WebSocket multiplexing for the Tokio stack.
//!
//! This library runs many independent, bidirectional WebSocket conversations
//! ("logical channels") over one underlying WebSocket connection, following
//! the multiplexing extension
//! ([draft-ietf-hybi-websocket-multiplexing](https://datatracker.ietf.org/doc/html/draft-ietf-hybi-websocket-multiplexing-03)).
//! Each logical channel gets its own opening handshake, message stream,
//! flow-control budget and closing handshake, while sharing a single TCP
//! connection and one base framing layer.
//!
//! The entry point is [`handler::MuxHandler`]: hand it the physical
//! connection's opening handshake, the split physical stream, and a
//! [`dispatch::Dispatcher`] that runs your application handlers, then call
//! `start()` and `wait_until_done()`.

pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod handler;
pub mod handshake;
pub mod physical;
pub mod request;
pub mod stream;
mod reader;
mod tests;
mod writer;
