use crate::error::Error;
use crate::request::LogicalRequest;
use crate::stream::LogicalStream;
use async_trait::async_trait;
use std::sync::Arc;

/// The application side of the multiplexer. One implementation serves every
/// logical channel; the handler invokes it with the channel's own request.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Called while the opening handshake of a logical channel is being
    /// processed, before the response is built. The implementation can pick a
    /// subprotocol through [`LogicalRequest::select_subprotocol`] or return an
    /// error to reject the channel.
    async fn do_extra_handshake(&self, request: &LogicalRequest) -> Result<(), Error>;

    /// Runs the application handler for one logical channel to completion.
    /// Returning (with or without an error) tears the channel down.
    async fn transfer_data(
        &self,
        request: Arc<LogicalRequest>,
        stream: &mut LogicalStream,
    ) -> Result<(), Error>;
}
