use crate::codec::{ChannelId, CONTROL_CHANNEL_ID};
use crate::handler::MuxHandler;
use crate::physical::PhysicalWrite;
use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;

/// One item of the outbound queue: a complete physical frame and the logical
/// channel it came from, so the writer can report completion back.
pub(crate) struct OutgoingData {
    pub channel_id: ChannelId,
    pub data: Vec<u8>,
}

/// The single task owning the write side of the physical connection. All
/// physical writes are serialized here; each queue item is a complete frame,
/// so frames from different channels never interleave mid-byte.
///
/// The queue closes when the handler and every logical connection dropped
/// their senders; items already queued are still flushed before the task
/// exits.
pub(crate) async fn run_writer(
    handler: Arc<MuxHandler>,
    mut queue: Receiver<OutgoingData>,
    mut sink: Box<dyn PhysicalWrite>,
) {
    while let Some(outgoing) = queue.recv().await {
        if let Err(err) = sink.write(&outgoing.data).await {
            warn!(
                "failed to write to the physical connection for channel {}: {}",
                outgoing.channel_id, err
            );
            break;
        }

        // Control data is fire-and-forget; only logical channels suspend on
        // write completion.
        if outgoing.channel_id != CONTROL_CHANNEL_ID {
            handler.notify_write_done(outgoing.channel_id).await;
        }
    }

    debug!("physical connection writer finished");
}
