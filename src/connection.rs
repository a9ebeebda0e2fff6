use crate::codec::{ChannelId, CONTROL_CHANNEL_ID};
use crate::error::Error;
use crate::writer::OutgoingData;
use bytes::BytesMut;
use log::warn;
use tokio::sync::mpsc::Sender;
use tokio::sync::{Mutex, Notify};

/// Read-side state of a logical connection. Transitions are monotonic:
/// Active may move to either closed state, GracefullyClosed may still move to
/// Terminated, and Terminated is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    Active,
    GracefullyClosed,
    Terminated,
}

struct ConnectionInner {
    incoming: BytesMut,
    read_state: ReadState,
    waiting_write_completion: bool,
    send_quota: u64,
}

/// The per-channel I/O surface handed to workers. Inbound bytes are appended
/// by the reader task and consumed here; outbound frames are serialized
/// through the shared writer task, one write in flight at a time.
pub struct LogicalConnection {
    channel_id: ChannelId,
    inner: Mutex<ConnectionInner>,
    read_ready: Notify,
    write_done: Notify,
    quota_replenished: Notify,
    writer_tx: Sender<OutgoingData>,
}

impl LogicalConnection {
    pub(crate) fn new(channel_id: ChannelId, writer_tx: Sender<OutgoingData>) -> Self {
        Self {
            channel_id,
            inner: Mutex::new(ConnectionInner {
                incoming: BytesMut::new(),
                read_state: ReadState::Active,
                waiting_write_completion: false,
                send_quota: 0,
            }),
            read_ready: Notify::new(),
            write_done: Notify::new(),
            quota_replenished: Notify::new(),
            writer_tx,
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    /// Hands a complete physical frame to the writer task and suspends until
    /// the writer reports the write done. Only one write may be in flight per
    /// logical connection.
    pub async fn write(&self, data: Vec<u8>) -> Result<(), Error> {
        {
            let mut inner = self.inner.lock().await;
            if inner.waiting_write_completion {
                return Err(Error::WriteAlreadyInFlight);
            }
            inner.waiting_write_completion = true;
        }

        if self
            .writer_tx
            .send(OutgoingData {
                channel_id: self.channel_id,
                data,
            })
            .await
            .is_err()
        {
            let mut inner = self.inner.lock().await;
            inner.waiting_write_completion = false;
            return Err(Error::CommunicationError);
        }

        loop {
            {
                let mut inner = self.inner.lock().await;
                if !inner.waiting_write_completion {
                    return Ok(());
                }
                if inner.read_state == ReadState::Terminated {
                    inner.waiting_write_completion = false;
                    return Err(Error::ConnectionTerminated);
                }
            }
            self.write_done.notified().await;
        }
    }

    /// Writes via the control channel. Control data is always shortest-path:
    /// the caller is not suspended until the physical write happens.
    pub async fn write_control_data(&self, data: Vec<u8>) -> Result<(), Error> {
        self.writer_tx
            .send(OutgoingData {
                channel_id: CONTROL_CHANNEL_ID,
                data,
            })
            .await
            .map_err(|_| Error::CommunicationError)
    }

    /// Called through the handler when the writer finished this connection's
    /// in-flight write.
    pub async fn notify_write_done(&self) {
        let mut inner = self.inner.lock().await;
        if !inner.waiting_write_completion {
            warn!(
                "unexpected write completion for logical connection {}",
                self.channel_id
            );
            return;
        }
        inner.waiting_write_completion = false;
        self.write_done.notify_one();
    }

    /// Appends incoming frame data and wakes a blocked read. Invoked only by
    /// the multiplexing handler after quota accounting.
    pub async fn append_frame_data(&self, data: &[u8]) {
        let mut inner = self.inner.lock().await;
        inner.incoming.extend_from_slice(data);
        self.read_ready.notify_one();
    }

    /// Reads exactly `length` bytes, suspending until they arrived over the
    /// physical connection or the channel left the Active state.
    pub async fn read(&self, length: usize) -> Result<Vec<u8>, Error> {
        loop {
            {
                let mut inner = self.inner.lock().await;
                match inner.read_state {
                    ReadState::Active => {
                        if inner.incoming.len() >= length {
                            return Ok(inner.incoming.split_to(length).to_vec());
                        }
                    }
                    ReadState::GracefullyClosed => return Err(Error::LogicalConnectionClosed),
                    ReadState::Terminated => return Err(Error::ConnectionTerminated),
                }
            }
            self.read_ready.notified().await;
        }
    }

    pub async fn read_state(&self) -> ReadState {
        self.inner.lock().await.read_state
    }

    /// Moves the read state forward and wakes everything that may be blocked
    /// on this connection. Backward transitions are ignored.
    pub async fn set_read_state(&self, new_state: ReadState) {
        let mut inner = self.inner.lock().await;
        let allowed = match (inner.read_state, new_state) {
            (ReadState::Active, ReadState::GracefullyClosed) => true,
            (_, ReadState::Terminated) => inner.read_state != ReadState::Terminated,
            _ => false,
        };
        if allowed {
            inner.read_state = new_state;
        }
        self.read_ready.notify_one();
        self.write_done.notify_one();
        self.quota_replenished.notify_one();
    }

    /// Takes `amount` bytes out of the channel's send budget, suspending
    /// until the client replenished enough via FlowControl. Termination of
    /// the channel unblocks the caller with an error.
    pub async fn consume_send_quota(&self, amount: u64) -> Result<(), Error> {
        loop {
            {
                let mut inner = self.inner.lock().await;
                if inner.read_state == ReadState::Terminated {
                    return Err(Error::ConnectionTerminated);
                }
                if inner.send_quota >= amount {
                    inner.send_quota -= amount;
                    return Ok(());
                }
            }
            self.quota_replenished.notified().await;
        }
    }

    pub async fn replenish_send_quota(&self, amount: u64) {
        let mut inner = self.inner.lock().await;
        inner.send_quota = inner.send_quota.saturating_add(amount);
        self.quota_replenished.notify_one();
    }

    pub async fn send_quota(&self) -> u64 {
        self.inner.lock().await.send_quota
    }
}
