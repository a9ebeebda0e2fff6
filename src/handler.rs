use crate::codec::{
    create_add_channel_response, create_drop_channel, create_flow_control, create_new_channel_slot,
    ChannelId, ControlBlock, InnerFrame, MuxFrameParser, CONTROL_CHANNEL_ID, DEFAULT_CHANNEL_ID,
    ENCODING_DELTA, ENCODING_IDENTITY,
};
use crate::config::{ClientSlotPolicy, MuxConfig};
use crate::connection::{LogicalConnection, ReadState};
use crate::dispatch::Dispatcher;
use crate::error::{DropCode, Error};
use crate::frame::{create_close_frame, Frame, STATUS_INTERNAL_ENDPOINT_ERROR};
use crate::handshake::{
    build_rejection_response, do_opening_handshake, parse_encoded_handshake, rejection_status,
    ParsedRequest,
};
use crate::physical::{PhysicalRead, PhysicalWrite};
use crate::reader::run_reader;
use crate::request::LogicalRequest;
use crate::stream::LogicalStream;
use crate::writer::{run_writer, OutgoingData};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

const OUTGOING_QUEUE_CAPACITY: usize = 128;

/// Lifecycle of a channel-table entry. Entries leave the table when their
/// worker reports done, so Terminated only covers the window between a drop
/// and the worker noticing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelPhase {
    Open,
    Terminated,
}

/// Everything the handler tracks for one logical channel.
struct LogicalChannel {
    request: Arc<LogicalRequest>,
    connection: Arc<LogicalConnection>,
    #[allow(dead_code)]
    worker: JoinHandle<()>,
    phase: ChannelPhase,
    /// Bytes the client may still send on this channel. Topped up by our
    /// FlowControl blocks.
    receive_quota: u64,
    /// Payload bytes of the inbound message currently being assembled, for
    /// the per-message replenishment.
    incoming_message_bytes: u64,
}

struct SlotState {
    open_slots: u64,
    per_channel_quota: u64,
}

/// The multiplexing handler: owns the channel table, quotas, the slot
/// budget and the handshake-delta base, and ties the reader task, the writer
/// task and the per-channel workers together.
pub struct MuxHandler {
    dispatcher: Arc<dyn Dispatcher>,
    config: MuxConfig,
    original_handshake: ParsedRequest,
    channels: Mutex<HashMap<ChannelId, LogicalChannel>>,
    /// Signaled every time a worker leaves the channel table.
    worker_done: Notify,
    slot_state: Mutex<SlotState>,
    /// The most recent fully identity-encoded opening handshake, which
    /// delta-encoded AddChannelRequests are resolved against.
    handshake_base: Mutex<ParsedRequest>,
    writer_tx: Mutex<Option<Sender<OutgoingData>>>,
    writer_rx: Mutex<Option<Receiver<OutgoingData>>>,
    writer_handle: Mutex<Option<JoinHandle<()>>>,
    physical: Mutex<Option<(Box<dyn PhysicalRead>, Box<dyn PhysicalWrite>)>>,
}

impl MuxHandler {
    /// Builds a handler over an already-upgraded physical connection.
    /// `original_handshake` is the physical connection's opening handshake;
    /// it seeds both the implicitly opened channel and the delta base.
    pub fn new(
        original_handshake: ParsedRequest,
        dispatcher: Arc<dyn Dispatcher>,
        read: Box<dyn PhysicalRead>,
        write: Box<dyn PhysicalWrite>,
        config: MuxConfig,
    ) -> Arc<Self> {
        let (writer_tx, writer_rx) = channel(OUTGOING_QUEUE_CAPACITY);
        Arc::new(Self {
            dispatcher,
            config,
            handshake_base: Mutex::new(original_handshake.clone()),
            original_handshake,
            channels: Mutex::new(HashMap::new()),
            worker_done: Notify::new(),
            slot_state: Mutex::new(SlotState {
                open_slots: 0,
                per_channel_quota: 0,
            }),
            writer_tx: Mutex::new(Some(writer_tx)),
            writer_rx: Mutex::new(Some(writer_rx)),
            writer_handle: Mutex::new(None),
            physical: Mutex::new(Some((read, write))),
        })
    }

    /// Starts the handler: runs the opening handshake of the implicitly
    /// opened channel, spawns the reader and writer tasks, and publishes the
    /// channel's initial quota to the client.
    pub async fn start(self: &Arc<Self>) -> Result<(), Error> {
        if self.physical.lock().await.is_none() {
            return Err(Error::AlreadyStarted);
        }

        // The implicitly opened channel reuses the physical handshake, with
        // the extensions header cleared: the multiplexing extension does not
        // nest.
        let connection = Arc::new(LogicalConnection::new(
            DEFAULT_CHANNEL_ID,
            self.writer_sender().await?,
        ));
        let mut headers = self.original_handshake.headers.clone();
        headers.insert("sec-websocket-extensions".to_string(), String::new());
        let request = Arc::new(LogicalRequest::new(
            DEFAULT_CHANNEL_ID,
            self.original_handshake.method.clone(),
            self.original_handshake.uri.clone(),
            headers,
            Arc::clone(&connection),
        ));

        // No AddChannelResponse is sent for the default channel; its
        // handshake already happened on the physical connection. Nothing has
        // been spawned yet, so a rejection here leaves no task behind and
        // the physical socket stays with the caller.
        do_opening_handshake(&request, &*self.dispatcher).await?;

        let (read, write) = self
            .physical
            .lock()
            .await
            .take()
            .ok_or(Error::AlreadyStarted)?;
        let writer_rx = self
            .writer_rx
            .lock()
            .await
            .take()
            .ok_or(Error::AlreadyStarted)?;

        *self.writer_handle.lock().await = Some(tokio::spawn(run_writer(
            Arc::clone(self),
            writer_rx,
            write,
        )));
        tokio::spawn(run_reader(Arc::clone(self), read));

        let quota = self.config.default_channel_quota;
        self.add_logical_channel(request, connection, quota).await?;
        self.send_control_data(create_flow_control(DEFAULT_CHANNEL_ID, quota))
            .await?;

        Ok(())
    }

    /// Grants the client `slots` additional channels, each starting with
    /// `send_quota` bytes of budget, and announces the grant on the wire.
    pub async fn add_channel_slots(&self, slots: u64, send_quota: u64) -> Result<(), Error> {
        {
            let mut slot_state = self.slot_state.lock().await;
            slot_state.open_slots += slots;
            slot_state.per_channel_quota = send_quota;
        }
        self.send_control_data(create_new_channel_slot(slots, send_quota))
            .await
    }

    /// Waits until every worker finished and the channel table drained.
    /// Returns false when `wait_timeout` elapses first; on success the writer
    /// queue is flushed before returning.
    pub async fn wait_until_done(&self, wait_timeout: Duration) -> bool {
        loop {
            let notified = self.worker_done.notified();
            let remaining = self.channels.lock().await.len();
            if remaining == 0 {
                break;
            }
            debug!("waiting workers ({})...", remaining);
            if timeout(wait_timeout, notified).await.is_err() {
                debug!("waiting worker(s) timed out");
                return false;
            }
        }

        self.stop_writer().await;
        true
    }

    async fn stop_writer(&self) {
        // Dropping the handler's sender lets the writer drain whatever the
        // dying connections left queued and then exit.
        self.writer_tx.lock().await.take();
        let handle = self.writer_handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn writer_sender(&self) -> Result<Sender<OutgoingData>, Error> {
        self.writer_tx
            .lock()
            .await
            .clone()
            .ok_or(Error::CommunicationError)
    }

    /// Enqueues data for a logical channel. The writer reports completion
    /// through `notify_write_done`.
    pub async fn send_data(&self, channel_id: ChannelId, data: Vec<u8>) -> Result<(), Error> {
        self.writer_sender()
            .await?
            .send(OutgoingData { channel_id, data })
            .await
            .map_err(|_| Error::CommunicationError)
    }

    /// Enqueues data on the control channel, shortest path and without a
    /// completion wait.
    pub async fn send_control_data(&self, data: Vec<u8>) -> Result<(), Error> {
        self.send_data(CONTROL_CHANNEL_ID, data).await
    }

    pub(crate) async fn send_close_frame(&self, code: u16) -> Result<(), Error> {
        self.send_control_data(create_close_frame(code, "")).await
    }

    /// Called by the writer thread when a write for `channel_id` completed.
    pub async fn notify_write_done(&self, channel_id: ChannelId) {
        let channels = self.channels.lock().await;
        match channels.get(&channel_id) {
            Some(channel) => channel.connection.notify_write_done().await,
            None => debug!("seems that logical channel for {} has gone", channel_id),
        }
    }

    /// Dispatches one physical frame: control blocks for channel 0, an
    /// encapsulated frame for everything else. An error return poisons the
    /// physical connection.
    pub async fn dispatch_frame(self: &Arc<Self>, frame: Frame) -> Result<(), Error> {
        let payload = frame.payload;
        let mut parser = MuxFrameParser::new(&payload);
        let channel_id = parser.read_channel_id()?;

        if channel_id == CONTROL_CHANNEL_ID {
            // Process block by block: earlier blocks in the same frame take
            // effect even when a later one turns out malformed.
            while parser.has_remaining() {
                let block = parser.read_control_block()?;
                self.process_control_block(block).await?;
            }
            return Ok(());
        }

        let inner = parser.read_inner_frame()?;
        self.process_logical_frame(channel_id, inner).await
    }

    async fn process_control_block(self: &Arc<Self>, block: ControlBlock) -> Result<(), Error> {
        match block {
            ControlBlock::AddChannelRequest {
                channel_id,
                encoding,
                encoded_handshake,
            } => {
                self.process_add_channel_request(channel_id, encoding, &encoded_handshake)
                    .await
            }
            ControlBlock::AddChannelResponse { channel_id, .. } => Err(Error::physical(
                DropCode::InvalidMuxControlBlock,
                channel_id,
                "server received an AddChannelResponse",
            )),
            ControlBlock::FlowControl {
                channel_id,
                send_quota,
            } => self.process_flow_control(channel_id, send_quota).await,
            ControlBlock::DropChannel {
                channel_id,
                drop_code,
                drop_message,
                ..
            } => {
                self.process_drop_channel(channel_id, drop_code, &drop_message)
                    .await
            }
            ControlBlock::NewChannelSlot {
                slots, send_quota, ..
            } => match self.config.client_slot_policy {
                ClientSlotPolicy::Reject => Err(Error::physical(
                    DropCode::InvalidMuxControlBlock,
                    0,
                    "NewChannelSlot from the client is not accepted",
                )),
                ClientSlotPolicy::Ignore => {
                    debug!(
                        "ignoring NewChannelSlot from client (slots={}, quota={})",
                        slots, send_quota
                    );
                    Ok(())
                }
            },
        }
    }

    async fn process_add_channel_request(
        self: &Arc<Self>,
        channel_id: ChannelId,
        encoding: u8,
        encoded_handshake: &[u8],
    ) -> Result<(), Error> {
        if channel_id == CONTROL_CHANNEL_ID {
            return Err(Error::physical(
                DropCode::InvalidMuxControlBlock,
                channel_id,
                "AddChannelRequest against the control channel",
            ));
        }

        if encoding != ENCODING_IDENTITY && encoding != ENCODING_DELTA {
            return Err(Error::physical(
                DropCode::UnknownRequestEncoding,
                channel_id,
                "unknown request encoding",
            ));
        }

        if self.channels.lock().await.contains_key(&channel_id) {
            return Err(Error::physical(
                DropCode::ChannelAlreadyExists,
                channel_id,
                "channel id already exists",
            ));
        }

        if self.slot_state.lock().await.open_slots == 0 {
            warn!(
                "rejecting AddChannelRequest for {}: no open channel slots",
                channel_id
            );
            let _ = self
                .send_control_data(create_drop_channel(
                    channel_id,
                    Some(DropCode::NewChannelSlotViolation),
                    "",
                ))
                .await;
            return Ok(());
        }

        // Resolve the encoded handshake into a full request. A delta is
        // applied on top of the most recent identity handshake.
        let parsed = match parse_encoded_handshake(encoded_handshake) {
            Ok(parsed) if encoding == ENCODING_DELTA => {
                self.handshake_base.lock().await.apply_delta(&parsed)
            }
            Ok(parsed) => parsed,
            Err(err) => {
                debug!(
                    "failed to parse encoded handshake for channel {}: {}",
                    channel_id, err
                );
                return self
                    .send_rejecting_response(channel_id, rejection_status(&err))
                    .await;
            }
        };

        let connection = Arc::new(LogicalConnection::new(
            channel_id,
            self.writer_sender().await?,
        ));
        let request = Arc::new(LogicalRequest::new(
            channel_id,
            parsed.method.clone(),
            parsed.uri.clone(),
            parsed.headers.clone(),
            Arc::clone(&connection),
        ));

        match do_opening_handshake(&request, &*self.dispatcher).await {
            Ok(response) => {
                // The accepting response goes out before the channel exists,
                // so no inner frame can ever overtake it.
                self.send_control_data(create_add_channel_response(
                    channel_id,
                    &response,
                    ENCODING_IDENTITY,
                    false,
                ))
                .await?;

                // Only identity-encoded handshakes move the delta base.
                if encoding == ENCODING_IDENTITY {
                    *self.handshake_base.lock().await = parsed;
                }

                let initial_quota = {
                    let mut slot_state = self.slot_state.lock().await;
                    slot_state.open_slots -= 1;
                    slot_state.per_channel_quota
                };
                self.add_logical_channel(request, connection, initial_quota)
                    .await
            }
            Err(err) => {
                debug!("handshake for channel {} rejected: {}", channel_id, err);
                self.send_rejecting_response(channel_id, rejection_status(&err))
                    .await
            }
        }
    }

    async fn send_rejecting_response(
        &self,
        channel_id: ChannelId,
        status: u16,
    ) -> Result<(), Error> {
        self.send_control_data(create_add_channel_response(
            channel_id,
            &build_rejection_response(status),
            ENCODING_IDENTITY,
            true,
        ))
        .await
    }

    async fn process_flow_control(
        &self,
        channel_id: ChannelId,
        send_quota: u64,
    ) -> Result<(), Error> {
        if channel_id == CONTROL_CHANNEL_ID {
            return Err(Error::physical(
                DropCode::InvalidMuxControlBlock,
                channel_id,
                "FlowControl against the control channel",
            ));
        }

        let channels = self.channels.lock().await;
        match channels.get(&channel_id) {
            Some(channel) => {
                channel.connection.replenish_send_quota(send_quota).await;
            }
            None => debug!("FlowControl for unknown channel {}", channel_id),
        }
        Ok(())
    }

    async fn process_drop_channel(
        &self,
        channel_id: ChannelId,
        drop_code: Option<u16>,
        drop_message: &str,
    ) -> Result<(), Error> {
        let mut channels = self.channels.lock().await;
        let Some(channel) = channels.get_mut(&channel_id) else {
            debug!("DropChannel for unknown channel {}", channel_id);
            return Ok(());
        };

        match drop_code.and_then(DropCode::from_u16) {
            Some(code) => debug!(
                "DropChannel received for {}: code={:?} message={:?}",
                channel_id, code, drop_message
            ),
            None => debug!("DropChannel received for {}", channel_id),
        }

        channel.request.set_client_terminated();
        channel.phase = ChannelPhase::Terminated;
        channel.connection.set_read_state(ReadState::Terminated).await;
        Ok(())
    }

    /// Quota accounting and delivery for one encapsulated frame.
    async fn process_logical_frame(
        &self,
        channel_id: ChannelId,
        inner: InnerFrame,
    ) -> Result<(), Error> {
        // The quota bookkeeping happens under the table lock, but nothing
        // that can wake the channel's worker may run before the control
        // block is on the writer queue: once the worker finishes,
        // wait_until_done is free to stop the writer.
        let mut pending_control: Option<Vec<u8>> = None;
        let mut violated: Option<Arc<LogicalConnection>> = None;
        let mut deliver: Option<Arc<LogicalConnection>> = None;

        {
            let mut channels = self.channels.lock().await;
            let Some(channel) = channels.get_mut(&channel_id) else {
                debug!("received data for unknown channel {}", channel_id);
                return Ok(());
            };
            if channel.phase != ChannelPhase::Open {
                debug!("dropping data for closed channel {}", channel_id);
                return Ok(());
            }

            // Every frame consumes its payload size; the final frame of a
            // message consumes the per-message extra cost on top, so even an
            // empty message costs one byte.
            let mut cost = inner.payload.len() as u64;
            if inner.final_fragment {
                cost += 1;
            }

            if cost > channel.receive_quota {
                warn!(
                    "send quota violation on channel {}: cost {} exceeds {}",
                    channel_id, cost, channel.receive_quota
                );
                channel.phase = ChannelPhase::Terminated;
                // The violation drop below already tells the client why; the
                // worker teardown must not announce a second drop.
                channel.request.set_server_terminated();
                violated = Some(Arc::clone(&channel.connection));
                pending_control = Some(create_drop_channel(
                    channel_id,
                    Some(DropCode::SendQuotaViolation),
                    "",
                ));
            } else {
                channel.receive_quota -= cost;
                if inner.final_fragment {
                    let message_bytes =
                        channel.incoming_message_bytes + inner.payload.len() as u64;
                    channel.incoming_message_bytes = 0;
                    if channel.receive_quota < self.config.replenish_threshold {
                        let replenished = message_bytes + 1;
                        channel.receive_quota += replenished;
                        pending_control =
                            Some(create_flow_control(channel_id, replenished));
                    }
                } else {
                    channel.incoming_message_bytes += inner.payload.len() as u64;
                }

                deliver = Some(Arc::clone(&channel.connection));
            }
        }

        if let Some(data) = pending_control {
            // A failure here means the writer is already gone; the channels
            // are being torn down anyway.
            if let Err(err) = self.send_control_data(data).await {
                debug!("could not send control block: {}", err);
            }
        }
        if let Some(connection) = violated {
            connection.set_read_state(ReadState::Terminated).await;
        }
        if let Some(connection) = deliver {
            connection.append_frame_data(&inner.encapsulate()).await;
        }
        Ok(())
    }

    async fn add_logical_channel(
        self: &Arc<Self>,
        request: Arc<LogicalRequest>,
        connection: Arc<LogicalConnection>,
        receive_quota: u64,
    ) -> Result<(), Error> {
        let channel_id = request.channel_id;
        let mut channels = self.channels.lock().await;
        if channels.contains_key(&channel_id) {
            return Err(Error::physical(
                DropCode::ChannelAlreadyExists,
                channel_id,
                "channel id already exists",
            ));
        }

        let worker = self.spawn_worker(Arc::clone(&request));
        channels.insert(
            channel_id,
            LogicalChannel {
                request,
                connection,
                worker,
                phase: ChannelPhase::Open,
                receive_quota,
                incoming_message_bytes: 0,
            },
        );
        debug!("logical channel {} opened", channel_id);
        Ok(())
    }

    fn spawn_worker(self: &Arc<Self>, request: Arc<LogicalRequest>) -> JoinHandle<()> {
        let handler = Arc::clone(self);
        tokio::spawn(async move {
            let channel_id = request.channel_id;
            debug!("logical channel worker started (id={})", channel_id);
            let mut stream = LogicalStream::new(Arc::clone(&request), handler.config.clone());
            if let Err(err) = handler
                .dispatcher
                .transfer_data(Arc::clone(&request), &mut stream)
                .await
            {
                debug!("worker for channel {} finished with: {}", channel_id, err);
            }
            handler.notify_worker_done(channel_id).await;
        })
    }

    /// Called when a worker has finished: removes the channel, settles the
    /// closing protocol with the client, and signals the table condition.
    /// The closing DropChannel is queued before the signal so that a caller
    /// waiting in `wait_until_done` cannot stop the writer ahead of it.
    pub async fn notify_worker_done(&self, channel_id: ChannelId) {
        let removed = self.channels.lock().await.remove(&channel_id);

        let Some(channel) = removed else {
            warn!("worker done for unknown channel {}", channel_id);
            self.worker_done.notify_one();
            return;
        };
        debug!("worker for channel id {} terminated", channel_id);

        if channel.request.client_terminated() {
            // The client asked for the teardown; acknowledge it.
            let _ = self
                .send_control_data(create_drop_channel(
                    channel_id,
                    Some(DropCode::Acknowledged),
                    "",
                ))
                .await;
        } else if !channel.request.server_terminated() {
            let _ = self
                .send_control_data(create_drop_channel(
                    channel_id,
                    Some(DropCode::NormalClosure),
                    "",
                ))
                .await;
        }

        self.worker_done.notify_one();
    }

    /// Called when the reader task exits, for any reason: every logical
    /// channel is terminated so blocked reads and quota waits resolve and the
    /// workers can wind down.
    pub async fn notify_reader_done(&self) {
        debug!("terminating all logical connections...");
        let mut channels = self.channels.lock().await;
        for channel in channels.values_mut() {
            channel.phase = ChannelPhase::Terminated;
            channel.connection.set_read_state(ReadState::Terminated).await;
        }
    }

    /// Announces a fatal protocol error and closes the physical connection.
    pub(crate) async fn fail_physical_connection(&self, error: &Error) {
        if let Error::PhysicalConnection {
            code,
            channel_id,
            reason,
        } = error
        {
            warn!(
                "fatal protocol error on channel {}: {} ({:?})",
                channel_id, reason, code
            );
            let _ = self
                .send_control_data(create_drop_channel(*channel_id, Some(*code), ""))
                .await;
        } else {
            warn!("unexpected error on the physical connection: {}", error);
        }
        let _ = self.send_close_frame(STATUS_INTERNAL_ENDPOINT_ERROR).await;
    }
}
