/// Behavior on a NewChannelSlot block arriving from the client. The server
/// never opens channels toward the client, so accepting slots has no use
/// here; the strict default fails the physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ClientSlotPolicy {
    #[default]
    Reject,
    Ignore,
}

#[derive(Debug, Clone)]
pub struct MuxConfig {
    pub max_frame_size: Option<usize>,
    pub max_message_size: Option<usize>,
    /// Send quota granted to the client on the implicitly opened channel,
    /// published with a FlowControl block right after start.
    pub default_channel_quota: u64,
    /// Replenish a channel's receive quota after a complete message only when
    /// the remaining quota dropped below this value. The default replenishes
    /// after every message.
    pub replenish_threshold: u64,
    pub client_slot_policy: ClientSlotPolicy,
}

impl Default for MuxConfig {
    fn default() -> Self {
        MuxConfig {
            max_message_size: Some(64 << 20),
            max_frame_size: Some(16 << 20),
            default_channel_quota: 8 << 10,
            replenish_threshold: u64::MAX,
            client_slot_policy: ClientSlotPolicy::default(),
        }
    }
}
