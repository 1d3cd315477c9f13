// Connection configuration

use crate::protocol::ProtocolVersion;
use std::time::Duration;

/// Highest protocol version this client speaks
pub const MAX_SUPPORTED_VERSION: ProtocolVersion = ProtocolVersion::new(2, 46);

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Bound on the connector's handshake exchange. Requests themselves never time out.
    pub handshake_timeout: Duration,
    /// Capacity of the queue feeding the writer task
    pub command_channel_size: usize,
    /// Event packets buffered for `next_event`. Packets arriving while it is
    /// full are dropped with an error log.
    pub event_channel_size: usize,
    /// Incoming packets larger than this tear the connection down
    pub max_packet_size: usize,
    /// Log every packet and every decoded field at `trace`/`debug` level
    pub trace_packets: bool,
    /// Version offered during negotiation; the agent may settle lower
    pub client_version: ProtocolVersion,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            command_channel_size: 32,
            event_channel_size: 256,
            // Guards against memory exhaustion from a broken agent
            max_packet_size: 10 * 1024 * 1024,
            trace_packets: false,
            client_version: MAX_SUPPORTED_VERSION,
        }
    }
}
