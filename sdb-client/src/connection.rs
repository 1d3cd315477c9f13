// Connection engine
//
// Assigns correlation ids, queues command packets for the writer task, and
// lets each caller wait on its own reply slot.

use crate::codec::PacketWriter;
use crate::config::ConnectionConfig;
use crate::eventloop::{spawn_event_loop, EventLoopHandle};
use crate::protocol::{CommandPacket, ReplyPacket, SdbError, SdbResult};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::debug;

/// A command that has been queued and is waiting for its reply
#[derive(Debug)]
pub struct PendingReply {
    id: u32,
    rx: oneshot::Receiver<SdbResult<ReplyPacket>>,
}

impl PendingReply {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Wait for the reply. A non-zero error code becomes `SdbError::ErrorCode`.
    pub async fn wait(self) -> SdbResult<ReplyPacket> {
        let reply = self.rx.await.map_err(|_| SdbError::ConnectionClosed)??;
        reply.check_error()?;
        Ok(reply)
    }
}

pub struct Connection {
    event_loop: EventLoopHandle,
    events: Mutex<mpsc::Receiver<CommandPacket>>,
    next_id: AtomicU32,
    trace: bool,
}

impl Connection {
    /// Start the engine over a transport that is already past the handshake
    pub fn start<S>(stream: S, config: &ConnectionConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (event_loop, events) = spawn_event_loop(stream, config);

        Self {
            event_loop,
            events: Mutex::new(events),
            next_id: AtomicU32::new(1),
            trace: config.trace_packets,
        }
    }

    /// Generate next packet ID
    pub fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn trace_enabled(&self) -> bool {
        self.trace
    }

    /// Queue a command. Returns as soon as the packet is handed to the writer.
    pub async fn send(&self, writer: PacketWriter) -> SdbResult<PendingReply> {
        let id = self.next_id();
        let rx = self.event_loop.pending.register(id)?;
        let packet = writer.into_packet(id);

        debug!(
            "Sending command id={} set={} cmd={}",
            id, packet.command_set, packet.command
        );

        if self.event_loop.command_tx.send(packet).await.is_err() {
            self.event_loop.pending.forget(id);
            return Err(SdbError::ConnectionClosed);
        }

        Ok(PendingReply { id, rx })
    }

    pub async fn await_reply(&self, pending: PendingReply) -> SdbResult<ReplyPacket> {
        pending.wait().await
    }

    /// Send a command and wait for reply
    pub async fn request(&self, writer: PacketWriter) -> SdbResult<ReplyPacket> {
        let pending = self.send(writer).await?;
        self.await_reply(pending).await
    }

    /// Wait for the next event packet. `None` once the connection is gone.
    pub async fn recv_event(&self) -> Option<CommandPacket> {
        let mut rx = self.events.lock().await;
        rx.recv().await
    }

    /// Try to receive an event packet (non-blocking)
    pub async fn try_recv_event(&self) -> Option<CommandPacket> {
        let mut rx = self.events.lock().await;
        rx.try_recv().ok()
    }

    /// Tear the connection down. Every waiting caller gets `ConnectionClosed`.
    pub fn close(&self) {
        self.event_loop.shutdown.cancel();
        self.event_loop.pending.close_all();
    }

    pub fn is_closed(&self) -> bool {
        self.event_loop.shutdown.is_cancelled()
    }

    /// Resolves once the connection has been torn down, from either side
    pub async fn closed(&self) {
        self.event_loop.shutdown.cancelled().await
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("next_id", &self.next_id.load(Ordering::SeqCst))
            .field("pending", &self.event_loop.pending.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockAgent;
    use crate::protocol::ProtocolVersion;
    use std::time::Duration;

    #[tokio::test]
    async fn test_ids_are_monotonic() {
        let (agent, stream) = MockAgent::new(ProtocolVersion::new(2, 46));
        let conn = Connection::start(stream, &ConnectionConfig::default());

        let a = conn.send(PacketWriter::new(1, 1)).await.unwrap();
        let b = conn.send(PacketWriter::new(1, 1)).await.unwrap();
        let c = conn.send(PacketWriter::new(1, 1)).await.unwrap();
        assert!(a.id() < b.id() && b.id() < c.id());
        drop(agent);
    }

    #[tokio::test]
    async fn test_replies_are_routed_to_their_callers_out_of_order() {
        let (agent, stream) = MockAgent::new(ProtocolVersion::new(2, 46));
        let conn = Connection::start(stream, &ConnectionConfig::default());

        let mut first = PacketWriter::new(1, 99);
        first.write_i32(1);
        let mut second = PacketWriter::new(1, 99);
        second.write_i32(2);

        let p1 = conn.send(first).await.unwrap();
        let p2 = conn.send(second).await.unwrap();

        // The agent answers the second command first
        let c1 = agent.next_command().await.unwrap();
        let c2 = agent.next_command().await.unwrap();
        agent.reply(c2.id, 0, c2.data.clone()).await;
        agent.reply(c1.id, 0, c1.data.clone()).await;

        assert_eq!(conn.await_reply(p2).await.unwrap().data, vec![0, 0, 0, 2]);
        assert_eq!(conn.await_reply(p1).await.unwrap().data, vec![0, 0, 0, 1]);
    }

    #[tokio::test]
    async fn test_error_code_reply_is_typed_failure() {
        let (agent, stream) = MockAgent::new(ProtocolVersion::new(2, 46));
        let conn = Connection::start(stream, &ConnectionConfig::default());

        let pending = conn.send(PacketWriter::new(9, 1)).await.unwrap();
        let cmd = agent.next_command().await.unwrap();
        agent.reply(cmd.id, 20, vec![1, 2, 3]).await;

        match conn.await_reply(pending).await {
            Err(SdbError::ErrorCode { code, name }) => {
                assert_eq!(code, 20);
                assert_eq!(name, "INVALID_OBJECT");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transport_loss_unblocks_every_waiter() {
        let (agent, stream) = MockAgent::new(ProtocolVersion::new(2, 46));
        let conn = Connection::start(stream, &ConnectionConfig::default());

        let p1 = conn.send(PacketWriter::new(1, 1)).await.unwrap();
        let p2 = conn.send(PacketWriter::new(1, 2)).await.unwrap();
        let _ = agent.next_command().await;
        let _ = agent.next_command().await;
        agent.disconnect();

        let (r1, r2) = tokio::join!(conn.await_reply(p1), conn.await_reply(p2));
        assert!(matches!(r1, Err(SdbError::ConnectionClosed)));
        assert!(matches!(r2, Err(SdbError::ConnectionClosed)));

        tokio::time::timeout(Duration::from_secs(5), conn.closed())
            .await
            .expect("connection should notice the disconnect");
        assert!(matches!(
            conn.send(PacketWriter::new(1, 1)).await,
            Err(SdbError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_local_close_unblocks_waiters() {
        let (_agent, stream) = MockAgent::new(ProtocolVersion::new(2, 46));
        let conn = Connection::start(stream, &ConnectionConfig::default());

        let pending = conn.send(PacketWriter::new(1, 1)).await.unwrap();
        conn.close();
        assert!(matches!(
            conn.await_reply(pending).await,
            Err(SdbError::ConnectionClosed)
        ));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_event_packets_bypass_reply_routing() {
        let (agent, stream) = MockAgent::new(ProtocolVersion::new(2, 46));
        let conn = Connection::start(stream, &ConnectionConfig::default());

        agent.send_event(vec![2, 0, 0, 0, 0]).await;
        let event = conn.recv_event().await.unwrap();
        assert_eq!(event.command_set, 64);
        assert_eq!(event.command, 100);
        assert_eq!(event.data, vec![2, 0, 0, 0, 0]);
        assert!(conn.try_recv_event().await.is_none());
    }

    #[tokio::test]
    async fn test_full_event_buffer_drops_events_but_not_replies() {
        let (agent, stream) = MockAgent::new(ProtocolVersion::new(2, 46));
        let config = ConnectionConfig {
            event_channel_size: 2,
            ..ConnectionConfig::default()
        };
        let conn = Connection::start(stream, &config);

        for i in 0..4u8 {
            agent.send_event(vec![i]).await;
        }

        // The reply is written after the events, so once it arrives every
        // event has been routed
        let pending = conn.send(PacketWriter::new(1, 1)).await.unwrap();
        let cmd = agent.next_command().await.unwrap();
        agent.reply(cmd.id, 0, vec![7]).await;
        assert_eq!(conn.await_reply(pending).await.unwrap().data, vec![7]);

        assert_eq!(conn.recv_event().await.unwrap().data, vec![0]);
        assert_eq!(conn.recv_event().await.unwrap().data, vec![1]);
        assert!(conn.try_recv_event().await.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_callers_each_get_their_own_reply() {
        let (agent, stream) = MockAgent::new(ProtocolVersion::new(2, 46));
        let conn = std::sync::Arc::new(Connection::start(stream, &ConnectionConfig::default()));

        // Echo agent
        let echo = tokio::spawn(async move {
            while let Some(cmd) = agent.next_command().await {
                agent.reply(cmd.id, 0, cmd.data).await;
            }
        });

        let mut tasks = Vec::new();
        for i in 0..16i32 {
            let conn = conn.clone();
            tasks.push(tokio::spawn(async move {
                let mut w = PacketWriter::new(1, 77);
                w.write_i32(i);
                let reply = conn.request(w).await.unwrap();
                assert_eq!(reply.data, i.to_be_bytes().to_vec());
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        conn.close();
        echo.abort();
    }
}
