// Connection event loop
//
// A reader task owns the read half of the transport and routes each packet:
// replies go to the caller waiting on that correlation id, event packets go
// to the event channel. A writer task owns the write half and drains the
// outgoing command queue. Callers never touch the socket.

use crate::commands::command_sets;
use crate::config::ConnectionConfig;
use crate::poison::lock;
use crate::protocol::{
    CommandPacket, IncomingPacket, ReplyPacket, SdbError, SdbResult, HEADER_SIZE,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type ReplySlot = oneshot::Sender<SdbResult<ReplyPacket>>;

#[derive(Default)]
struct PendingState {
    closed: bool,
    slots: HashMap<u32, ReplySlot>,
}

/// Completion slots keyed by correlation id
#[derive(Default)]
pub(crate) struct PendingReplies {
    state: Mutex<PendingState>,
}

impl PendingReplies {
    /// Reserve the slot for `id`. Fails once the connection is closed.
    pub(crate) fn register(&self, id: u32) -> SdbResult<oneshot::Receiver<SdbResult<ReplyPacket>>> {
        let mut state = lock(&self.state, "pending replies");
        if state.closed {
            return Err(SdbError::ConnectionClosed);
        }
        if state.slots.contains_key(&id) {
            return Err(SdbError::Protocol(format!(
                "Correlation id {} is still awaiting a reply",
                id
            )));
        }

        let (tx, rx) = oneshot::channel();
        state.slots.insert(id, tx);
        Ok(rx)
    }

    /// Hand a result to whoever waits on `id`. Returns false for unknown ids.
    pub(crate) fn complete(&self, id: u32, result: SdbResult<ReplyPacket>) -> bool {
        let slot = lock(&self.state, "pending replies").slots.remove(&id);
        match slot {
            Some(tx) => {
                // The waiter may have given up; nothing to do then
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    pub(crate) fn forget(&self, id: u32) {
        lock(&self.state, "pending replies").slots.remove(&id);
    }

    /// Fail every waiter with `ConnectionClosed` and refuse new registrations
    pub(crate) fn close_all(&self) {
        let slots = {
            let mut state = lock(&self.state, "pending replies");
            state.closed = true;
            std::mem::take(&mut state.slots)
        };

        if !slots.is_empty() {
            info!("Failing {} pending request(s): connection closed", slots.len());
        }
        for (_id, tx) in slots {
            let _ = tx.send(Err(SdbError::ConnectionClosed));
        }
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.state, "pending replies").slots.len()
    }
}

/// Handle to the running loop
#[derive(Clone)]
pub(crate) struct EventLoopHandle {
    pub(crate) command_tx: mpsc::Sender<CommandPacket>,
    pub(crate) pending: Arc<PendingReplies>,
    pub(crate) shutdown: CancellationToken,
}

/// Start the reader and writer tasks over an already-handshaken stream
pub(crate) fn spawn_event_loop<S>(
    stream: S,
    config: &ConnectionConfig,
) -> (EventLoopHandle, mpsc::Receiver<CommandPacket>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let (command_tx, command_rx) = mpsc::channel(config.command_channel_size.max(1));
    // Bounded, and fed with try_send so a slow event consumer never stalls
    // reply routing
    let (event_tx, event_rx) = mpsc::channel(config.event_channel_size.max(1));

    let pending = Arc::new(PendingReplies::default());
    let shutdown = CancellationToken::new();

    tokio::spawn(reader_task(
        reader,
        pending.clone(),
        event_tx,
        shutdown.clone(),
        config.max_packet_size,
        config.trace_packets,
    ));
    tokio::spawn(writer_task(
        writer,
        command_rx,
        pending.clone(),
        shutdown.clone(),
        config.trace_packets,
    ));

    (
        EventLoopHandle {
            command_tx,
            pending,
            shutdown,
        },
        event_rx,
    )
}

async fn writer_task<S>(
    mut writer: WriteHalf<S>,
    mut command_rx: mpsc::Receiver<CommandPacket>,
    pending: Arc<PendingReplies>,
    shutdown: CancellationToken,
    trace: bool,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    loop {
        let packet = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = command_rx.recv() => match next {
                Some(packet) => packet,
                None => break,
            },
        };

        if trace {
            debug!(
                id = packet.id,
                flags = 0u8,
                command_set = packet.command_set,
                command = packet.command,
                len = packet.data.len(),
                "send"
            );
        }

        let encoded = packet.encode();
        let written = async {
            writer.write_all(&encoded).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = written {
            error!("Failed to write command id={}: {}", packet.id, e);
            pending.complete(packet.id, Err(SdbError::Io(e)));
            // A half-written packet leaves the stream unusable
            shutdown.cancel();
            break;
        }
    }

    let _ = writer.shutdown().await;
    debug!("Writer task stopped");
}

async fn reader_task<S>(
    mut reader: ReadHalf<S>,
    pending: Arc<PendingReplies>,
    event_tx: mpsc::Sender<CommandPacket>,
    shutdown: CancellationToken,
    max_packet_size: usize,
    trace: bool,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    info!("Event loop started");

    loop {
        let result = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = read_packet(&mut reader, max_packet_size) => result,
        };

        match result {
            Ok(IncomingPacket::Reply(reply)) => {
                if trace {
                    debug!(
                        id = reply.id,
                        flags = 0x80u8,
                        error_code = reply.error_code,
                        len = reply.data.len(),
                        "recv reply"
                    );
                }

                let id = reply.id;
                if !pending.complete(id, Ok(reply)) {
                    warn!("Received reply for unknown command id={}", id);
                }
            }
            Ok(IncomingPacket::Command(packet)) => {
                if trace {
                    debug!(
                        id = packet.id,
                        flags = 0u8,
                        command_set = packet.command_set,
                        command = packet.command,
                        len = packet.data.len(),
                        "recv command"
                    );
                }

                if packet.command_set != command_sets::EVENT {
                    warn!(
                        "Ignoring agent command {}/{}",
                        packet.command_set, packet.command
                    );
                    continue;
                }

                match event_tx.try_send(packet) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(packet)) => {
                        error!(
                            "Event channel full, dropping event packet id={}. Consume events faster or raise event_channel_size",
                            packet.id
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!("Event receiver dropped, discarding event packet");
                    }
                }
            }
            Err(SdbError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                info!("Agent closed the connection");
                break;
            }
            Err(e) => {
                error!("Failed to read packet: {}", e);
                break;
            }
        }
    }

    shutdown.cancel();
    pending.close_all();
    info!("Event loop shutting down");
}

/// Read one whole packet (header included) off the transport
pub(crate) async fn read_packet<R>(reader: &mut R, max_packet_size: usize) -> SdbResult<IncomingPacket>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await?;

    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;

    if length < HEADER_SIZE {
        return Err(SdbError::Protocol(format!("Invalid packet length: {}", length)));
    }

    if length > max_packet_size {
        return Err(SdbError::Protocol(format!(
            "Packet too large: {} bytes (max: {} bytes)",
            length, max_packet_size
        )));
    }

    let mut full_packet = Vec::with_capacity(length);
    full_packet.extend_from_slice(&header);
    full_packet.resize(length, 0);
    reader.read_exact(&mut full_packet[HEADER_SIZE..]).await?;

    IncomingPacket::decode(&full_packet)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_close_all_fails_waiters_and_refuses_new_ones() {
        let pending = PendingReplies::default();
        let rx1 = pending.register(1).unwrap();
        let rx2 = pending.register(2).unwrap();

        pending.close_all();

        assert!(matches!(rx1.await.unwrap(), Err(SdbError::ConnectionClosed)));
        assert!(matches!(rx2.await.unwrap(), Err(SdbError::ConnectionClosed)));
        assert!(matches!(pending.register(3), Err(SdbError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_complete_routes_by_id() {
        let pending = PendingReplies::default();
        let rx1 = pending.register(1).unwrap();
        let rx2 = pending.register(2).unwrap();

        assert!(pending.complete(2, Ok(ReplyPacket::new(2, 0, vec![2]))));
        assert!(pending.complete(1, Ok(ReplyPacket::new(1, 0, vec![1]))));
        assert!(!pending.complete(1, Ok(ReplyPacket::new(1, 0, vec![]))));

        assert_eq!(rx1.await.unwrap().unwrap().data, vec![1]);
        assert_eq!(rx2.await.unwrap().unwrap().data, vec![2]);
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn test_in_flight_id_cannot_be_registered_twice() {
        let pending = PendingReplies::default();
        let _rx = pending.register(5).unwrap();
        assert!(matches!(pending.register(5), Err(SdbError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_read_packet_rejects_oversize_packets() {
        let reply = ReplyPacket::new(1, 0, vec![0; 64]).encode();
        let mut input = &reply[..];
        assert!(matches!(
            read_packet(&mut input, 32).await,
            Err(SdbError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_read_packet_reads_exactly_one_packet() {
        let mut bytes = ReplyPacket::new(1, 0, vec![9, 9]).encode();
        bytes.extend(ReplyPacket::new(2, 0, vec![]).encode());
        let mut input = &bytes[..];

        let first = read_packet(&mut input, 1024).await.unwrap();
        let second = read_packet(&mut input, 1024).await.unwrap();
        assert_eq!(first.id(), 1);
        assert_eq!(second.id(), 2);
        assert!(input.is_empty());
    }
}
