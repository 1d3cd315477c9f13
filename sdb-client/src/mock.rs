// Scripted in-process agent for tests
//
// Runs the agent side of a duplex pipe. Commands with a registered handler
// are answered automatically; everything else is queued for the test to
// answer by hand. Every command is recorded.

use crate::codec::PacketWriter;
use crate::commands::{command_sets, event_set_commands, vm_commands};
use crate::config::ConnectionConfig;
use crate::eventloop::read_packet;
use crate::poison::lock;
use crate::protocol::{CommandPacket, IncomingPacket, ProtocolVersion, ReplyPacket};
use crate::vm::VirtualMachine;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Reply payload, or a non-zero error code
pub(crate) type MockReply = Result<Vec<u8>, u16>;

type Handler = Box<dyn Fn(&CommandPacket) -> MockReply + Send + Sync>;

#[derive(Default)]
struct Script {
    handlers: HashMap<(u8, u8), Handler>,
    received: Vec<CommandPacket>,
}

pub(crate) struct MockAgent {
    script: Arc<Mutex<Script>>,
    commands: tokio::sync::Mutex<mpsc::UnboundedReceiver<CommandPacket>>,
    out_tx: mpsc::UnboundedSender<Vec<u8>>,
    shutdown: CancellationToken,
    next_event_id: AtomicU32,
}

impl MockAgent {
    /// Agent plus the client end of the pipe, handshake already done
    pub(crate) fn new(version: ProtocolVersion) -> (Self, DuplexStream) {
        let (client, agent) = tokio::io::duplex(64 * 1024);
        let (mut reader, mut writer) = tokio::io::split(agent);

        let script = Arc::new(Mutex::new(Script::default()));
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let shutdown = CancellationToken::new();

        let mock = Self {
            script: script.clone(),
            commands: tokio::sync::Mutex::new(command_rx),
            out_tx: out_tx.clone(),
            shutdown: shutdown.clone(),
            next_event_id: AtomicU32::new(0x1000),
        };
        mock.answer_version(version);

        let reader_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let packet = tokio::select! {
                    _ = reader_shutdown.cancelled() => break,
                    packet = read_packet(&mut reader, usize::MAX) => packet,
                };
                let Ok(IncomingPacket::Command(cmd)) = packet else {
                    break;
                };

                let reply = {
                    let mut script = lock(&script, "mock script");
                    script.received.push(cmd.clone());
                    script
                        .handlers
                        .get(&(cmd.command_set, cmd.command))
                        .map(|handler| handler(&cmd))
                };

                match reply {
                    Some(reply) => {
                        let _ = out_tx.send(encode_reply(cmd.id, reply));
                    }
                    None => {
                        let _ = command_tx.send(cmd);
                    }
                }
            }
        });

        tokio::spawn(async move {
            loop {
                let bytes = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    bytes = out_rx.recv() => match bytes {
                        Some(bytes) => bytes,
                        None => break,
                    },
                };
                if writer.write_all(&bytes).await.is_err() {
                    break;
                }
            }
        });

        (mock, client)
    }

    /// Agent with an engine already attached to it
    pub(crate) async fn attached(version: ProtocolVersion) -> (Self, VirtualMachine) {
        let (agent, stream) = Self::new(version);
        let vm = VirtualMachine::attach(stream, &ConnectionConfig::default())
            .await
            .expect("attach to mock agent");
        (agent, vm)
    }

    fn answer_version(&self, version: ProtocolVersion) {
        self.on(command_sets::VIRTUAL_MACHINE, vm_commands::VERSION, move |_| {
            let mut w = PacketWriter::new(0, 0);
            w.write_string("Mock runtime")
                .write_i32(version.major)
                .write_i32(version.minor);
            Ok(w.payload().to_vec())
        });
        self.on(
            command_sets::VIRTUAL_MACHINE,
            vm_commands::SET_PROTOCOL_VERSION,
            |_| Ok(Vec::new()),
        );
    }

    /// Answer every `(command_set, command)` with `handler`
    pub(crate) fn on<F>(&self, command_set: u8, command: u8, handler: F)
    where
        F: Fn(&CommandPacket) -> MockReply + Send + Sync + 'static,
    {
        lock(&self.script, "mock script")
            .handlers
            .insert((command_set, command), Box::new(handler));
    }

    /// Next command that no handler answered
    pub(crate) async fn next_command(&self) -> Option<CommandPacket> {
        self.commands.lock().await.recv().await
    }

    pub(crate) async fn reply(&self, id: u32, error_code: u16, data: Vec<u8>) {
        let reply = if error_code == 0 { Ok(data) } else { Err(error_code) };
        let _ = self.out_tx.send(encode_reply(id, reply));
    }

    /// Push a composite event packet to the client
    pub(crate) async fn send_event(&self, data: Vec<u8>) {
        let id = self.next_event_id.fetch_add(1, Ordering::SeqCst);
        let mut packet = CommandPacket::new(id, command_sets::EVENT, event_set_commands::COMPOSITE);
        packet.data = data;
        let _ = self.out_tx.send(packet.encode());
    }

    /// Every command received so far for `(command_set, command)`
    pub(crate) fn received(&self, command_set: u8, command: u8) -> Vec<CommandPacket> {
        lock(&self.script, "mock script")
            .received
            .iter()
            .filter(|cmd| cmd.command_set == command_set && cmd.command == command)
            .cloned()
            .collect()
    }

    /// Drop the pipe, as a crashed agent would
    pub(crate) fn disconnect(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for MockAgent {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn encode_reply(id: u32, reply: MockReply) -> Vec<u8> {
    match reply {
        Ok(data) => ReplyPacket::new(id, 0, data).encode(),
        Err(code) => ReplyPacket::new(id, code, Vec::new()).encode(),
    }
}
