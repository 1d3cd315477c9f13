// Virtual machine
//
// Per-connection state (negotiated version, mirror cache, event requests) and
// the VirtualMachine command set.

use crate::codec::{PacketReader, PacketWriter};
use crate::commands::{command_sets, domain_commands, vm_commands};
use crate::config::ConnectionConfig;
use crate::connection::{Connection, PendingReply};
use crate::connector;
use crate::eventrequest::EventRequestManager;
use crate::events::{decode_event_set, EventSet};
use crate::invoke::{decode_invoke_reply, InvokeOptions, InvokeOutcome};
use crate::mirror::{AppDomainMirror, MethodMirror, MirrorCache, ThreadMirror, TypeMirror};
use crate::poison::lock;
use crate::protocol::{
    CommandPacket, ProtocolVersion, ReplyPacket, SdbError, SdbResult, NOT_IMPLEMENTED,
};
use crate::value::{write_value, write_values, Value};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, ToSocketAddrs};
use tracing::{debug, info, warn};

/// Reply to VirtualMachine.Version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmVersion {
    pub description: String,
    pub major: i32,
    pub minor: i32,
}

impl VmVersion {
    pub fn protocol(&self) -> ProtocolVersion {
        ProtocolVersion::new(self.major, self.minor)
    }
}

/// State shared by everything hanging off one connection
pub(crate) struct VmShared {
    pub(crate) conn: Connection,
    version: Mutex<ProtocolVersion>,
    pub(crate) mirrors: MirrorCache,
    pub(crate) requests: EventRequestManager,
}

impl VmShared {
    pub(crate) fn version(&self) -> ProtocolVersion {
        *lock(&self.version, "protocol version")
    }

    /// Reader over a reply payload, decoding for the negotiated version
    pub(crate) fn reader<'a>(&self, data: &'a [u8]) -> PacketReader<'a> {
        PacketReader::new(data, self.version()).with_trace(self.conn.trace_enabled())
    }

    pub(crate) async fn request(&self, writer: PacketWriter) -> SdbResult<ReplyPacket> {
        self.conn.request(writer).await
    }
}

/// Handle to an attached debuggee. Clones share the connection.
///
/// Dropping the last handle shuts the connection down.
#[derive(Clone)]
pub struct VirtualMachine {
    shared: Arc<VmShared>,
}

impl VirtualMachine {
    /// Attach over a stream that has already completed the handshake.
    ///
    /// Asks the agent for its version, offers `config.client_version` and
    /// settles on the lower of the two.
    pub async fn attach<S>(stream: S, config: &ConnectionConfig) -> SdbResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let conn = Connection::start(stream, config);
        let shared = Arc::new_cyclic(|weak| VmShared {
            conn,
            version: Mutex::new(config.client_version),
            mirrors: MirrorCache::new(weak.clone()),
            requests: EventRequestManager::new(weak.clone()),
        });
        let vm = Self { shared };

        let remote = vm.version().await?;
        let negotiated = remote.protocol().min(config.client_version);

        let mut w = PacketWriter::new(command_sets::VIRTUAL_MACHINE, vm_commands::SET_PROTOCOL_VERSION);
        w.write_i32(config.client_version.major)
            .write_i32(config.client_version.minor);
        match vm.shared.request(w).await {
            Ok(_) => {}
            Err(SdbError::ErrorCode { code: NOT_IMPLEMENTED, .. }) => {
                debug!("Agent does not accept a protocol version, using {}", negotiated);
            }
            Err(e) => return Err(e),
        }

        *lock(&vm.shared.version, "protocol version") = negotiated;
        info!(
            "Attached to {} (agent protocol {}, using {})",
            remote.description,
            remote.protocol(),
            negotiated
        );
        Ok(vm)
    }

    /// Connect to a listening agent and attach
    pub async fn connect<A>(addr: A, config: &ConnectionConfig) -> SdbResult<Self>
    where
        A: ToSocketAddrs,
    {
        let stream = connector::connect(addr, config).await?;
        Self::attach(stream, config).await
    }

    /// Wait for an agent to connect to `listener`, then attach
    pub async fn accept(listener: &TcpListener, config: &ConnectionConfig) -> SdbResult<Self> {
        let (stream, _peer) = connector::accept(listener, config).await?;
        Self::attach(stream, config).await
    }

    /// Negotiated protocol version
    pub fn protocol_version(&self) -> ProtocolVersion {
        self.shared.version()
    }

    pub fn is_at_least_version(&self, major: i32, minor: i32) -> bool {
        self.protocol_version().is_at_least(major, minor)
    }

    pub fn mirrors(&self) -> &MirrorCache {
        &self.shared.mirrors
    }

    pub fn event_requests(&self) -> &EventRequestManager {
        &self.shared.requests
    }

    pub fn is_connected(&self) -> bool {
        !self.shared.conn.is_closed()
    }

    /// Queue a raw command without waiting
    pub async fn send(&self, writer: PacketWriter) -> SdbResult<PendingReply> {
        self.shared.conn.send(writer).await
    }

    pub async fn await_reply(&self, pending: PendingReply) -> SdbResult<ReplyPacket> {
        self.shared.conn.await_reply(pending).await
    }

    /// Send a raw command and wait for its reply
    pub async fn request(&self, writer: PacketWriter) -> SdbResult<ReplyPacket> {
        self.shared.request(writer).await
    }

    /// Reader over a reply payload for the negotiated version
    pub fn reader<'a>(&self, data: &'a [u8]) -> PacketReader<'a> {
        self.shared.reader(data)
    }

    /// VirtualMachine.Version
    pub async fn version(&self) -> SdbResult<VmVersion> {
        let w = PacketWriter::new(command_sets::VIRTUAL_MACHINE, vm_commands::VERSION);
        let reply = self.request(w).await?;
        let mut r = self.reader(reply.data());

        Ok(VmVersion {
            description: r.read_string()?,
            major: r.read_i32()?,
            minor: r.read_i32()?,
        })
    }

    pub async fn all_threads(&self) -> SdbResult<Vec<ThreadMirror>> {
        let w = PacketWriter::new(command_sets::VIRTUAL_MACHINE, vm_commands::ALL_THREADS);
        let reply = self.request(w).await?;
        let ids = self.reader(reply.data()).read_ids()?;

        Ok(ids
            .into_iter()
            .filter_map(|id| self.mirrors().resolve_as(id))
            .collect())
    }

    /// Suspend all threads
    pub async fn suspend(&self) -> SdbResult<()> {
        let w = PacketWriter::new(command_sets::VIRTUAL_MACHINE, vm_commands::SUSPEND);
        self.request(w).await?;
        Ok(())
    }

    /// Resume all threads
    pub async fn resume(&self) -> SdbResult<()> {
        let w = PacketWriter::new(command_sets::VIRTUAL_MACHINE, vm_commands::RESUME);
        self.request(w).await?;
        Ok(())
    }

    /// Terminate the debuggee with `exit_code`
    pub async fn exit(&self, exit_code: i32) -> SdbResult<()> {
        let mut w = PacketWriter::new(command_sets::VIRTUAL_MACHINE, vm_commands::EXIT);
        w.write_i32(exit_code);
        self.request(w).await?;
        Ok(())
    }

    /// Tell the agent the debugger is going away. The debuggee keeps running.
    pub async fn dispose(&self) -> SdbResult<()> {
        let w = PacketWriter::new(command_sets::VIRTUAL_MACHINE, vm_commands::DISPOSE);
        self.request(w).await?;
        Ok(())
    }

    /// Types whose full name is `name` across all loaded assemblies
    pub async fn types(&self, name: &str, ignore_case: bool) -> SdbResult<Vec<TypeMirror>> {
        let mut w = PacketWriter::new(command_sets::VIRTUAL_MACHINE, vm_commands::GET_TYPES);
        w.write_string(name).write_bool(ignore_case);
        self.resolve_types(w).await
    }

    /// Types with code in source file `file`
    pub async fn types_for_source_file(
        &self,
        file: &str,
        ignore_case: bool,
    ) -> SdbResult<Vec<TypeMirror>> {
        let mut w = PacketWriter::new(
            command_sets::VIRTUAL_MACHINE,
            vm_commands::GET_TYPES_FOR_SOURCE_FILE,
        );
        w.write_string(file).write_bool(ignore_case);
        self.resolve_types(w).await
    }

    async fn resolve_types(&self, w: PacketWriter) -> SdbResult<Vec<TypeMirror>> {
        let reply = self.request(w).await?;
        let ids = self.reader(reply.data()).read_ids()?;
        Ok(ids
            .into_iter()
            .filter_map(|id| self.mirrors().resolve_as(id))
            .collect())
    }

    pub async fn root_domain(&self) -> SdbResult<AppDomainMirror> {
        let w = PacketWriter::new(command_sets::APP_DOMAIN, domain_commands::GET_ROOT_DOMAIN);
        let reply = self.request(w).await?;
        let id = self.reader(reply.data()).read_id()?;
        self.mirrors()
            .resolve_as(id)
            .ok_or_else(|| SdbError::Decode("Agent returned a null root domain".to_string()))
    }

    /// Run `method` on `thread` inside the debuggee (VirtualMachine.InvokeMethod).
    ///
    /// `this` is `None` for static methods. The thread must be suspended.
    pub async fn invoke_method(
        &self,
        thread: &ThreadMirror,
        method: &MethodMirror,
        this: Option<&Value>,
        args: &[Value],
        options: InvokeOptions,
    ) -> SdbResult<InvokeOutcome> {
        let version = self.protocol_version();
        options.check_version(version)?;

        let mut w = PacketWriter::new(command_sets::VIRTUAL_MACHINE, vm_commands::INVOKE_METHOD);
        w.write_id(thread.id())
            .write_i32(options.flags())
            .write_id(method.id());
        write_value(&mut w, this.unwrap_or(&Value::Null), version)?;
        w.write_i32(args.len() as i32);
        write_values(&mut w, args, version)?;

        debug!(
            "Invoking method {:x} on thread {:x} with {} argument(s)",
            method.id(),
            thread.id(),
            args.len()
        );

        let reply = self.request(w).await?;
        let mut r = self.reader(reply.data());
        decode_invoke_reply(&mut r, self.mirrors())
    }

    fn decode_event(&self, packet: CommandPacket) -> SdbResult<EventSet> {
        let mut r = self.reader(&packet.data);
        decode_event_set(&mut r, self.mirrors()).map_err(|e| {
            warn!("Failed to decode event packet id={}: {}", packet.id, e);
            e
        })
    }

    /// Wait for the next event set. Fails with `ConnectionClosed` once the agent is gone.
    pub async fn next_event(&self) -> SdbResult<EventSet> {
        let packet = self
            .shared
            .conn
            .recv_event()
            .await
            .ok_or(SdbError::ConnectionClosed)?;
        self.decode_event(packet)
    }

    /// Next event set if one is already queued
    pub async fn try_next_event(&self) -> SdbResult<Option<EventSet>> {
        match self.shared.conn.try_recv_event().await {
            Some(packet) => self.decode_event(packet).map(Some),
            None => Ok(None),
        }
    }

    /// Dispose (best effort), close the connection and forget all mirrors and requests
    pub async fn disconnect(&self) {
        if !self.shared.conn.is_closed() {
            if let Err(e) = self.dispose().await {
                debug!("Dispose during disconnect failed: {}", e);
            }
        }

        self.shared.conn.close();
        self.shared.requests.clear();
        self.shared.mirrors.clear();
        info!("Disconnected");
    }
}

impl std::fmt::Debug for VirtualMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualMachine")
            .field("version", &self.protocol_version())
            .field("connection", &self.shared.conn)
            .field("mirrors", &self.shared.mirrors)
            .finish()
    }
}
