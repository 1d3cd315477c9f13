// Soft debugger wire protocol client
//
// Implements the debugger side of the protocol spoken by managed runtime agents:
// - Packet framing, correlation and the reader/writer event loop
// - Version-aware value and payload codec
// - Identity-preserving mirror cache for remote entities
// - Event requests (breakpoints, steps, exceptions) and event decoding
// - Method invocation inside the debuggee

pub mod protocol;
pub mod commands;
pub mod codec;
pub mod config;
mod poison;
mod eventloop;
pub mod connection;
pub mod connector;
pub mod value;
pub mod mirror;
pub mod vm;
pub mod eventrequest;
pub mod events;
pub mod invoke;
pub mod domain;
pub mod assembly;
pub mod reftype;
pub mod method;
pub mod thread;
pub mod stackframe;
pub mod object;
pub mod attribute;

#[cfg(test)]
mod mock;

pub use attribute::{AttributeMember, CustomAttribute, NamedArgument};
pub use codec::{PacketReader, PacketWriter, RemoteId};
pub use config::ConnectionConfig;
pub use connection::{Connection, PendingReply};
pub use eventrequest::{
    EventRequest, EventRequestKind, EventRequestManager, Modifier, RequestState, StepDepth,
    StepSize, SuspendPolicy,
};
pub use events::{Event, EventDetails, EventKind, EventSet};
pub use invoke::{InvokeOptions, InvokeOutcome, InvokeResult, ThrownException};
pub use mirror::{
    AppDomainMirror, AssemblyMirror, FieldMirror, MethodMirror, Mirror, MirrorCache, MirrorKind,
    ModuleMirror, ObjectMirror, PropertyMirror, ThreadMirror, TypeMirror, TypedMirror,
};
pub use protocol::{ProtocolVersion, SdbError, SdbResult};
pub use thread::StackFrame;
pub use value::{PointerValue, PrimitiveValue, StructValue, Value};
pub use vm::{VirtualMachine, VmVersion};
