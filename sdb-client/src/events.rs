// Event handling
//
// Events arrive unsolicited as composite packets (set 64, command 100). One
// packet can carry several events sharing a suspend policy.

use crate::codec::PacketReader;
use crate::commands::event_kinds;
use crate::eventrequest::SuspendPolicy;
use crate::mirror::{
    AppDomainMirror, AssemblyMirror, MethodMirror, MirrorCache, ObjectMirror, ThreadMirror,
    TypeMirror,
};
use crate::protocol::{ProtocolVersion, SdbError, SdbResult};
use serde::{Deserialize, Serialize};
use tracing::warn;

// VM_DEATH events carry the exit code from 2.27
pub const EXIT_CODE_VERSION: ProtocolVersion = ProtocolVersion::new(2, 27);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventKind {
    VmStart = event_kinds::VM_START,
    VmDeath = event_kinds::VM_DEATH,
    ThreadStart = event_kinds::THREAD_START,
    ThreadDeath = event_kinds::THREAD_DEATH,
    AppDomainCreate = event_kinds::APPDOMAIN_CREATE,
    AppDomainUnload = event_kinds::APPDOMAIN_UNLOAD,
    MethodEntry = event_kinds::METHOD_ENTRY,
    MethodExit = event_kinds::METHOD_EXIT,
    AssemblyLoad = event_kinds::ASSEMBLY_LOAD,
    AssemblyUnload = event_kinds::ASSEMBLY_UNLOAD,
    Breakpoint = event_kinds::BREAKPOINT,
    Step = event_kinds::STEP,
    TypeLoad = event_kinds::TYPE_LOAD,
    Exception = event_kinds::EXCEPTION,
    KeepAlive = event_kinds::KEEPALIVE,
    UserBreak = event_kinds::USER_BREAK,
    UserLog = event_kinds::USER_LOG,
}

impl EventKind {
    pub fn from_u8(kind: u8) -> Option<Self> {
        Some(match kind {
            event_kinds::VM_START => EventKind::VmStart,
            event_kinds::VM_DEATH => EventKind::VmDeath,
            event_kinds::THREAD_START => EventKind::ThreadStart,
            event_kinds::THREAD_DEATH => EventKind::ThreadDeath,
            event_kinds::APPDOMAIN_CREATE => EventKind::AppDomainCreate,
            event_kinds::APPDOMAIN_UNLOAD => EventKind::AppDomainUnload,
            event_kinds::METHOD_ENTRY => EventKind::MethodEntry,
            event_kinds::METHOD_EXIT => EventKind::MethodExit,
            event_kinds::ASSEMBLY_LOAD => EventKind::AssemblyLoad,
            event_kinds::ASSEMBLY_UNLOAD => EventKind::AssemblyUnload,
            event_kinds::BREAKPOINT => EventKind::Breakpoint,
            event_kinds::STEP => EventKind::Step,
            event_kinds::TYPE_LOAD => EventKind::TypeLoad,
            event_kinds::EXCEPTION => EventKind::Exception,
            event_kinds::KEEPALIVE => EventKind::KeepAlive,
            event_kinds::USER_BREAK => EventKind::UserBreak,
            event_kinds::USER_LOG => EventKind::UserLog,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Composite event packet
#[derive(Debug, Clone, Serialize)]
pub struct EventSet {
    pub suspend_policy: SuspendPolicy,
    pub events: Vec<Event>,
}

/// Single event within an event set
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub kind: EventKind,
    /// Id of the request that fired this event, 0 for unsolicited ones
    pub request_id: i32,
    pub thread: Option<ThreadMirror>,
    pub details: EventDetails,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum EventDetails {
    VmStart {
        domain: Option<AppDomainMirror>,
    },
    VmDeath {
        exit_code: Option<i32>,
    },
    ThreadStart,
    ThreadDeath,
    AppDomainCreate {
        domain: Option<AppDomainMirror>,
    },
    AppDomainUnload {
        domain: Option<AppDomainMirror>,
    },
    MethodEntry {
        method: Option<MethodMirror>,
    },
    MethodExit {
        method: Option<MethodMirror>,
    },
    AssemblyLoad {
        assembly: Option<AssemblyMirror>,
    },
    AssemblyUnload {
        assembly: Option<AssemblyMirror>,
    },
    Breakpoint {
        method: Option<MethodMirror>,
        il_offset: i64,
    },
    Step {
        method: Option<MethodMirror>,
        il_offset: i64,
    },
    TypeLoad {
        ty: Option<TypeMirror>,
    },
    Exception {
        exception: Option<ObjectMirror>,
    },
    KeepAlive,
    UserBreak,
    UserLog {
        level: i32,
        category: String,
        message: String,
    },
}

/// Decode a composite event payload
pub fn decode_event_set(r: &mut PacketReader<'_>, cache: &MirrorCache) -> SdbResult<EventSet> {
    let policy = r.read_u8()?;
    let suspend_policy = SuspendPolicy::from_u8(policy)
        .ok_or_else(|| SdbError::Decode(format!("Unknown suspend policy: {}", policy)))?;

    let event_count = r.read_count()?;
    let mut events = Vec::with_capacity(event_count.min(r.remaining()));

    for _ in 0..event_count {
        events.push(decode_event(r, cache)?);
    }

    Ok(EventSet {
        suspend_policy,
        events,
    })
}

fn decode_event(r: &mut PacketReader<'_>, cache: &MirrorCache) -> SdbResult<Event> {
    let raw_kind = r.read_u8()?;
    let Some(kind) = EventKind::from_u8(raw_kind) else {
        warn!("Unknown event kind: {}", raw_kind);
        return Err(SdbError::Decode(format!("Unknown event kind: {}", raw_kind)));
    };

    let request_id = r.read_i32()?;
    let thread = cache.resolve_as::<ThreadMirror>(r.read_id()?);

    let details = match kind {
        EventKind::VmStart => EventDetails::VmStart {
            domain: cache.resolve_as(r.read_id()?),
        },
        EventKind::VmDeath => EventDetails::VmDeath {
            exit_code: if r.version() >= EXIT_CODE_VERSION {
                Some(r.read_i32()?)
            } else {
                None
            },
        },
        EventKind::ThreadStart => EventDetails::ThreadStart,
        EventKind::ThreadDeath => EventDetails::ThreadDeath,
        EventKind::AppDomainCreate => EventDetails::AppDomainCreate {
            domain: cache.resolve_as(r.read_id()?),
        },
        EventKind::AppDomainUnload => EventDetails::AppDomainUnload {
            domain: cache.resolve_as(r.read_id()?),
        },
        EventKind::MethodEntry => EventDetails::MethodEntry {
            method: cache.resolve_as(r.read_id()?),
        },
        EventKind::MethodExit => EventDetails::MethodExit {
            method: cache.resolve_as(r.read_id()?),
        },
        EventKind::AssemblyLoad => EventDetails::AssemblyLoad {
            assembly: cache.resolve_as(r.read_id()?),
        },
        EventKind::AssemblyUnload => EventDetails::AssemblyUnload {
            assembly: cache.resolve_as(r.read_id()?),
        },
        EventKind::Breakpoint => {
            let method = cache.resolve_as(r.read_id()?);
            let il_offset = r.read_i64()?;
            EventDetails::Breakpoint { method, il_offset }
        }
        EventKind::Step => {
            let method = cache.resolve_as(r.read_id()?);
            let il_offset = r.read_i64()?;
            EventDetails::Step { method, il_offset }
        }
        EventKind::TypeLoad => EventDetails::TypeLoad {
            ty: cache.resolve_as(r.read_id()?),
        },
        EventKind::Exception => EventDetails::Exception {
            exception: cache.resolve_as(r.read_id()?),
        },
        EventKind::KeepAlive => EventDetails::KeepAlive,
        EventKind::UserBreak => EventDetails::UserBreak,
        EventKind::UserLog => {
            let level = r.read_i32()?;
            let category = r.read_string()?;
            let message = r.read_string()?;
            EventDetails::UserLog {
                level,
                category,
                message,
            }
        }
    };

    Ok(Event {
        kind,
        request_id,
        thread,
        details,
    })
}
