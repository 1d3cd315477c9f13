// Event requests
//
// Breakpoints, steps, exception catchpoints and lifecycle notifications. Each
// request is a small state machine; the manager keeps the live requests of
// one connection, one ordered list per event kind.

use crate::codec::PacketWriter;
use crate::commands::{command_sets, event_commands, modifier_kinds, step_filters, suspend_policies};
use crate::events::EventKind;
use crate::mirror::{AssemblyMirror, MethodMirror, ThreadMirror, TypeMirror};
use crate::poison::lock;
use crate::protocol::{ProtocolVersion, SdbError, SdbResult};
use crate::vm::VmShared;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info};

// Step modifiers carry a filter mask from 2.16
pub const STEP_FILTER_VERSION: ProtocolVersion = ProtocolVersion::new(2, 16);
// Exception modifiers carry a subclasses flag from 2.25
pub const EXCEPTION_SUBCLASSES_VERSION: ProtocolVersion = ProtocolVersion::new(2, 25);

/// Which threads the agent suspends when the event fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SuspendPolicy {
    None,
    EventThread,
    #[default]
    All,
}

impl SuspendPolicy {
    pub fn from_u8(policy: u8) -> Option<Self> {
        match policy {
            suspend_policies::NONE => Some(SuspendPolicy::None),
            suspend_policies::EVENT_THREAD => Some(SuspendPolicy::EventThread),
            suspend_policies::ALL => Some(SuspendPolicy::All),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            SuspendPolicy::None => suspend_policies::NONE,
            SuspendPolicy::EventThread => suspend_policies::EVENT_THREAD,
            SuspendPolicy::All => suspend_policies::ALL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestState {
    /// Not registered with the agent. New requests start here.
    Disabled,
    Enabled,
    /// Terminal
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepSize {
    Min,
    Line,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepDepth {
    Into,
    Over,
    Out,
}

impl StepSize {
    fn as_i32(self) -> i32 {
        match self {
            StepSize::Min => crate::commands::step_sizes::MIN,
            StepSize::Line => crate::commands::step_sizes::LINE,
        }
    }
}

impl StepDepth {
    fn as_i32(self) -> i32 {
        match self {
            StepDepth::Into => crate::commands::step_depths::INTO,
            StepDepth::Over => crate::commands::step_depths::OVER,
            StepDepth::Out => crate::commands::step_depths::OUT,
        }
    }
}

/// What a request watches for. Kind-specific parameters are fixed at creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum EventRequestKind {
    Breakpoint {
        method: MethodMirror,
        il_offset: i64,
    },
    Step {
        thread: ThreadMirror,
        size: StepSize,
        depth: StepDepth,
        /// `step_filters` bit set
        filter: i32,
    },
    Exception {
        /// `None` catches every exception type
        exception_type: Option<TypeMirror>,
        caught: bool,
        uncaught: bool,
        subclasses: bool,
    },
    TypeLoad,
    AppDomainCreate,
    AppDomainUnload,
    ThreadStart,
    ThreadDeath,
    MethodEntry,
    MethodExit,
    VmDeath,
    AssemblyLoad,
    AssemblyUnload,
}

impl EventRequestKind {
    pub fn event_kind(&self) -> EventKind {
        match self {
            EventRequestKind::Breakpoint { .. } => EventKind::Breakpoint,
            EventRequestKind::Step { .. } => EventKind::Step,
            EventRequestKind::Exception { .. } => EventKind::Exception,
            EventRequestKind::TypeLoad => EventKind::TypeLoad,
            EventRequestKind::AppDomainCreate => EventKind::AppDomainCreate,
            EventRequestKind::AppDomainUnload => EventKind::AppDomainUnload,
            EventRequestKind::ThreadStart => EventKind::ThreadStart,
            EventRequestKind::ThreadDeath => EventKind::ThreadDeath,
            EventRequestKind::MethodEntry => EventKind::MethodEntry,
            EventRequestKind::MethodExit => EventKind::MethodExit,
            EventRequestKind::VmDeath => EventKind::VmDeath,
            EventRequestKind::AssemblyLoad => EventKind::AssemblyLoad,
            EventRequestKind::AssemblyUnload => EventKind::AssemblyUnload,
        }
    }

    fn step_thread(&self) -> Option<&ThreadMirror> {
        match self {
            EventRequestKind::Step { thread, .. } => Some(thread),
            _ => None,
        }
    }

    /// Refuse parameters the negotiated version cannot express
    fn check_version(&self, version: ProtocolVersion) -> SdbResult<()> {
        match self {
            EventRequestKind::Step { filter, .. } if *filter != step_filters::NONE => version
                .require(
                    STEP_FILTER_VERSION.major,
                    STEP_FILTER_VERSION.minor,
                    "step filters",
                ),
            EventRequestKind::Exception {
                subclasses: false, ..
            } => version.require(
                EXCEPTION_SUBCLASSES_VERSION.major,
                EXCEPTION_SUBCLASSES_VERSION.minor,
                "exact exception type filters",
            ),
            _ => Ok(()),
        }
    }

    fn has_modifier(&self) -> bool {
        matches!(
            self,
            EventRequestKind::Breakpoint { .. }
                | EventRequestKind::Step { .. }
                | EventRequestKind::Exception { .. }
        )
    }

    /// The modifier implied by the kind itself, if any
    fn write_modifier(&self, w: &mut PacketWriter, version: ProtocolVersion) {
        match self {
            EventRequestKind::Breakpoint { method, il_offset } => {
                w.write_u8(modifier_kinds::LOCATION_ONLY)
                    .write_id(method.id())
                    .write_i64(*il_offset);
            }
            EventRequestKind::Step {
                thread,
                size,
                depth,
                filter,
            } => {
                w.write_u8(modifier_kinds::STEP)
                    .write_id(thread.id())
                    .write_i32(size.as_i32())
                    .write_i32(depth.as_i32());
                if version >= STEP_FILTER_VERSION {
                    w.write_i32(*filter);
                }
            }
            EventRequestKind::Exception {
                exception_type,
                caught,
                uncaught,
                subclasses,
            } => {
                w.write_u8(modifier_kinds::EXCEPTION_ONLY)
                    .write_id(exception_type.as_ref().map_or(0, TypeMirror::id))
                    .write_bool(*caught)
                    .write_bool(*uncaught);
                if version >= EXCEPTION_SUBCLASSES_VERSION {
                    w.write_bool(*subclasses);
                }
            }
            _ => {}
        }
    }
}

/// Filter narrowing when a request fires
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value")]
pub enum Modifier {
    /// Fire only on the n-th hit
    Count(i32),
    ThreadOnly(ThreadMirror),
    AssemblyOnly(Vec<AssemblyMirror>),
    SourceFileOnly(Vec<String>),
    TypeNameOnly(Vec<String>),
}

impl Modifier {
    fn write(&self, w: &mut PacketWriter) {
        match self {
            Modifier::Count(count) => {
                w.write_u8(modifier_kinds::COUNT).write_i32(*count);
            }
            Modifier::ThreadOnly(thread) => {
                w.write_u8(modifier_kinds::THREAD_ONLY).write_id(thread.id());
            }
            Modifier::AssemblyOnly(assemblies) => {
                let ids: Vec<_> = assemblies.iter().map(AssemblyMirror::id).collect();
                w.write_u8(modifier_kinds::ASSEMBLY_ONLY).write_ids(&ids);
            }
            Modifier::SourceFileOnly(files) => {
                w.write_u8(modifier_kinds::SOURCE_FILE_ONLY).write_strings(files);
            }
            Modifier::TypeNameOnly(names) => {
                w.write_u8(modifier_kinds::TYPE_NAME_ONLY).write_strings(names);
            }
        }
    }
}

struct RequestData {
    state: RequestState,
    request_id: Option<i32>,
    suspend_policy: SuspendPolicy,
    filters: Vec<Modifier>,
}

struct RequestInner {
    kind: EventRequestKind,
    vm: Weak<VmShared>,
    data: Mutex<RequestData>,
    // Serializes set/clear/delete so racing callers produce one wire exchange
    transition: tokio::sync::Mutex<()>,
}

/// Handle to one event request. Clones share the same request.
#[derive(Clone)]
pub struct EventRequest {
    inner: Arc<RequestInner>,
}

impl EventRequest {
    fn new(kind: EventRequestKind, vm: Weak<VmShared>) -> Self {
        Self {
            inner: Arc::new(RequestInner {
                kind,
                vm,
                data: Mutex::new(RequestData {
                    state: RequestState::Disabled,
                    request_id: None,
                    suspend_policy: SuspendPolicy::default(),
                    filters: Vec::new(),
                }),
                transition: tokio::sync::Mutex::new(()),
            }),
        }
    }

    fn data(&self) -> std::sync::MutexGuard<'_, RequestData> {
        lock(&self.inner.data, "event request")
    }

    pub fn kind(&self) -> &EventRequestKind {
        &self.inner.kind
    }

    pub fn event_kind(&self) -> EventKind {
        self.inner.kind.event_kind()
    }

    pub fn state(&self) -> RequestState {
        self.data().state
    }

    pub fn is_enabled(&self) -> bool {
        self.state() == RequestState::Enabled
    }

    /// Agent-assigned id. Only meaningful while enabled.
    pub fn request_id(&self) -> Option<i32> {
        self.data().request_id
    }

    pub fn suspend_policy(&self) -> SuspendPolicy {
        self.data().suspend_policy
    }

    pub fn filters(&self) -> Vec<Modifier> {
        self.data().filters.clone()
    }

    pub fn same_as(&self, other: &EventRequest) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn require_disabled(data: &RequestData, operation: &str) -> SdbResult<()> {
        match data.state {
            RequestState::Disabled => Ok(()),
            state => Err(SdbError::InvalidState(format!(
                "Cannot {} a request that is {:?}",
                operation, state
            ))),
        }
    }

    // Holds the transition lock for the duration of a local edit. Fails while
    // a set or clear is on the wire, since its payload is already built.
    fn edit<T>(&self, operation: &str, f: impl FnOnce(&mut RequestData) -> T) -> SdbResult<T> {
        let _transition = self.inner.transition.try_lock().map_err(|_| {
            SdbError::InvalidState(format!(
                "Cannot {} a request while it is being enabled or disabled",
                operation
            ))
        })?;
        let mut data = self.data();
        Self::require_disabled(&data, operation)?;
        Ok(f(&mut data))
    }

    /// Append a filter. Only allowed while disabled.
    pub fn add_filter(&self, modifier: Modifier) -> SdbResult<()> {
        self.edit("add a filter to", |data| data.filters.push(modifier))
    }

    /// Only allowed while disabled
    pub fn set_suspend_policy(&self, policy: SuspendPolicy) -> SdbResult<()> {
        self.edit("change the suspend policy of", |data| data.suspend_policy = policy)
    }

    fn vm(&self) -> SdbResult<Arc<VmShared>> {
        self.inner.vm.upgrade().ok_or(SdbError::ConnectionClosed)
    }

    /// Register the request with the agent (EventRequest.Set).
    ///
    /// A no-op when already enabled.
    pub async fn enable(&self) -> SdbResult<()> {
        let _transition = self.inner.transition.lock().await;

        let (suspend_policy, filters) = {
            let data = self.data();
            match data.state {
                RequestState::Enabled => return Ok(()),
                RequestState::Deleted => {
                    return Err(SdbError::InvalidState(
                        "Cannot enable a deleted request".to_string(),
                    ))
                }
                RequestState::Disabled => (data.suspend_policy, data.filters.clone()),
            }
        };

        let vm = self.vm()?;
        // Step enables for different requests are serialized so the
        // one-step-per-thread check cannot be raced
        let _step_guard = match self.inner.kind.step_thread() {
            Some(thread) => {
                let guard = vm.requests.step_transition.lock().await;
                vm.requests.check_no_enabled_step(thread, Some(self))?;
                Some(guard)
            }
            None => None,
        };

        let version = vm.version();
        self.inner.kind.check_version(version)?;

        let mut w = PacketWriter::new(command_sets::EVENT_REQUEST, event_commands::SET);
        w.write_u8(self.event_kind().as_u8())
            .write_u8(suspend_policy.as_u8());

        // The modifier count is a single byte, written before the modifiers
        let implied = usize::from(self.inner.kind.has_modifier());
        let count = u8::try_from(filters.len() + implied).map_err(|_| {
            SdbError::InvalidState(format!("Too many filters: {}", filters.len()))
        })?;
        w.write_u8(count);
        self.inner.kind.write_modifier(&mut w, version);
        for filter in &filters {
            filter.write(&mut w);
        }

        let reply = vm.request(w).await?;
        let request_id = vm.reader(reply.data()).read_i32()?;

        let mut data = self.data();
        data.state = RequestState::Enabled;
        data.request_id = Some(request_id);
        debug!(
            "Enabled {:?} request id={}",
            self.event_kind(),
            request_id
        );
        Ok(())
    }

    /// Unregister the request (EventRequest.Clear). A no-op when already disabled.
    pub async fn disable(&self) -> SdbResult<()> {
        let _transition = self.inner.transition.lock().await;
        self.disable_locked().await
    }

    async fn disable_locked(&self) -> SdbResult<()> {
        let request_id = {
            let data = self.data();
            match (data.state, data.request_id) {
                (RequestState::Disabled, _) => return Ok(()),
                (RequestState::Deleted, _) => {
                    return Err(SdbError::InvalidState(
                        "Cannot disable a deleted request".to_string(),
                    ))
                }
                (RequestState::Enabled, Some(id)) => id,
                (RequestState::Enabled, None) => {
                    return Err(SdbError::InvalidState(
                        "Enabled request has no id".to_string(),
                    ))
                }
            }
        };

        let vm = self.vm()?;
        let mut w = PacketWriter::new(command_sets::EVENT_REQUEST, event_commands::CLEAR);
        w.write_u8(self.event_kind().as_u8()).write_i32(request_id);
        vm.request(w).await?;

        let mut data = self.data();
        data.state = RequestState::Disabled;
        data.request_id = None;
        debug!(
            "Disabled {:?} request id={}",
            self.event_kind(),
            request_id
        );
        Ok(())
    }

    /// Disable, drop from the manager and mark deleted. Terminal.
    pub async fn delete(&self) -> SdbResult<()> {
        let _transition = self.inner.transition.lock().await;

        if self.state() == RequestState::Deleted {
            return Err(SdbError::InvalidState(
                "Request is already deleted".to_string(),
            ));
        }

        self.disable_locked().await?;

        if let Some(vm) = self.inner.vm.upgrade() {
            vm.requests.remove(self);
        }
        self.data().state = RequestState::Deleted;
        debug!("Deleted {:?} request", self.event_kind());
        Ok(())
    }

    /// Local transition used when the agent drops registrations wholesale
    fn mark(&self, state: RequestState) {
        let mut data = self.data();
        if data.state != RequestState::Deleted {
            data.state = state;
            data.request_id = None;
        }
    }
}

impl PartialEq for EventRequest {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl Eq for EventRequest {}

impl fmt::Debug for EventRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.data();
        f.debug_struct("EventRequest")
            .field("kind", &self.inner.kind)
            .field("state", &data.state)
            .field("request_id", &data.request_id)
            .field("suspend_policy", &data.suspend_policy)
            .field("filters", &data.filters)
            .finish()
    }
}

/// Live requests of one connection
pub struct EventRequestManager {
    vm: Weak<VmShared>,
    lists: Mutex<HashMap<EventKind, Vec<EventRequest>>>,
    step_transition: tokio::sync::Mutex<()>,
}

impl EventRequestManager {
    pub(crate) fn new(vm: Weak<VmShared>) -> Self {
        Self {
            vm,
            lists: Mutex::new(HashMap::new()),
            step_transition: tokio::sync::Mutex::new(()),
        }
    }

    /// Create a disabled request and add it to the live list for its kind
    pub fn create(&self, kind: EventRequestKind) -> SdbResult<EventRequest> {
        if let Some(thread) = kind.step_thread() {
            self.check_no_enabled_step(thread, None)?;
        }

        let request = EventRequest::new(kind, self.vm.clone());
        lock(&self.lists, "event requests")
            .entry(request.event_kind())
            .or_default()
            .push(request.clone());
        Ok(request)
    }

    pub fn create_breakpoint(&self, method: &MethodMirror, il_offset: i64) -> SdbResult<EventRequest> {
        self.create(EventRequestKind::Breakpoint {
            method: method.clone(),
            il_offset,
        })
    }

    /// Fails with `DuplicateRequest` if `thread` already has an enabled step request
    pub fn create_step(
        &self,
        thread: &ThreadMirror,
        size: StepSize,
        depth: StepDepth,
    ) -> SdbResult<EventRequest> {
        self.create(EventRequestKind::Step {
            thread: thread.clone(),
            size,
            depth,
            filter: step_filters::NONE,
        })
    }

    pub fn create_exception(
        &self,
        exception_type: Option<&TypeMirror>,
        caught: bool,
        uncaught: bool,
    ) -> SdbResult<EventRequest> {
        self.create(EventRequestKind::Exception {
            exception_type: exception_type.cloned(),
            caught,
            uncaught,
            subclasses: true,
        })
    }

    pub fn create_type_load(&self) -> SdbResult<EventRequest> {
        self.create(EventRequestKind::TypeLoad)
    }

    pub fn create_appdomain_create(&self) -> SdbResult<EventRequest> {
        self.create(EventRequestKind::AppDomainCreate)
    }

    pub fn create_appdomain_unload(&self) -> SdbResult<EventRequest> {
        self.create(EventRequestKind::AppDomainUnload)
    }

    pub fn create_thread_start(&self) -> SdbResult<EventRequest> {
        self.create(EventRequestKind::ThreadStart)
    }

    pub fn create_thread_death(&self) -> SdbResult<EventRequest> {
        self.create(EventRequestKind::ThreadDeath)
    }

    pub fn create_method_entry(&self) -> SdbResult<EventRequest> {
        self.create(EventRequestKind::MethodEntry)
    }

    pub fn create_method_exit(&self) -> SdbResult<EventRequest> {
        self.create(EventRequestKind::MethodExit)
    }

    pub fn create_vm_death(&self) -> SdbResult<EventRequest> {
        self.create(EventRequestKind::VmDeath)
    }

    pub fn create_assembly_load(&self) -> SdbResult<EventRequest> {
        self.create(EventRequestKind::AssemblyLoad)
    }

    pub fn create_assembly_unload(&self) -> SdbResult<EventRequest> {
        self.create(EventRequestKind::AssemblyUnload)
    }

    /// Live requests of one kind, in creation order
    pub fn requests(&self, kind: EventKind) -> Vec<EventRequest> {
        lock(&self.lists, "event requests")
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }

    pub fn breakpoint_requests(&self) -> Vec<EventRequest> {
        self.requests(EventKind::Breakpoint)
    }

    pub fn step_requests(&self) -> Vec<EventRequest> {
        self.requests(EventKind::Step)
    }

    /// Map a received event back to the request that fired it
    pub fn find(&self, kind: EventKind, request_id: i32) -> Option<EventRequest> {
        self.requests(kind)
            .into_iter()
            .find(|request| request.request_id() == Some(request_id))
    }

    /// Drop every breakpoint on the agent side (EventRequest.ClearAllBreakpoints).
    ///
    /// Breakpoint requests stay in the live list, disabled.
    pub async fn clear_all_breakpoints(&self) -> SdbResult<()> {
        let vm = self.vm.upgrade().ok_or(SdbError::ConnectionClosed)?;
        let w = PacketWriter::new(
            command_sets::EVENT_REQUEST,
            event_commands::CLEAR_ALL_BREAKPOINTS,
        );
        vm.request(w).await?;

        let breakpoints = self.breakpoint_requests();
        for request in &breakpoints {
            request.mark(RequestState::Disabled);
        }
        info!("Cleared {} breakpoint request(s)", breakpoints.len());
        Ok(())
    }

    pub(crate) fn check_no_enabled_step(
        &self,
        thread: &ThreadMirror,
        except: Option<&EventRequest>,
    ) -> SdbResult<()> {
        let conflict = self.step_requests().into_iter().any(|request| {
            except.map_or(true, |me| !request.same_as(me))
                && request.inner.kind.step_thread() == Some(thread)
                && request.is_enabled()
        });

        if conflict {
            return Err(SdbError::DuplicateRequest(format!(
                "Thread {:?} already has an enabled step request",
                thread
            )));
        }
        Ok(())
    }

    fn remove(&self, request: &EventRequest) {
        let mut lists = lock(&self.lists, "event requests");
        if let Some(list) = lists.get_mut(&request.event_kind()) {
            list.retain(|r| !r.same_as(request));
        }
    }

    /// Forget every request. Outstanding handles become deleted.
    pub(crate) fn clear(&self) {
        let lists = std::mem::take(&mut *lock(&self.lists, "event requests"));
        for request in lists.into_values().flatten() {
            request.mark(RequestState::Deleted);
        }
    }
}

impl fmt::Debug for EventRequestManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lists = lock(&self.lists, "event requests");
        f.debug_struct("EventRequestManager")
            .field("live", &lists.values().map(Vec::len).sum::<usize>())
            .finish()
    }
}
