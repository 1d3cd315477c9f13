// Mirror cache
//
// Turns opaque remote ids into canonical local proxies. One cache per
// connection, keyed by (kind, id); entries live until the connection goes away.

use crate::codec::{RemoteId, NULL_ID};
use crate::method::MethodInfo;
use crate::poison::lock;
use crate::protocol::{SdbError, SdbResult};
use crate::reftype::{FieldInfo, TypeInfo};
use crate::vm::VmShared;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::OnceCell;

/// Kind of remote entity a mirror stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MirrorKind {
    AppDomain,
    Assembly,
    Module,
    Type,
    Method,
    Field,
    Property,
    Thread,
    Object,
}

/// Metadata fetched once and kept with the mirror
#[derive(Debug, Clone)]
pub(crate) enum MirrorInfo {
    Type(Arc<TypeInfo>),
    Method(Arc<MethodInfo>),
    Field(Arc<FieldInfo>),
}

struct MirrorInner {
    kind: MirrorKind,
    id: RemoteId,
    vm: Weak<VmShared>,
    name: OnceCell<String>,
    info: OnceCell<MirrorInfo>,
}

/// Local proxy for one remote entity.
///
/// Cloning is cheap and preserves identity. Two mirrors are equal only if
/// they are the same cache entry.
#[derive(Clone)]
pub struct Mirror {
    inner: Arc<MirrorInner>,
}

impl Mirror {
    fn new(kind: MirrorKind, id: RemoteId, vm: Weak<VmShared>) -> Self {
        Self {
            inner: Arc::new(MirrorInner {
                kind,
                id,
                vm,
                name: OnceCell::new(),
                info: OnceCell::new(),
            }),
        }
    }

    pub fn kind(&self) -> MirrorKind {
        self.inner.kind
    }

    pub fn id(&self) -> RemoteId {
        self.inner.id
    }

    /// Same cache entry (not merely the same id)
    pub fn same_as(&self, other: &Mirror) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Owning connection, if it is still alive
    pub(crate) fn vm(&self) -> SdbResult<Arc<VmShared>> {
        self.inner.vm.upgrade().ok_or(SdbError::ConnectionClosed)
    }

    pub(crate) fn cached_name(&self) -> Option<&str> {
        self.inner.name.get().map(String::as_str)
    }

    pub(crate) async fn name_or_fetch<F, Fut>(&self, fetch: F) -> SdbResult<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SdbResult<String>>,
    {
        self.inner.name.get_or_try_init(fetch).await.cloned()
    }

    /// Record a name decoded inline. The first recorded name wins.
    pub(crate) fn remember_name(&self, name: String) {
        let _ = self.inner.name.set(name);
    }

    pub(crate) fn cached_info(&self) -> Option<&MirrorInfo> {
        self.inner.info.get()
    }

    pub(crate) async fn info_or_fetch<F, Fut>(&self, fetch: F) -> SdbResult<&MirrorInfo>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SdbResult<MirrorInfo>>,
    {
        self.inner.info.get_or_try_init(fetch).await
    }

    /// Record metadata decoded inline. The first recorded value wins.
    pub(crate) fn remember_info(&self, info: MirrorInfo) {
        let _ = self.inner.info.set(info);
    }
}

impl PartialEq for Mirror {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl Eq for Mirror {}

impl Hash for Mirror {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.kind.hash(state);
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Mirror {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@{:x}", self.inner.kind, self.inner.id)
    }
}

#[derive(Serialize)]
struct MirrorRef {
    kind: MirrorKind,
    id: RemoteId,
}

impl Serialize for Mirror {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        MirrorRef {
            kind: self.kind(),
            id: self.id(),
        }
        .serialize(serializer)
    }
}

/// A mirror newtype bound to one `MirrorKind`
pub trait TypedMirror: Clone + Sized {
    const KIND: MirrorKind;

    fn from_mirror_unchecked(mirror: Mirror) -> Self;

    fn mirror(&self) -> &Mirror;

    fn id(&self) -> RemoteId {
        self.mirror().id()
    }

    fn from_mirror(mirror: Mirror) -> Option<Self> {
        (mirror.kind() == Self::KIND).then(|| Self::from_mirror_unchecked(mirror))
    }
}

macro_rules! typed_mirror {
    ($(#[$meta:meta])* $name:ident => $kind:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, Serialize)]
        #[serde(transparent)]
        pub struct $name(Mirror);

        impl TypedMirror for $name {
            const KIND: MirrorKind = MirrorKind::$kind;

            fn from_mirror_unchecked(mirror: Mirror) -> Self {
                Self(mirror)
            }

            fn mirror(&self) -> &Mirror {
                &self.0
            }
        }

        impl $name {
            pub fn id(&self) -> RemoteId {
                self.0.id()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(&self.0, f)
            }
        }
    };
}

typed_mirror!(
    /// Application domain
    AppDomainMirror => AppDomain
);
typed_mirror!(AssemblyMirror => Assembly);
typed_mirror!(ModuleMirror => Module);
typed_mirror!(
    /// Class, struct, interface, enum or array type
    TypeMirror => Type
);
typed_mirror!(MethodMirror => Method);
typed_mirror!(FieldMirror => Field);
typed_mirror!(PropertyMirror => Property);
typed_mirror!(ThreadMirror => Thread);
typed_mirror!(
    /// Heap object (including strings and arrays)
    ObjectMirror => Object
);

/// Canonical (kind, id) -> mirror map for one connection
pub struct MirrorCache {
    vm: Weak<VmShared>,
    entries: Mutex<HashMap<(MirrorKind, RemoteId), Mirror>>,
}

impl MirrorCache {
    pub(crate) fn new(vm: Weak<VmShared>) -> Self {
        Self {
            vm,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// A cache with no connection behind it. Mirrors it hands out can carry
    /// identity and inline metadata, but remote queries fail with
    /// `ConnectionClosed`.
    pub fn detached() -> Self {
        Self::new(Weak::new())
    }

    /// Return the mirror for `(kind, id)`, creating it on first sight.
    ///
    /// The null id maps to `None` and never enters the cache.
    pub fn resolve(&self, kind: MirrorKind, id: RemoteId) -> Option<Mirror> {
        if id == NULL_ID {
            return None;
        }

        let mut entries = lock(&self.entries, "mirror cache");
        let mirror = entries
            .entry((kind, id))
            .or_insert_with(|| Mirror::new(kind, id, self.vm.clone()));
        Some(mirror.clone())
    }

    pub fn resolve_as<M: TypedMirror>(&self, id: RemoteId) -> Option<M> {
        self.resolve(M::KIND, id).map(M::from_mirror_unchecked)
    }

    /// Lookup without creating
    pub fn get(&self, kind: MirrorKind, id: RemoteId) -> Option<Mirror> {
        lock(&self.entries, "mirror cache").get(&(kind, id)).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries, "mirror cache").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry. Only called when the connection goes away.
    pub(crate) fn clear(&self) {
        lock(&self.entries, "mirror cache").clear();
    }
}

impl fmt::Debug for MirrorCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MirrorCache").field("len", &self.len()).finish()
    }
}
