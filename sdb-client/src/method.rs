// Method command implementations
//
// Names, signatures and locals of methods

use crate::codec::{PacketReader, PacketWriter};
use crate::commands::{command_sets, method_commands};
use crate::mirror::{MethodMirror, MirrorCache, MirrorInfo, TypeMirror, TypedMirror};
use crate::protocol::{ProtocolVersion, SdbError, SdbResult};
use crate::reftype::resolve_all;
use serde::Serialize;
use std::sync::Arc;

// Generic method flags and definition appeared in 2.12, type arguments in 2.15
pub const GENERIC_METHOD_VERSION: ProtocolVersion = ProtocolVersion::new(2, 12);
pub const METHOD_TYPE_ARGUMENTS_VERSION: ProtocolVersion = ProtocolVersion::new(2, 15);
// Locals replies lead with the method's lexical scopes from 2.43
pub const LOCAL_SCOPES_VERSION: ProtocolVersion = ProtocolVersion::new(2, 43);

const METHOD_IS_GENERIC_DEFINITION: u8 = 0x01;
const METHOD_IS_GENERIC: u8 = 0x02;

/// Method metadata (Method.GetInfo)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MethodInfo {
    pub attributes: i32,
    pub impl_attributes: i32,
    pub token: i32,
    pub is_generic_method_definition: bool,
    pub is_generic_method: bool,
    /// Absent before 2.12
    pub generic_method_definition: Option<MethodMirror>,
    /// Only sent for generic methods, from 2.15
    pub type_arguments: Option<Vec<TypeMirror>>,
}

impl MethodInfo {
    pub fn decode(r: &mut PacketReader<'_>, cache: &MirrorCache) -> SdbResult<Self> {
        let attributes = r.read_i32()?;
        let impl_attributes = r.read_i32()?;
        let token = r.read_i32()?;

        let mut info = Self {
            attributes,
            impl_attributes,
            token,
            is_generic_method_definition: false,
            is_generic_method: false,
            generic_method_definition: None,
            type_arguments: None,
        };

        if r.version() >= GENERIC_METHOD_VERSION {
            let flags = r.read_u8()?;
            info.is_generic_method_definition = flags & METHOD_IS_GENERIC_DEFINITION != 0;
            info.is_generic_method = flags & METHOD_IS_GENERIC != 0;
            info.generic_method_definition = cache.resolve_as(r.read_id()?);

            if r.version() >= METHOD_TYPE_ARGUMENTS_VERSION && info.is_generic_method {
                info.type_arguments = Some(resolve_all(cache, r.read_ids()?));
            }
        }

        Ok(info)
    }
}

/// Signature information (Method.GetParamInfo)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamInfo {
    pub call_convention: i32,
    pub generic_param_count: i32,
    pub return_type: Option<TypeMirror>,
    pub param_types: Vec<Option<TypeMirror>>,
    pub param_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalVariable {
    /// Position to pass to `StackFrame::values`
    pub index: i32,
    pub name: String,
    pub local_type: Option<TypeMirror>,
    /// IL offset range where the variable is live
    pub live_range: (i32, i32),
}

/// IL offset range of a lexical scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LocalScope {
    pub start: i32,
    pub end: i32,
}

/// Reply to Method.GetLocalsInfo
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalsInfo {
    /// Empty before 2.43
    pub scopes: Vec<LocalScope>,
    pub locals: Vec<LocalVariable>,
}

impl MethodMirror {
    pub async fn name(&self) -> SdbResult<String> {
        let mirror = self.mirror();
        if let Some(name) = mirror.cached_name() {
            return Ok(name.to_string());
        }

        let vm = mirror.vm()?;
        mirror
            .name_or_fetch(|| async {
                let mut w = PacketWriter::new(command_sets::METHOD, method_commands::GET_NAME);
                w.write_id(self.id());
                let reply = vm.request(w).await?;
                vm.reader(reply.data()).read_string()
            })
            .await
    }

    pub async fn declaring_type(&self) -> SdbResult<TypeMirror> {
        let vm = self.mirror().vm()?;
        let mut w = PacketWriter::new(command_sets::METHOD, method_commands::GET_DECLARING_TYPE);
        w.write_id(self.id());

        let reply = vm.request(w).await?;
        let id = vm.reader(reply.data()).read_id()?;
        vm.mirrors
            .resolve_as(id)
            .ok_or_else(|| SdbError::Decode(format!("{:?} has no declaring type", self)))
    }

    /// Method metadata. Fetched once per mirror.
    pub async fn info(&self) -> SdbResult<Arc<MethodInfo>> {
        let mirror = self.mirror();
        if let Some(MirrorInfo::Method(info)) = mirror.cached_info() {
            return Ok(info.clone());
        }

        let vm = mirror.vm()?;
        let info = mirror
            .info_or_fetch(|| async {
                let mut w = PacketWriter::new(command_sets::METHOD, method_commands::GET_INFO);
                w.write_id(self.id());
                let reply = vm.request(w).await?;
                let mut r = vm.reader(reply.data());
                Ok(MirrorInfo::Method(Arc::new(MethodInfo::decode(&mut r, &vm.mirrors)?)))
            })
            .await?;

        match info {
            MirrorInfo::Method(info) => Ok(info.clone()),
            _ => Err(SdbError::Decode(format!("{:?} cached non-method metadata", self))),
        }
    }

    pub async fn param_info(&self) -> SdbResult<ParamInfo> {
        let vm = self.mirror().vm()?;
        let mut w = PacketWriter::new(command_sets::METHOD, method_commands::GET_PARAM_INFO);
        w.write_id(self.id());

        let reply = vm.request(w).await?;
        let mut r = vm.reader(reply.data());

        let call_convention = r.read_i32()?;
        let param_count = r.read_count()?;
        let generic_param_count = r.read_i32()?;
        let return_type = vm.mirrors.resolve_as(r.read_id()?);

        let mut param_types = Vec::with_capacity(param_count.min(r.remaining()));
        for _ in 0..param_count {
            param_types.push(vm.mirrors.resolve_as(r.read_id()?));
        }
        let mut param_names = Vec::with_capacity(param_count.min(r.remaining()));
        for _ in 0..param_count {
            param_names.push(r.read_string()?);
        }

        Ok(ParamInfo {
            call_convention,
            generic_param_count,
            return_type,
            param_types,
            param_names,
        })
    }

    /// Local variables (Method.GetLocalsInfo)
    pub async fn locals(&self) -> SdbResult<Vec<LocalVariable>> {
        Ok(self.locals_info().await?.locals)
    }

    /// Local variables plus, from 2.43, the method's scopes
    pub async fn locals_info(&self) -> SdbResult<LocalsInfo> {
        let vm = self.mirror().vm()?;
        let mut w = PacketWriter::new(command_sets::METHOD, method_commands::GET_LOCALS_INFO);
        w.write_id(self.id());

        let reply = vm.request(w).await?;
        let mut r = vm.reader(reply.data());
        LocalsInfo::decode(&mut r, &vm.mirrors)
    }
}

impl LocalsInfo {
    pub fn decode(r: &mut PacketReader<'_>, cache: &MirrorCache) -> SdbResult<Self> {
        let scopes = if r.version() >= LOCAL_SCOPES_VERSION {
            decode_scopes(r)?
        } else {
            Vec::new()
        };
        let locals = decode_locals(r, cache)?;
        Ok(Self { scopes, locals })
    }
}

// Each scope is sent as (start relative to the previous scope's start, length)
fn decode_scopes(r: &mut PacketReader<'_>) -> SdbResult<Vec<LocalScope>> {
    let count = r.read_count()?;
    let mut scopes = Vec::with_capacity(count.min(r.remaining()));
    let mut last_start = 0i32;
    for _ in 0..count {
        let start = last_start.wrapping_add(r.read_i32()?);
        let end = start.wrapping_add(r.read_i32()?);
        scopes.push(LocalScope { start, end });
        last_start = start;
    }
    Ok(scopes)
}

// Layout: count, then the types, names, range starts and range ends as
// four parallel arrays
fn decode_locals(r: &mut PacketReader<'_>, cache: &MirrorCache) -> SdbResult<Vec<LocalVariable>> {
    let count = r.read_count()?;

    let mut types = Vec::with_capacity(count.min(r.remaining()));
    for _ in 0..count {
        types.push(cache.resolve_as(r.read_id()?));
    }
    let mut names = Vec::with_capacity(count.min(r.remaining()));
    for _ in 0..count {
        names.push(r.read_string()?);
    }
    let mut starts = Vec::with_capacity(count.min(r.remaining()));
    for _ in 0..count {
        starts.push(r.read_i32()?);
    }

    let mut locals = Vec::with_capacity(count);
    for (index, ((local_type, name), start)) in types.into_iter().zip(names).zip(starts).enumerate() {
        let end = r.read_i32()?;
        locals.push(LocalVariable {
            index: index as i32,
            name,
            local_type,
            live_range: (start, end),
        });
    }

    Ok(locals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockAgent;

    fn method_info_reply(version: ProtocolVersion, generic: bool) -> Vec<u8> {
        let mut w = PacketWriter::new(0, 0);
        w.write_i32(0x0086).write_i32(0).write_i32(0x0600_0001);
        if version >= GENERIC_METHOD_VERSION {
            w.write_u8(if generic { METHOD_IS_GENERIC } else { 0 })
                .write_id(if generic { 0x70 } else { 0 });
            if version >= METHOD_TYPE_ARGUMENTS_VERSION && generic {
                w.write_ids(&[0x71, 0x72]);
            }
        }
        w.payload().to_vec()
    }

    #[test]
    fn test_generic_fields_gated_by_version() {
        let cache = MirrorCache::detached();

        let v11 = ProtocolVersion::new(2, 11);
        let data = method_info_reply(v11, true);
        let mut r = PacketReader::new(&data, v11);
        let info = MethodInfo::decode(&mut r, &cache).unwrap();
        assert!(r.is_empty());
        assert!(!info.is_generic_method);
        assert!(info.generic_method_definition.is_none());

        let v12 = ProtocolVersion::new(2, 12);
        let data = method_info_reply(v12, true);
        let mut r = PacketReader::new(&data, v12);
        let info = MethodInfo::decode(&mut r, &cache).unwrap();
        assert!(r.is_empty());
        assert!(info.is_generic_method);
        assert_eq!(info.generic_method_definition.unwrap().id(), 0x70);
        assert!(info.type_arguments.is_none());

        let v15 = ProtocolVersion::new(2, 15);
        let data = method_info_reply(v15, true);
        let mut r = PacketReader::new(&data, v15);
        let info = MethodInfo::decode(&mut r, &cache).unwrap();
        assert!(r.is_empty());
        assert_eq!(info.type_arguments.unwrap().len(), 2);

        // Non-generic methods carry no argument list even on new agents
        let data = method_info_reply(v15, false);
        let mut r = PacketReader::new(&data, v15);
        let info = MethodInfo::decode(&mut r, &cache).unwrap();
        assert!(r.is_empty());
        assert!(info.type_arguments.is_none());
    }

    #[tokio::test]
    async fn test_name_is_cached() {
        let (agent, vm) = MockAgent::attached(ProtocolVersion::new(2, 46)).await;
        agent.on(command_sets::METHOD, method_commands::GET_NAME, |_| {
            let mut w = PacketWriter::new(0, 0);
            w.write_string("Main");
            Ok(w.payload().to_vec())
        });

        let method: MethodMirror = vm.mirrors().resolve_as(0x10).unwrap();
        let (a, b) = tokio::join!(method.name(), method.name());
        assert_eq!(a.unwrap(), "Main");
        assert_eq!(b.unwrap(), "Main");
        assert_eq!(method.name().await.unwrap(), "Main");
        assert_eq!(agent.received(command_sets::METHOD, method_commands::GET_NAME).len(), 1);
    }

    #[tokio::test]
    async fn test_param_info_and_locals() {
        let (agent, vm) = MockAgent::attached(ProtocolVersion::new(2, 46)).await;
        agent.on(command_sets::METHOD, method_commands::GET_PARAM_INFO, |_| {
            let mut w = PacketWriter::new(0, 0);
            w.write_i32(0).write_i32(2).write_i32(0).write_id(0x1);
            w.write_id(0x2).write_id(0x3);
            w.write_string("x").write_string("y");
            Ok(w.payload().to_vec())
        });
        agent.on(command_sets::METHOD, method_commands::GET_LOCALS_INFO, |_| {
            let mut w = PacketWriter::new(0, 0);
            // No scopes
            w.write_i32(0);
            w.write_i32(2);
            w.write_id(0x2).write_id(0x4);
            w.write_string("i").write_string("s");
            w.write_i32(0).write_i32(4);
            w.write_i32(20).write_i32(16);
            Ok(w.payload().to_vec())
        });

        let method: MethodMirror = vm.mirrors().resolve_as(0x10).unwrap();
        let params = method.param_info().await.unwrap();
        assert_eq!(params.param_names, vec!["x".to_string(), "y".to_string()]);
        assert_eq!(params.param_types[1].as_ref().unwrap().id(), 0x3);
        assert_eq!(params.return_type.unwrap().id(), 0x1);

        let locals = method.locals().await.unwrap();
        assert_eq!(locals.len(), 2);
        assert_eq!(locals[1].name, "s");
        assert_eq!(locals[1].index, 1);
        assert_eq!(locals[1].live_range, (4, 16));
        // Same type id as the first parameter, same proxy
        assert!(locals[0]
            .local_type
            .as_ref()
            .unwrap()
            .mirror()
            .same_as(params.param_types[0].as_ref().unwrap().mirror()));
    }

    fn locals_reply(version: ProtocolVersion) -> Vec<u8> {
        let mut w = PacketWriter::new(0, 0);
        if version >= LOCAL_SCOPES_VERSION {
            // Scopes [0, 10) and [4, 8)
            w.write_i32(2).write_i32(0).write_i32(10).write_i32(4).write_i32(4);
        }
        w.write_i32(1)
            .write_id(0x30)
            .write_string("x")
            .write_i32(0)
            .write_i32(10);
        w.payload().to_vec()
    }

    #[test]
    fn test_locals_layout_gated_by_version() {
        let cache = MirrorCache::detached();

        let v42 = ProtocolVersion::new(2, 42);
        let data = locals_reply(v42);
        let mut r = PacketReader::new(&data, v42);
        let info = LocalsInfo::decode(&mut r, &cache).unwrap();
        assert!(r.is_empty());
        assert!(info.scopes.is_empty());
        assert_eq!(info.locals.len(), 1);
        assert_eq!(info.locals[0].name, "x");
        assert_eq!(info.locals[0].live_range, (0, 10));

        let v43 = ProtocolVersion::new(2, 43);
        let data = locals_reply(v43);
        let mut r = PacketReader::new(&data, v43);
        let info = LocalsInfo::decode(&mut r, &cache).unwrap();
        assert!(r.is_empty());
        assert_eq!(
            info.scopes,
            vec![LocalScope { start: 0, end: 10 }, LocalScope { start: 4, end: 8 }]
        );
        assert_eq!(info.locals[0].name, "x");
        assert_eq!(info.locals[0].local_type.as_ref().unwrap().id(), 0x30);
        assert_eq!(info.locals[0].live_range, (0, 10));
    }

    #[tokio::test]
    async fn test_locals_on_current_agent_skip_scopes() {
        let (agent, vm) = MockAgent::attached(ProtocolVersion::new(2, 46)).await;
        agent.on(command_sets::METHOD, method_commands::GET_LOCALS_INFO, |_| {
            Ok(locals_reply(ProtocolVersion::new(2, 46)))
        });

        let method: MethodMirror = vm.mirrors().resolve_as(0x10).unwrap();
        let info = method.locals_info().await.unwrap();
        assert_eq!(info.scopes.len(), 2);
        let locals = method.locals().await.unwrap();
        assert_eq!(locals[0].name, "x");
        assert_eq!(locals[0].live_range, (0, 10));
    }
}
