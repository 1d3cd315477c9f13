// Type command implementations
//
// Commands for working with classes, structs, interfaces and arrays

use crate::codec::{PacketReader, PacketWriter};
use crate::commands::{command_sets, type_commands};
use crate::mirror::{
    AssemblyMirror, FieldMirror, MethodMirror, MirrorCache, MirrorInfo, ModuleMirror,
    TypedMirror, TypeMirror,
};
use crate::protocol::{ProtocolVersion, SdbError, SdbResult};
use crate::value::{read_values, Value};
use serde::Serialize;
use std::sync::Arc;

// Generic type definition reference appeared in 2.12, type arguments in 2.15
pub const GENERIC_TYPE_DEFINITION_VERSION: ProtocolVersion = ProtocolVersion::new(2, 12);
pub const TYPE_ARGUMENTS_VERSION: ProtocolVersion = ProtocolVersion::new(2, 15);

// Flag bits of the Type.GetInfo flags byte
const TYPE_IS_BYREF: u8 = 0x01;
const TYPE_IS_POINTER: u8 = 0x02;
const TYPE_IS_PRIMITIVE: u8 = 0x04;
const TYPE_IS_VALUETYPE: u8 = 0x08;
const TYPE_IS_ENUM: u8 = 0x10;
const TYPE_IS_GENERIC_DEFINITION: u8 = 0x20;
const TYPE_IS_GENERIC: u8 = 0x40;

/// Type metadata (Type.GetInfo)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypeInfo {
    pub namespace: String,
    pub name: String,
    pub full_name: String,
    pub assembly: Option<AssemblyMirror>,
    pub module: Option<ModuleMirror>,
    pub base_type: Option<TypeMirror>,
    pub element_type: Option<TypeMirror>,
    pub token: i32,
    pub rank: u8,
    pub attributes: i32,
    pub is_byref: bool,
    pub is_pointer: bool,
    pub is_primitive: bool,
    pub is_valuetype: bool,
    pub is_enum: bool,
    pub is_generic_type_definition: bool,
    pub is_generic_type: bool,
    pub nested_types: Vec<TypeMirror>,
    /// The "general type" this type was instantiated from. Absent before 2.12.
    pub generic_type_definition: Option<TypeMirror>,
    /// Absent before 2.15
    pub type_arguments: Option<Vec<TypeMirror>>,
}

impl TypeInfo {
    /// Decode a Type.GetInfo reply for the reader's negotiated version
    pub fn decode(r: &mut PacketReader<'_>, cache: &MirrorCache) -> SdbResult<Self> {
        let namespace = r.read_string()?;
        let name = r.read_string()?;
        let full_name = r.read_string()?;
        let assembly = cache.resolve_as(r.read_id()?);
        let module = cache.resolve_as(r.read_id()?);
        let base_type = cache.resolve_as(r.read_id()?);
        let element_type = cache.resolve_as(r.read_id()?);
        let token = r.read_i32()?;
        let rank = r.read_u8()?;
        let attributes = r.read_i32()?;
        let flags = r.read_u8()?;

        let nested_types = resolve_all(cache, r.read_ids()?);

        let generic_type_definition = if r.version() >= GENERIC_TYPE_DEFINITION_VERSION {
            cache.resolve_as(r.read_id()?)
        } else {
            None
        };

        let type_arguments = if r.version() >= TYPE_ARGUMENTS_VERSION {
            Some(resolve_all(cache, r.read_ids()?))
        } else {
            None
        };

        Ok(Self {
            namespace,
            name,
            full_name,
            assembly,
            module,
            base_type,
            element_type,
            token,
            rank,
            attributes,
            is_byref: flags & TYPE_IS_BYREF != 0,
            is_pointer: flags & TYPE_IS_POINTER != 0,
            is_primitive: flags & TYPE_IS_PRIMITIVE != 0,
            is_valuetype: flags & TYPE_IS_VALUETYPE != 0,
            is_enum: flags & TYPE_IS_ENUM != 0,
            is_generic_type_definition: flags & TYPE_IS_GENERIC_DEFINITION != 0,
            is_generic_type: flags & TYPE_IS_GENERIC != 0,
            nested_types,
            generic_type_definition,
            type_arguments,
        })
    }
}

/// Field metadata, decoded inline from Type.GetFields
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldInfo {
    pub name: String,
    pub field_type: Option<TypeMirror>,
    pub attributes: i32,
}

pub(crate) fn resolve_all<M: TypedMirror>(cache: &MirrorCache, ids: Vec<u32>) -> Vec<M> {
    ids.into_iter().filter_map(|id| cache.resolve_as(id)).collect()
}

impl TypeMirror {
    /// Type metadata. Fetched once per mirror.
    pub async fn info(&self) -> SdbResult<Arc<TypeInfo>> {
        let mirror = self.mirror();
        if let Some(MirrorInfo::Type(info)) = mirror.cached_info() {
            return Ok(info.clone());
        }

        let vm = mirror.vm()?;
        let info = mirror
            .info_or_fetch(|| async {
                let mut w = PacketWriter::new(command_sets::TYPE, type_commands::GET_INFO);
                w.write_id(self.id());
                let reply = vm.request(w).await?;
                let mut r = vm.reader(reply.data());
                Ok(MirrorInfo::Type(Arc::new(TypeInfo::decode(&mut r, &vm.mirrors)?)))
            })
            .await?;

        match info {
            MirrorInfo::Type(info) => Ok(info.clone()),
            _ => Err(SdbError::Decode(format!("{:?} cached non-type metadata", self))),
        }
    }

    pub async fn name(&self) -> SdbResult<String> {
        Ok(self.info().await?.name.clone())
    }

    pub async fn full_name(&self) -> SdbResult<String> {
        Ok(self.info().await?.full_name.clone())
    }

    pub async fn methods(&self) -> SdbResult<Vec<MethodMirror>> {
        let vm = self.mirror().vm()?;
        let mut w = PacketWriter::new(command_sets::TYPE, type_commands::GET_METHODS);
        w.write_id(self.id());

        let reply = vm.request(w).await?;
        let ids = vm.reader(reply.data()).read_ids()?;
        Ok(resolve_all(&vm.mirrors, ids))
    }

    /// Fields declared by this type. Name and metadata are recorded on each
    /// field mirror as they are decoded.
    pub async fn fields(&self) -> SdbResult<Vec<FieldMirror>> {
        let vm = self.mirror().vm()?;
        let mut w = PacketWriter::new(command_sets::TYPE, type_commands::GET_FIELDS);
        w.write_id(self.id());

        let reply = vm.request(w).await?;
        let mut r = vm.reader(reply.data());
        let count = r.read_count()?;
        let mut fields = Vec::with_capacity(count.min(r.remaining()));

        for _ in 0..count {
            let id = r.read_id()?;
            let name = r.read_string()?;
            let field_type = vm.mirrors.resolve_as(r.read_id()?);
            let attributes = r.read_i32()?;

            let Some(field) = vm.mirrors.resolve_as::<FieldMirror>(id) else {
                continue;
            };
            field.mirror().remember_name(name.clone());
            field.mirror().remember_info(MirrorInfo::Field(Arc::new(FieldInfo {
                name,
                field_type,
                attributes,
            })));
            fields.push(field);
        }

        Ok(fields)
    }

    /// Values of static fields, in the order given
    pub async fn static_values(&self, fields: &[FieldMirror]) -> SdbResult<Vec<Value>> {
        let vm = self.mirror().vm()?;
        let ids: Vec<_> = fields.iter().map(FieldMirror::id).collect();
        let mut w = PacketWriter::new(command_sets::TYPE, type_commands::GET_VALUES);
        w.write_id(self.id()).write_ids(&ids);

        let reply = vm.request(w).await?;
        let mut r = vm.reader(reply.data());
        read_values(&mut r, &vm.mirrors, fields.len())
    }

    pub async fn source_files(&self) -> SdbResult<Vec<String>> {
        let vm = self.mirror().vm()?;
        let mut w = PacketWriter::new(command_sets::TYPE, type_commands::GET_SOURCE_FILES);
        w.write_id(self.id());

        let reply = vm.request(w).await?;
        vm.reader(reply.data()).read_strings()
    }

    /// Whether a value of type `other` can be stored in a location of this type
    pub async fn is_assignable_from(&self, other: &TypeMirror) -> SdbResult<bool> {
        let vm = self.mirror().vm()?;
        let mut w = PacketWriter::new(command_sets::TYPE, type_commands::IS_ASSIGNABLE_FROM);
        w.write_id(self.id()).write_id(other.id());

        let reply = vm.request(w).await?;
        vm.reader(reply.data()).read_bool()
    }
}

impl FieldMirror {
    /// Metadata recorded when the field was listed by its declaring type
    pub fn info(&self) -> Option<Arc<FieldInfo>> {
        match self.mirror().cached_info() {
            Some(MirrorInfo::Field(info)) => Some(info.clone()),
            _ => None,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.mirror().cached_name()
    }
}
