// Value codec
//
// Tagged values as they appear in field reads, locals, invoke arguments and
// results. Object and type references resolve through the mirror cache.

use crate::codec::{PacketReader, PacketWriter, NULL_ID};
use crate::commands::element_types as et;
use crate::mirror::{MirrorCache, ObjectMirror, TypeMirror};
use crate::protocol::{ProtocolVersion, SdbError, SdbResult};
use serde::Serialize;
use std::fmt;

// Pointer values carry their pointer type from 2.46
pub const TYPED_POINTER_VERSION: ProtocolVersion = ProtocolVersion::new(2, 46);

// Nested struct values deeper than this are rejected
const MAX_VALUE_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value")]
pub enum PrimitiveValue {
    Bool(bool),
    Char(u16),
    I1(i8),
    U1(u8),
    I2(i16),
    U2(u16),
    I4(i32),
    U4(u32),
    I8(i64),
    U8(u64),
    R4(f32),
    R8(f64),
    IntPtr(i64),
    UIntPtr(u64),
}

/// Boxed-free struct or enum value: its type plus field values in declaration order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructValue {
    pub ty: TypeMirror,
    pub fields: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PointerValue {
    pub address: i64,
    pub ty: Option<TypeMirror>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value")]
pub enum Value {
    Void,
    Null,
    Primitive(PrimitiveValue),
    String(ObjectMirror),
    Object(ObjectMirror),
    Array(ObjectMirror),
    Type(TypeMirror),
    Struct(StructValue),
    Enum(StructValue),
    Pointer(PointerValue),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The heap object behind a string, object or array value
    pub fn as_object(&self) -> Option<&ObjectMirror> {
        match self {
            Value::String(obj) | Value::Object(obj) | Value::Array(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_primitive(&self) -> Option<&PrimitiveValue> {
        match self {
            Value::Primitive(p) => Some(p),
            _ => None,
        }
    }
}

impl fmt::Display for PrimitiveValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimitiveValue::Bool(v) => write!(f, "(bool) {}", v),
            PrimitiveValue::Char(v) => write!(
                f,
                "(char) '{}'",
                char::from_u32(*v as u32).unwrap_or(char::REPLACEMENT_CHARACTER)
            ),
            PrimitiveValue::I1(v) => write!(f, "(sbyte) {}", v),
            PrimitiveValue::U1(v) => write!(f, "(byte) {}", v),
            PrimitiveValue::I2(v) => write!(f, "(short) {}", v),
            PrimitiveValue::U2(v) => write!(f, "(ushort) {}", v),
            PrimitiveValue::I4(v) => write!(f, "(int) {}", v),
            PrimitiveValue::U4(v) => write!(f, "(uint) {}", v),
            PrimitiveValue::I8(v) => write!(f, "(long) {}", v),
            PrimitiveValue::U8(v) => write!(f, "(ulong) {}", v),
            PrimitiveValue::R4(v) => write!(f, "(float) {}", v),
            PrimitiveValue::R8(v) => write!(f, "(double) {}", v),
            PrimitiveValue::IntPtr(v) => write!(f, "(nint) {:#x}", v),
            PrimitiveValue::UIntPtr(v) => write!(f, "(nuint) {:#x}", v),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Void => write!(f, "(void)"),
            Value::Null => write!(f, "null"),
            Value::Primitive(p) => p.fmt(f),
            Value::String(obj) => write!(f, "(string) @{:x}", obj.id()),
            Value::Object(obj) => write!(f, "(object) @{:x}", obj.id()),
            Value::Array(obj) => write!(f, "(array) @{:x}", obj.id()),
            Value::Type(ty) => write!(f, "(type) @{:x}", ty.id()),
            Value::Struct(s) => write!(f, "(struct @{:x}) {} fields", s.ty.id(), s.fields.len()),
            Value::Enum(s) => write!(f, "(enum @{:x}) {} fields", s.ty.id(), s.fields.len()),
            Value::Pointer(p) => write!(f, "(pointer) {:#x}", p.address),
        }
    }
}

/// Read one tagged value
pub fn read_value(r: &mut PacketReader<'_>, cache: &MirrorCache) -> SdbResult<Value> {
    read_value_at_depth(r, cache, 0)
}

/// Read `count` consecutive tagged values
pub fn read_values(
    r: &mut PacketReader<'_>,
    cache: &MirrorCache,
    count: usize,
) -> SdbResult<Vec<Value>> {
    let mut values = Vec::with_capacity(count.min(r.remaining()));
    for _ in 0..count {
        values.push(read_value(r, cache)?);
    }
    Ok(values)
}

fn read_value_at_depth(
    r: &mut PacketReader<'_>,
    cache: &MirrorCache,
    depth: usize,
) -> SdbResult<Value> {
    let tag = r.read_u8()?;
    read_value_by_tag(tag, r, cache, depth)
}

/// Decode the body of a value whose tag has already been read
fn read_value_by_tag(
    tag: u8,
    r: &mut PacketReader<'_>,
    cache: &MirrorCache,
    depth: usize,
) -> SdbResult<Value> {
    let primitive = match tag {
        et::VOID => return Ok(Value::Void),
        et::NULL => return Ok(Value::Null),
        // Everything narrower than 64 bits travels as an i32
        et::BOOLEAN => PrimitiveValue::Bool(r.read_i32()? != 0),
        et::CHAR => PrimitiveValue::Char(r.read_i32()? as u16),
        et::I1 => PrimitiveValue::I1(r.read_i32()? as i8),
        et::U1 => PrimitiveValue::U1(r.read_i32()? as u8),
        et::I2 => PrimitiveValue::I2(r.read_i32()? as i16),
        et::U2 => PrimitiveValue::U2(r.read_i32()? as u16),
        et::I4 => PrimitiveValue::I4(r.read_i32()?),
        et::U4 => PrimitiveValue::U4(r.read_i32()? as u32),
        et::R4 => PrimitiveValue::R4(f32::from_bits(r.read_i32()? as u32)),
        et::I8 => PrimitiveValue::I8(r.read_i64()?),
        et::U8 => PrimitiveValue::U8(r.read_i64()? as u64),
        et::R8 => PrimitiveValue::R8(f64::from_bits(r.read_i64()? as u64)),
        et::I => PrimitiveValue::IntPtr(r.read_i64()?),
        et::U => PrimitiveValue::UIntPtr(r.read_i64()? as u64),
        et::PTR => {
            let address = r.read_i64()?;
            let ty = if r.version() >= TYPED_POINTER_VERSION {
                cache.resolve_as(r.read_id()?)
            } else {
                None
            };
            return Ok(Value::Pointer(PointerValue { address, ty }));
        }
        et::STRING | et::CLASS | et::OBJECT | et::GENERIC_INST | et::SZ_ARRAY | et::ARRAY => {
            let id = r.read_id()?;
            let Some(obj) = cache.resolve_as::<ObjectMirror>(id) else {
                return Ok(Value::Null);
            };
            return Ok(match tag {
                et::STRING => Value::String(obj),
                et::SZ_ARRAY | et::ARRAY => Value::Array(obj),
                _ => Value::Object(obj),
            });
        }
        et::TYPE => {
            let id = r.read_id()?;
            return Ok(cache
                .resolve_as::<TypeMirror>(id)
                .map_or(Value::Null, Value::Type));
        }
        et::VALUE_TYPE => {
            if depth >= MAX_VALUE_DEPTH {
                return Err(SdbError::Decode(format!(
                    "Struct values nested deeper than {}",
                    MAX_VALUE_DEPTH
                )));
            }

            let is_enum = r.read_bool()?;
            let type_id = r.read_id()?;
            let ty = cache
                .resolve_as::<TypeMirror>(type_id)
                .ok_or_else(|| SdbError::Decode("Struct value with null type".to_string()))?;
            let field_count = r.read_count()?;
            let mut fields = Vec::with_capacity(field_count.min(r.remaining()));
            for _ in 0..field_count {
                fields.push(read_value_at_depth(r, cache, depth + 1)?);
            }

            let value = StructValue { ty, fields };
            return Ok(if is_enum {
                Value::Enum(value)
            } else {
                Value::Struct(value)
            });
        }
        _ => {
            return Err(SdbError::Decode(format!("Unknown value tag: {:#x}", tag)));
        }
    };

    Ok(Value::Primitive(primitive))
}

/// Write one tagged value, mirroring `read_value`.
///
/// Nothing is written if the value needs a newer protocol than `version`.
pub fn write_value(
    w: &mut PacketWriter,
    value: &Value,
    version: ProtocolVersion,
) -> SdbResult<()> {
    check_writable(value, version)?;
    write_checked(w, value, version);
    Ok(())
}

pub fn write_values(
    w: &mut PacketWriter,
    values: &[Value],
    version: ProtocolVersion,
) -> SdbResult<()> {
    for value in values {
        check_writable(value, version)?;
    }
    for value in values {
        write_checked(w, value, version);
    }
    Ok(())
}

fn check_writable(value: &Value, version: ProtocolVersion) -> SdbResult<()> {
    match value {
        Value::Pointer(PointerValue { ty: Some(_), .. }) => version.require(
            TYPED_POINTER_VERSION.major,
            TYPED_POINTER_VERSION.minor,
            "typed pointer values",
        ),
        Value::Struct(s) | Value::Enum(s) => {
            for field in &s.fields {
                check_writable(field, version)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn write_checked(w: &mut PacketWriter, value: &Value, version: ProtocolVersion) {
    match value {
        Value::Void => {
            w.write_u8(et::VOID);
        }
        Value::Null => {
            w.write_u8(et::NULL);
        }
        Value::Primitive(p) => write_primitive(w, p),
        Value::String(obj) => {
            w.write_u8(et::STRING).write_id(obj.id());
        }
        Value::Object(obj) => {
            w.write_u8(et::OBJECT).write_id(obj.id());
        }
        Value::Array(obj) => {
            w.write_u8(et::SZ_ARRAY).write_id(obj.id());
        }
        Value::Type(ty) => {
            w.write_u8(et::TYPE).write_id(ty.id());
        }
        Value::Struct(s) | Value::Enum(s) => {
            w.write_u8(et::VALUE_TYPE)
                .write_bool(matches!(value, Value::Enum(_)))
                .write_id(s.ty.id())
                .write_i32(s.fields.len() as i32);
            for field in &s.fields {
                write_checked(w, field, version);
            }
        }
        Value::Pointer(p) => {
            w.write_u8(et::PTR).write_i64(p.address);
            if version >= TYPED_POINTER_VERSION {
                w.write_id(p.ty.as_ref().map_or(NULL_ID, TypeMirror::id));
            }
        }
    }
}

fn write_primitive(w: &mut PacketWriter, p: &PrimitiveValue) {
    match *p {
        PrimitiveValue::Bool(v) => w.write_u8(et::BOOLEAN).write_i32(v as i32),
        PrimitiveValue::Char(v) => w.write_u8(et::CHAR).write_i32(v as i32),
        PrimitiveValue::I1(v) => w.write_u8(et::I1).write_i32(v as i32),
        PrimitiveValue::U1(v) => w.write_u8(et::U1).write_i32(v as i32),
        PrimitiveValue::I2(v) => w.write_u8(et::I2).write_i32(v as i32),
        PrimitiveValue::U2(v) => w.write_u8(et::U2).write_i32(v as i32),
        PrimitiveValue::I4(v) => w.write_u8(et::I4).write_i32(v),
        PrimitiveValue::U4(v) => w.write_u8(et::U4).write_i32(v as i32),
        PrimitiveValue::R4(v) => w.write_u8(et::R4).write_i32(v.to_bits() as i32),
        PrimitiveValue::I8(v) => w.write_u8(et::I8).write_i64(v),
        PrimitiveValue::U8(v) => w.write_u8(et::U8).write_i64(v as i64),
        PrimitiveValue::R8(v) => w.write_u8(et::R8).write_i64(v.to_bits() as i64),
        PrimitiveValue::IntPtr(v) => w.write_u8(et::I).write_i64(v),
        PrimitiveValue::UIntPtr(v) => w.write_u8(et::U).write_i64(v as i64),
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::{MirrorKind, TypedMirror};

    const VERSIONS: [ProtocolVersion; 4] = [
        ProtocolVersion::new(2, 0),
        ProtocolVersion::new(2, 12),
        ProtocolVersion::new(2, 41),
        ProtocolVersion::new(2, 46),
    ];

    fn round_trip(value: &Value, version: ProtocolVersion, cache: &MirrorCache) -> Value {
        let mut w = PacketWriter::new(0, 0);
        write_value(&mut w, value, version).unwrap();
        let mut r = PacketReader::new(w.payload(), version);
        let decoded = read_value(&mut r, cache).unwrap();
        assert!(r.is_empty(), "trailing bytes after {:?}", value);
        decoded
    }

    #[test]
    fn test_primitives_round_trip_on_every_version() {
        let cache = MirrorCache::detached();
        let primitives = vec![
            PrimitiveValue::Bool(true),
            PrimitiveValue::Bool(false),
            PrimitiveValue::Char(0x263a),
            PrimitiveValue::I1(-128),
            PrimitiveValue::U1(255),
            PrimitiveValue::I2(-30000),
            PrimitiveValue::U2(65535),
            PrimitiveValue::I4(i32::MIN),
            PrimitiveValue::U4(u32::MAX),
            PrimitiveValue::I8(i64::MIN),
            PrimitiveValue::U8(u64::MAX),
            PrimitiveValue::R4(-1.5),
            PrimitiveValue::R8(std::f64::consts::PI),
            PrimitiveValue::IntPtr(-1),
            PrimitiveValue::UIntPtr(0xffff_0000_1234),
        ];

        for version in VERSIONS {
            for p in &primitives {
                let value = Value::Primitive(p.clone());
                assert_eq!(round_trip(&value, version, &cache), value);
            }
        }
    }

    #[test]
    fn test_narrow_primitives_travel_as_i32() {
        let mut w = PacketWriter::new(0, 0);
        write_value(&mut w, &Value::Primitive(PrimitiveValue::I1(-1)), VERSIONS[0]).unwrap();
        assert_eq!(w.payload(), &[et::I1, 0xff, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn test_references_resolve_through_the_cache() {
        let cache = MirrorCache::detached();
        let obj: ObjectMirror = cache.resolve_as(17).unwrap();
        let ty: TypeMirror = cache.resolve_as(4).unwrap();

        for value in [
            Value::Object(obj.clone()),
            Value::String(obj.clone()),
            Value::Array(obj.clone()),
            Value::Type(ty.clone()),
        ] {
            let decoded = round_trip(&value, VERSIONS[2], &cache);
            assert_eq!(decoded, value);
        }

        // Same id, same proxy
        let decoded = round_trip(&Value::Object(obj.clone()), VERSIONS[2], &cache);
        assert!(decoded.as_object().unwrap().mirror().same_as(obj.mirror()));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_null_object_id_decodes_as_null() {
        let cache = MirrorCache::detached();
        let data = [et::CLASS, 0, 0, 0, 0];
        let mut r = PacketReader::new(&data, VERSIONS[2]);
        assert_eq!(read_value(&mut r, &cache).unwrap(), Value::Null);
        assert!(cache.is_empty());

        assert_eq!(round_trip(&Value::Null, VERSIONS[2], &cache), Value::Null);
        assert_eq!(round_trip(&Value::Void, VERSIONS[2], &cache), Value::Void);
    }

    #[test]
    fn test_struct_and_enum_round_trip() {
        let cache = MirrorCache::detached();
        let point: TypeMirror = cache.resolve_as(30).unwrap();
        let color: TypeMirror = cache.resolve_as(31).unwrap();

        let inner = Value::Enum(StructValue {
            ty: color,
            fields: vec![Value::Primitive(PrimitiveValue::I4(2))],
        });
        let value = Value::Struct(StructValue {
            ty: point,
            fields: vec![
                Value::Primitive(PrimitiveValue::R8(1.0)),
                inner,
                Value::Null,
            ],
        });

        for version in VERSIONS {
            assert_eq!(round_trip(&value, version, &cache), value);
        }
    }

    #[test]
    fn test_pointer_type_is_version_gated() {
        let cache = MirrorCache::detached();
        let ptr_ty: TypeMirror = cache.resolve_as(12).unwrap();

        let untyped = Value::Pointer(PointerValue {
            address: 0x1000,
            ty: None,
        });
        for version in VERSIONS {
            assert_eq!(round_trip(&untyped, version, &cache), untyped);
        }

        let typed = Value::Pointer(PointerValue {
            address: 0x1000,
            ty: Some(ptr_ty),
        });
        assert_eq!(round_trip(&typed, VERSIONS[3], &cache), typed);

        let mut w = PacketWriter::new(0, 0);
        let err = write_value(&mut w, &typed, VERSIONS[2]).unwrap_err();
        assert!(matches!(err, SdbError::Unsupported { .. }));
        assert!(w.payload().is_empty());
    }

    #[test]
    fn test_unsupported_nested_field_writes_nothing() {
        let cache = MirrorCache::detached();
        let holder: TypeMirror = cache.resolve_as(40).unwrap();
        let value = Value::Struct(StructValue {
            ty: holder.clone(),
            fields: vec![Value::Pointer(PointerValue {
                address: 8,
                ty: Some(holder),
            })],
        });

        let mut w = PacketWriter::new(0, 0);
        assert!(write_values(&mut w, &[Value::Void, value], VERSIONS[1]).is_err());
        assert!(w.payload().is_empty());
    }

    #[test]
    fn test_unknown_tag_is_decode_error() {
        let cache = MirrorCache::detached();
        let mut r = PacketReader::new(&[0x7e, 0, 0, 0, 0], VERSIONS[2]);
        assert!(matches!(read_value(&mut r, &cache), Err(SdbError::Decode(_))));
    }

    #[test]
    fn test_truncated_struct_is_decode_error() {
        let cache = MirrorCache::detached();
        // Struct claiming two fields but carrying one
        let data = [
            et::VALUE_TYPE, 0, 0, 0, 0, 9, 0, 0, 0, 2, et::I4, 0, 0, 0, 1,
        ];
        let mut r = PacketReader::new(&data, VERSIONS[2]);
        assert!(matches!(read_value(&mut r, &cache), Err(SdbError::Decode(_))));
        assert!(cache.get(MirrorKind::Type, 9).is_some());
    }

    #[test]
    fn test_display_formats() {
        assert_eq!(Value::Primitive(PrimitiveValue::I4(3)).to_string(), "(int) 3");
        assert_eq!(Value::Null.to_string(), "null");
        assert_eq!(
            Value::Primitive(PrimitiveValue::Char('x' as u16)).to_string(),
            "(char) 'x'"
        );
    }
}
