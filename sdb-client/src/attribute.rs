// Custom attribute queries
//
// Attributes have no remote id. The agent describes each one as its
// constructor method plus constructor and named argument values.

use crate::codec::{PacketReader, PacketWriter, NULL_ID};
use crate::commands::{command_sets, method_commands, type_commands};
use crate::mirror::{FieldMirror, MethodMirror, MirrorCache, PropertyMirror, TypeMirror, TypedMirror};
use crate::protocol::{SdbError, SdbResult};
use crate::value::{read_value, Value};
use serde::Serialize;

const NAMED_FIELD: u8 = 0x53;
const NAMED_PROPERTY: u8 = 0x54;

/// Member a named argument assigns
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "member", content = "mirror")]
pub enum AttributeMember {
    Field(FieldMirror),
    Property(PropertyMirror),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NamedArgument {
    pub member: AttributeMember,
    pub value: Value,
}

/// One applied attribute
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CustomAttribute {
    pub constructor: MethodMirror,
    pub constructor_args: Vec<Value>,
    pub named_args: Vec<NamedArgument>,
}

impl CustomAttribute {
    /// Decode a GetCustomAttributes reply
    pub fn decode_all(r: &mut PacketReader<'_>, cache: &MirrorCache) -> SdbResult<Vec<Self>> {
        let count = r.read_count()?;
        let mut attributes = Vec::with_capacity(count.min(r.remaining()));
        for _ in 0..count {
            attributes.push(Self::decode(r, cache)?);
        }
        Ok(attributes)
    }

    fn decode(r: &mut PacketReader<'_>, cache: &MirrorCache) -> SdbResult<Self> {
        let constructor = cache
            .resolve_as(r.read_id()?)
            .ok_or_else(|| SdbError::Decode("Attribute without a constructor".to_string()))?;

        let arg_count = r.read_count()?;
        let mut constructor_args = Vec::with_capacity(arg_count.min(r.remaining()));
        for _ in 0..arg_count {
            constructor_args.push(read_value(r, cache)?);
        }

        let named_count = r.read_count()?;
        let mut named_args = Vec::with_capacity(named_count.min(r.remaining()));
        for _ in 0..named_count {
            let marker = r.read_u8()?;
            let id = r.read_id()?;
            let member = match marker {
                NAMED_FIELD => cache.resolve_as(id).map(AttributeMember::Field),
                NAMED_PROPERTY => cache.resolve_as(id).map(AttributeMember::Property),
                other => {
                    return Err(SdbError::Decode(format!(
                        "Unknown named argument kind: {:#x}",
                        other
                    )))
                }
            }
            .ok_or_else(|| SdbError::Decode("Named argument without a member".to_string()))?;
            let value = read_value(r, cache)?;
            named_args.push(NamedArgument { member, value });
        }

        Ok(Self {
            constructor,
            constructor_args,
            named_args,
        })
    }
}

fn filter_id(attribute_type: Option<&TypeMirror>) -> u32 {
    attribute_type.map_or(NULL_ID, TypeMirror::id)
}

impl TypeMirror {
    /// Attributes applied to this type, optionally only those of `attribute_type`
    pub async fn custom_attributes(
        &self,
        attribute_type: Option<&TypeMirror>,
    ) -> SdbResult<Vec<CustomAttribute>> {
        let vm = self.mirror().vm()?;
        let mut w = PacketWriter::new(command_sets::TYPE, type_commands::GET_CATTRS);
        w.write_id(self.id()).write_id(filter_id(attribute_type));

        let reply = vm.request(w).await?;
        CustomAttribute::decode_all(&mut vm.reader(reply.data()), &vm.mirrors)
    }

    /// Attributes applied to `field`, which must be declared by this type
    pub async fn field_custom_attributes(
        &self,
        field: &FieldMirror,
        attribute_type: Option<&TypeMirror>,
    ) -> SdbResult<Vec<CustomAttribute>> {
        let vm = self.mirror().vm()?;
        let mut w = PacketWriter::new(command_sets::TYPE, type_commands::GET_FIELD_CATTRS);
        w.write_id(self.id())
            .write_id(field.id())
            .write_id(filter_id(attribute_type));

        let reply = vm.request(w).await?;
        CustomAttribute::decode_all(&mut vm.reader(reply.data()), &vm.mirrors)
    }
}

impl MethodMirror {
    pub async fn custom_attributes(
        &self,
        attribute_type: Option<&TypeMirror>,
    ) -> SdbResult<Vec<CustomAttribute>> {
        let vm = self.mirror().vm()?;
        let mut w = PacketWriter::new(command_sets::METHOD, method_commands::GET_CATTRS);
        w.write_id(self.id()).write_id(filter_id(attribute_type));

        let reply = vm.request(w).await?;
        CustomAttribute::decode_all(&mut vm.reader(reply.data()), &vm.mirrors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockAgent;
    use crate::protocol::ProtocolVersion;
    use crate::value::{write_value, PrimitiveValue};

    const V: ProtocolVersion = ProtocolVersion::new(2, 46);

    // [Obsolete("old", IsError = true)] with the message as a string object
    fn obsolete_reply() -> Vec<u8> {
        let cache = MirrorCache::detached();
        let message: crate::mirror::ObjectMirror = cache.resolve_as(0x900).unwrap();

        let mut w = PacketWriter::new(0, 0);
        w.write_i32(1).write_id(0x80).write_i32(1);
        write_value(&mut w, &Value::String(message), V).unwrap();
        w.write_i32(1).write_u8(NAMED_PROPERTY).write_id(0x81);
        write_value(&mut w, &Value::Primitive(PrimitiveValue::Bool(true)), V).unwrap();
        w.payload().to_vec()
    }

    #[test]
    fn test_decode_constructor_and_named_args() {
        let cache = MirrorCache::detached();
        let data = obsolete_reply();
        let mut r = PacketReader::new(&data, V);

        let attributes = CustomAttribute::decode_all(&mut r, &cache).unwrap();
        assert!(r.is_empty());
        assert_eq!(attributes.len(), 1);

        let obsolete = &attributes[0];
        assert_eq!(obsolete.constructor.id(), 0x80);
        assert_eq!(obsolete.constructor_args[0].as_object().unwrap().id(), 0x900);
        let named = &obsolete.named_args[0];
        assert!(matches!(&named.member, AttributeMember::Property(p) if p.id() == 0x81));
        assert_eq!(named.value, Value::Primitive(PrimitiveValue::Bool(true)));
    }

    #[test]
    fn test_unknown_named_argument_kind_is_decode_error() {
        let cache = MirrorCache::detached();
        let mut w = PacketWriter::new(0, 0);
        w.write_i32(1).write_id(0x80).write_i32(0);
        w.write_i32(1).write_u8(0x99).write_id(0x81);
        let data = w.payload().to_vec();

        let mut r = PacketReader::new(&data, V);
        assert!(matches!(
            CustomAttribute::decode_all(&mut r, &cache),
            Err(SdbError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_type_and_method_queries() {
        let (agent, vm) = MockAgent::attached(V).await;
        agent.on(command_sets::TYPE, type_commands::GET_CATTRS, |_| Ok(obsolete_reply()));
        agent.on(command_sets::TYPE, type_commands::GET_FIELD_CATTRS, |_| {
            Ok(0i32.to_be_bytes().to_vec())
        });
        agent.on(command_sets::METHOD, method_commands::GET_CATTRS, |_| Ok(obsolete_reply()));

        let ty: TypeMirror = vm.mirrors().resolve_as(0x20).unwrap();
        let filter: TypeMirror = vm.mirrors().resolve_as(0x21).unwrap();
        let field: FieldMirror = vm.mirrors().resolve_as(0x22).unwrap();
        let method: MethodMirror = vm.mirrors().resolve_as(0x23).unwrap();

        let on_type = ty.custom_attributes(None).await.unwrap();
        let on_method = method.custom_attributes(Some(&filter)).await.unwrap();
        assert!(ty.field_custom_attributes(&field, None).await.unwrap().is_empty());

        // Both replies name the same constructor, so they share its proxy
        assert!(on_type[0]
            .constructor
            .mirror()
            .same_as(on_method[0].constructor.mirror()));

        let sent = agent.received(command_sets::TYPE, type_commands::GET_CATTRS);
        let mut expected = PacketWriter::new(0, 0);
        expected.write_id(0x20).write_id(0);
        assert_eq!(sent[0].data, expected.payload());

        let sent = agent.received(command_sets::METHOD, method_commands::GET_CATTRS);
        let mut expected = PacketWriter::new(0, 0);
        expected.write_id(0x23).write_id(0x21);
        assert_eq!(sent[0].data, expected.payload());

        let sent = agent.received(command_sets::TYPE, type_commands::GET_FIELD_CATTRS);
        let mut expected = PacketWriter::new(0, 0);
        expected.write_id(0x20).write_id(0x22).write_id(0);
        assert_eq!(sent[0].data, expected.payload());
    }
}
