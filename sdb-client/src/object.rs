// ObjectReference, StringReference and ArrayReference commands
//
// All three operate on the same object mirrors; strings and arrays are
// objects whose value tag said so.

use crate::codec::PacketWriter;
use crate::commands::{array_commands, command_sets, object_commands, string_commands};
use crate::mirror::{AppDomainMirror, FieldMirror, ObjectMirror, TypeMirror, TypedMirror};
use crate::protocol::{SdbError, SdbResult};
use crate::value::{read_values, write_values, Value};
use serde::Serialize;

/// Length and lower bound of one array dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArrayDimension {
    pub length: i32,
    pub lower_bound: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArrayDimensions {
    pub dimensions: Vec<ArrayDimension>,
}

impl ArrayDimensions {
    pub fn rank(&self) -> usize {
        self.dimensions.len()
    }

    /// Total element count over all dimensions
    pub fn element_count(&self) -> i64 {
        self.dimensions
            .iter()
            .map(|d| i64::from(d.length))
            .product()
    }
}

impl ObjectMirror {
    pub async fn object_type(&self) -> SdbResult<TypeMirror> {
        let vm = self.mirror().vm()?;
        let mut w = PacketWriter::new(command_sets::OBJECT_REFERENCE, object_commands::GET_TYPE);
        w.write_id(self.id());

        let reply = vm.request(w).await?;
        let id = vm.reader(reply.data()).read_id()?;
        vm.mirrors
            .resolve_as(id)
            .ok_or_else(|| SdbError::Decode(format!("{:?} has a null type", self)))
    }

    /// Instance field values, in the order given
    pub async fn field_values(&self, fields: &[FieldMirror]) -> SdbResult<Vec<Value>> {
        let vm = self.mirror().vm()?;
        let ids: Vec<_> = fields.iter().map(FieldMirror::id).collect();
        let mut w = PacketWriter::new(command_sets::OBJECT_REFERENCE, object_commands::GET_VALUES);
        w.write_id(self.id()).write_ids(&ids);

        let reply = vm.request(w).await?;
        let mut r = vm.reader(reply.data());
        read_values(&mut r, &vm.mirrors, fields.len())
    }

    pub async fn set_field_values(&self, fields: &[FieldMirror], values: &[Value]) -> SdbResult<()> {
        if fields.len() != values.len() {
            return Err(SdbError::InvalidState(format!(
                "{} fields but {} values",
                fields.len(),
                values.len()
            )));
        }

        let vm = self.mirror().vm()?;
        let ids: Vec<_> = fields.iter().map(FieldMirror::id).collect();
        let mut w = PacketWriter::new(command_sets::OBJECT_REFERENCE, object_commands::SET_VALUES);
        w.write_id(self.id()).write_ids(&ids);
        write_values(&mut w, values, vm.version())?;

        vm.request(w).await?;
        Ok(())
    }

    /// Whether the object has been garbage collected
    pub async fn is_collected(&self) -> SdbResult<bool> {
        let vm = self.mirror().vm()?;
        let mut w = PacketWriter::new(command_sets::OBJECT_REFERENCE, object_commands::IS_COLLECTED);
        w.write_id(self.id());

        let reply = vm.request(w).await?;
        Ok(vm.reader(reply.data()).read_i32()? != 0)
    }

    pub async fn domain(&self) -> SdbResult<AppDomainMirror> {
        let vm = self.mirror().vm()?;
        let mut w = PacketWriter::new(command_sets::OBJECT_REFERENCE, object_commands::GET_DOMAIN);
        w.write_id(self.id());

        let reply = vm.request(w).await?;
        let id = vm.reader(reply.data()).read_id()?;
        vm.mirrors
            .resolve_as(id)
            .ok_or_else(|| SdbError::Decode(format!("{:?} has no domain", self)))
    }

    /// Contents of a string object (StringReference.GetValue)
    pub async fn string_value(&self) -> SdbResult<String> {
        let vm = self.mirror().vm()?;
        let mut w = PacketWriter::new(command_sets::STRING_REFERENCE, string_commands::GET_VALUE);
        w.write_id(self.id());

        let reply = vm.request(w).await?;
        vm.reader(reply.data()).read_string_value()
    }

    /// Length of a string object in UTF-16 code units
    pub async fn string_length(&self) -> SdbResult<i64> {
        let vm = self.mirror().vm()?;
        let mut w = PacketWriter::new(command_sets::STRING_REFERENCE, string_commands::GET_LENGTH);
        w.write_id(self.id());

        let reply = vm.request(w).await?;
        vm.reader(reply.data()).read_i64()
    }

    /// Rank and per-dimension bounds of an array object
    pub async fn array_length(&self) -> SdbResult<ArrayDimensions> {
        let vm = self.mirror().vm()?;
        let mut w = PacketWriter::new(command_sets::ARRAY_REFERENCE, array_commands::GET_LENGTH);
        w.write_id(self.id());

        let reply = vm.request(w).await?;
        let mut r = vm.reader(reply.data());
        let rank = r.read_count()?;
        let mut dimensions = Vec::with_capacity(rank.min(r.remaining()));
        for _ in 0..rank {
            dimensions.push(ArrayDimension {
                length: r.read_i32()?,
                lower_bound: r.read_i32()?,
            });
        }

        Ok(ArrayDimensions { dimensions })
    }

    /// `length` elements starting at flat `index`
    pub async fn array_values(&self, index: i32, length: i32) -> SdbResult<Vec<Value>> {
        if index < 0 || length < 0 {
            return Err(SdbError::InvalidState(format!(
                "Invalid array range {}..+{}",
                index, length
            )));
        }

        let vm = self.mirror().vm()?;
        let mut w = PacketWriter::new(command_sets::ARRAY_REFERENCE, array_commands::GET_VALUES);
        w.write_id(self.id()).write_i32(index).write_i32(length);

        let reply = vm.request(w).await?;
        let mut r = vm.reader(reply.data());
        read_values(&mut r, &vm.mirrors, length as usize)
    }
}
