// Assembly command implementations

use crate::codec::PacketWriter;
use crate::commands::{assembly_commands, command_sets};
use crate::mirror::{AssemblyMirror, MethodMirror, ObjectMirror, TypeMirror, TypedMirror};
use crate::protocol::{SdbError, SdbResult};

impl AssemblyMirror {
    /// Full assembly name. Fetched once per mirror.
    pub async fn name(&self) -> SdbResult<String> {
        let mirror = self.mirror();
        if let Some(name) = mirror.cached_name() {
            return Ok(name.to_string());
        }

        let vm = mirror.vm()?;
        mirror
            .name_or_fetch(|| async {
                let mut w = PacketWriter::new(command_sets::ASSEMBLY, assembly_commands::GET_NAME);
                w.write_id(self.id());
                let reply = vm.request(w).await?;
                vm.reader(reply.data()).read_string()
            })
            .await
    }

    /// Path the assembly was loaded from
    pub async fn location(&self) -> SdbResult<String> {
        let vm = self.mirror().vm()?;
        let mut w = PacketWriter::new(command_sets::ASSEMBLY, assembly_commands::GET_LOCATION);
        w.write_id(self.id());

        let reply = vm.request(w).await?;
        vm.reader(reply.data()).read_string()
    }

    pub async fn entry_point(&self) -> SdbResult<Option<MethodMirror>> {
        let vm = self.mirror().vm()?;
        let mut w = PacketWriter::new(command_sets::ASSEMBLY, assembly_commands::GET_ENTRY_POINT);
        w.write_id(self.id());

        let reply = vm.request(w).await?;
        let id = vm.reader(reply.data()).read_id()?;
        Ok(vm.mirrors.resolve_as(id))
    }

    /// The System.Reflection.Assembly object for this assembly
    pub async fn object(&self) -> SdbResult<ObjectMirror> {
        let vm = self.mirror().vm()?;
        let mut w = PacketWriter::new(command_sets::ASSEMBLY, assembly_commands::GET_OBJECT);
        w.write_id(self.id());

        let reply = vm.request(w).await?;
        let id = vm.reader(reply.data()).read_id()?;
        vm.mirrors
            .resolve_as(id)
            .ok_or_else(|| SdbError::Decode(format!("{:?} has no reflection object", self)))
    }

    /// Look up a type by full name in this assembly
    pub async fn get_type(&self, name: &str, ignore_case: bool) -> SdbResult<Option<TypeMirror>> {
        let vm = self.mirror().vm()?;
        let mut w = PacketWriter::new(command_sets::ASSEMBLY, assembly_commands::GET_TYPE);
        w.write_id(self.id()).write_string(name).write_bool(ignore_case);

        let reply = vm.request(w).await?;
        let id = vm.reader(reply.data()).read_id()?;
        Ok(vm.mirrors.resolve_as(id))
    }
}
