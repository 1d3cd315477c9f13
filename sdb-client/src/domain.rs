// AppDomain command implementations

use crate::codec::PacketWriter;
use crate::commands::{command_sets, domain_commands};
use crate::mirror::{AppDomainMirror, AssemblyMirror, ObjectMirror, TypedMirror};
use crate::protocol::{SdbError, SdbResult};
use crate::reftype::resolve_all;

impl AppDomainMirror {
    pub async fn friendly_name(&self) -> SdbResult<String> {
        let mirror = self.mirror();
        if let Some(name) = mirror.cached_name() {
            return Ok(name.to_string());
        }

        let vm = mirror.vm()?;
        mirror
            .name_or_fetch(|| async {
                let mut w = PacketWriter::new(command_sets::APP_DOMAIN, domain_commands::GET_FRIENDLY_NAME);
                w.write_id(self.id());
                let reply = vm.request(w).await?;
                vm.reader(reply.data()).read_string()
            })
            .await
    }

    /// Assemblies loaded into this domain
    pub async fn assemblies(&self) -> SdbResult<Vec<AssemblyMirror>> {
        let vm = self.mirror().vm()?;
        let mut w = PacketWriter::new(command_sets::APP_DOMAIN, domain_commands::GET_ASSEMBLIES);
        w.write_id(self.id());

        let reply = vm.request(w).await?;
        let ids = vm.reader(reply.data()).read_ids()?;
        Ok(resolve_all(&vm.mirrors, ids))
    }

    /// `None` when the domain has no entry assembly (e.g. a library host)
    pub async fn entry_assembly(&self) -> SdbResult<Option<AssemblyMirror>> {
        let vm = self.mirror().vm()?;
        let mut w = PacketWriter::new(command_sets::APP_DOMAIN, domain_commands::GET_ENTRY_ASSEMBLY);
        w.write_id(self.id());

        let reply = vm.request(w).await?;
        let id = vm.reader(reply.data()).read_id()?;
        Ok(vm.mirrors.resolve_as(id))
    }

    pub async fn corlib(&self) -> SdbResult<AssemblyMirror> {
        let vm = self.mirror().vm()?;
        let mut w = PacketWriter::new(command_sets::APP_DOMAIN, domain_commands::GET_CORLIB);
        w.write_id(self.id());

        let reply = vm.request(w).await?;
        let id = vm.reader(reply.data()).read_id()?;
        vm.mirrors
            .resolve_as(id)
            .ok_or_else(|| SdbError::Decode(format!("{:?} has no corlib", self)))
    }

    /// Allocate a string in the debuggee.
    ///
    /// Each call creates a new remote object with its own id.
    pub async fn create_string(&self, s: &str) -> SdbResult<ObjectMirror> {
        let vm = self.mirror().vm()?;
        let mut w = PacketWriter::new(command_sets::APP_DOMAIN, domain_commands::CREATE_STRING);
        w.write_id(self.id()).write_string(s);

        let reply = vm.request(w).await?;
        let id = vm.reader(reply.data()).read_id()?;
        vm.mirrors
            .resolve_as(id)
            .ok_or_else(|| SdbError::Decode("Agent returned a null string".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockAgent;
    use crate::protocol::ProtocolVersion;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_root_domain_assemblies() {
        let (agent, vm) = MockAgent::attached(ProtocolVersion::new(2, 46)).await;
        agent.on(command_sets::APP_DOMAIN, domain_commands::GET_ROOT_DOMAIN, |_| {
            Ok(0x1u32.to_be_bytes().to_vec())
        });
        agent.on(command_sets::APP_DOMAIN, domain_commands::GET_ASSEMBLIES, |_| {
            let mut w = PacketWriter::new(0, 0);
            w.write_ids(&[0x10, 0x11, 0x12]);
            Ok(w.payload().to_vec())
        });
        agent.on(command_sets::APP_DOMAIN, domain_commands::GET_ENTRY_ASSEMBLY, |_| {
            Ok(0u32.to_be_bytes().to_vec())
        });
        agent.on(command_sets::APP_DOMAIN, domain_commands::GET_FRIENDLY_NAME, |_| {
            let mut w = PacketWriter::new(0, 0);
            w.write_string("app.exe");
            Ok(w.payload().to_vec())
        });

        let domain = vm.root_domain().await.unwrap();
        assert_eq!(domain, vm.root_domain().await.unwrap());

        let assemblies = domain.assemblies().await.unwrap();
        assert_eq!(assemblies.iter().map(|a| a.id()).collect::<Vec<_>>(), vec![0x10, 0x11, 0x12]);
        assert_eq!(domain.entry_assembly().await.unwrap(), None);

        assert_eq!(domain.friendly_name().await.unwrap(), "app.exe");
        assert_eq!(domain.friendly_name().await.unwrap(), "app.exe");
        assert_eq!(
            agent
                .received(command_sets::APP_DOMAIN, domain_commands::GET_FRIENDLY_NAME)
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_create_string_allocates_fresh_ids() {
        let (agent, vm) = MockAgent::attached(ProtocolVersion::new(2, 46)).await;
        let next = Arc::new(AtomicU32::new(0x800));
        agent.on(command_sets::APP_DOMAIN, domain_commands::CREATE_STRING, move |_| {
            Ok(next.fetch_add(1, Ordering::SeqCst).to_be_bytes().to_vec())
        });

        let domain: AppDomainMirror = vm.mirrors().resolve_as(0x1).unwrap();
        let a = domain.create_string("hi").await.unwrap();
        let b = domain.create_string("hi").await.unwrap();
        assert_ne!(a, b);

        let sent = agent.received(command_sets::APP_DOMAIN, domain_commands::CREATE_STRING);
        let mut expected = PacketWriter::new(0, 0);
        expected.write_id(0x1).write_string("hi");
        assert_eq!(sent[0].data, expected.payload());
    }
}
