// ThreadReference command implementations
//
// Commands for working with threads (frames, name, state)

use crate::codec::{PacketWriter, RemoteId};
use crate::commands::{command_sets, thread_commands};
use crate::mirror::{MethodMirror, ThreadMirror, TypedMirror};
use crate::protocol::{SdbError, SdbResult};
use serde::Serialize;

// Thread state bits (System.Threading.ThreadState)
pub const THREAD_STATE_STOPPED: i32 = 0x10;
pub const THREAD_STATE_SUSPENDED: i32 = 0x40;

/// One frame of a suspended thread's stack.
///
/// Frame ids are only valid until the thread resumes, so frames are plain
/// values rather than cached mirrors.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StackFrame {
    pub thread: ThreadMirror,
    pub id: RemoteId,
    pub method: MethodMirror,
    pub il_offset: i32,
    pub flags: u8,
}

impl ThreadMirror {
    /// Stack frames, innermost first (ThreadReference.GetFrameInfo)
    pub async fn frames(&self) -> SdbResult<Vec<StackFrame>> {
        let vm = self.mirror().vm()?;
        let mut w = PacketWriter::new(command_sets::THREAD_REFERENCE, thread_commands::GET_FRAME_INFO);
        // Start at the top frame, all frames
        w.write_id(self.id()).write_i32(0).write_i32(-1);

        let reply = vm.request(w).await?;
        let mut r = vm.reader(reply.data());
        let count = r.read_count()?;
        let mut frames = Vec::with_capacity(count.min(r.remaining()));

        for _ in 0..count {
            let id = r.read_id()?;
            let method_id = r.read_id()?;
            let il_offset = r.read_i32()?;
            let flags = r.read_u8()?;

            let method = vm.mirrors.resolve_as(method_id).ok_or_else(|| {
                SdbError::Decode(format!("Frame {:x} of {:?} has a null method", id, self))
            })?;

            frames.push(StackFrame {
                thread: self.clone(),
                id,
                method,
                il_offset,
                flags,
            });
        }

        Ok(frames)
    }

    pub async fn name(&self) -> SdbResult<String> {
        let vm = self.mirror().vm()?;
        let mut w = PacketWriter::new(command_sets::THREAD_REFERENCE, thread_commands::GET_NAME);
        w.write_id(self.id());

        let reply = vm.request(w).await?;
        vm.reader(reply.data()).read_string()
    }

    /// Raw thread state bits
    pub async fn state(&self) -> SdbResult<i32> {
        let vm = self.mirror().vm()?;
        let mut w = PacketWriter::new(command_sets::THREAD_REFERENCE, thread_commands::GET_STATE);
        w.write_id(self.id());

        let reply = vm.request(w).await?;
        vm.reader(reply.data()).read_i32()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockAgent;
    use crate::protocol::ProtocolVersion;

    fn frames_reply() -> Vec<u8> {
        let mut w = PacketWriter::new(0, 0);
        w.write_i32(2);
        w.write_id(0x501).write_id(0x40).write_i32(12).write_u8(0);
        w.write_id(0x502).write_id(0x41).write_i32(0).write_u8(1);
        w.payload().to_vec()
    }

    #[tokio::test]
    async fn test_frames() {
        let (agent, vm) = MockAgent::attached(ProtocolVersion::new(2, 46)).await;
        agent.on(command_sets::THREAD_REFERENCE, thread_commands::GET_FRAME_INFO, |_| {
            Ok(frames_reply())
        });

        let thread: ThreadMirror = vm.mirrors().resolve_as(0x7).unwrap();
        let frames = thread.frames().await.unwrap();

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].id, 0x501);
        assert_eq!(frames[0].method.id(), 0x40);
        assert_eq!(frames[0].il_offset, 12);
        assert_eq!(frames[1].flags, 1);
        assert_eq!(frames[1].thread, thread);

        let sent = agent.received(command_sets::THREAD_REFERENCE, thread_commands::GET_FRAME_INFO);
        assert_eq!(sent[0].data, vec![0, 0, 0, 7, 0, 0, 0, 0, 0xff, 0xff, 0xff, 0xff]);
    }

    #[tokio::test]
    async fn test_frames_are_fetched_every_time() {
        let (agent, vm) = MockAgent::attached(ProtocolVersion::new(2, 46)).await;
        agent.on(command_sets::THREAD_REFERENCE, thread_commands::GET_FRAME_INFO, |_| {
            Ok(frames_reply())
        });

        let thread: ThreadMirror = vm.mirrors().resolve_as(0x7).unwrap();
        thread.frames().await.unwrap();
        thread.frames().await.unwrap();
        assert_eq!(
            agent
                .received(command_sets::THREAD_REFERENCE, thread_commands::GET_FRAME_INFO)
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_name_and_state() {
        let (agent, vm) = MockAgent::attached(ProtocolVersion::new(2, 46)).await;
        agent.on(command_sets::THREAD_REFERENCE, thread_commands::GET_NAME, |_| {
            let mut w = PacketWriter::new(0, 0);
            w.write_string("Finalizer");
            Ok(w.payload().to_vec())
        });
        agent.on(command_sets::THREAD_REFERENCE, thread_commands::GET_STATE, |_| {
            Ok(THREAD_STATE_SUSPENDED.to_be_bytes().to_vec())
        });

        let thread: ThreadMirror = vm.mirrors().resolve_as(0x7).unwrap();
        assert_eq!(thread.name().await.unwrap(), "Finalizer");
        assert_eq!(thread.state().await.unwrap() & THREAD_STATE_SUSPENDED, THREAD_STATE_SUSPENDED);
    }

    #[tokio::test]
    async fn test_invalid_thread_error() {
        let (agent, vm) = MockAgent::attached(ProtocolVersion::new(2, 46)).await;
        agent.on(command_sets::THREAD_REFERENCE, thread_commands::GET_NAME, |_| Err(21));

        let thread: ThreadMirror = vm.mirrors().resolve_as(0x7).unwrap();
        match thread.name().await {
            Err(SdbError::ErrorCode { code, .. }) => assert_eq!(code, 21),
            other => panic!("expected error code, got {:?}", other),
        }
    }
}
