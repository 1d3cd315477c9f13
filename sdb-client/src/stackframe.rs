// StackFrame command implementations
//
// Reading and writing locals, arguments and `this` in a frame

use crate::codec::PacketWriter;
use crate::commands::{command_sets, stack_frame_commands};
use crate::mirror::TypedMirror;
use crate::protocol::{SdbError, SdbResult};
use crate::thread::StackFrame;
use crate::value::{read_value, read_values, write_values, Value};

impl StackFrame {
    fn writer(&self, command: u8) -> PacketWriter {
        let mut w = PacketWriter::new(command_sets::STACK_FRAME, command);
        w.write_id(self.thread.id()).write_id(self.id);
        w
    }

    /// Values at `positions` (StackFrame.GetValues).
    ///
    /// Locals use their index from `MethodMirror::locals`; arguments use
    /// `-(index + 1)`.
    pub async fn values(&self, positions: &[i32]) -> SdbResult<Vec<Value>> {
        let vm = self.thread.mirror().vm()?;
        let mut w = self.writer(stack_frame_commands::GET_VALUES);
        w.write_i32(positions.len() as i32);
        for pos in positions {
            w.write_i32(*pos);
        }

        let reply = vm.request(w).await?;
        let mut r = vm.reader(reply.data());
        read_values(&mut r, &vm.mirrors, positions.len())
    }

    /// `this` of the frame's method, `Value::Null` for static methods
    pub async fn this_value(&self) -> SdbResult<Value> {
        let vm = self.thread.mirror().vm()?;
        let w = self.writer(stack_frame_commands::GET_THIS);

        let reply = vm.request(w).await?;
        let mut r = vm.reader(reply.data());
        read_value(&mut r, &vm.mirrors)
    }

    /// Overwrite the values at `positions` (StackFrame.SetValues)
    pub async fn set_values(&self, positions: &[i32], values: &[Value]) -> SdbResult<()> {
        if positions.len() != values.len() {
            return Err(SdbError::InvalidState(format!(
                "{} positions but {} values",
                positions.len(),
                values.len()
            )));
        }

        let vm = self.thread.mirror().vm()?;
        let mut w = self.writer(stack_frame_commands::SET_VALUES);
        w.write_i32(positions.len() as i32);
        for pos in positions {
            w.write_i32(*pos);
        }
        write_values(&mut w, values, vm.version())?;

        vm.request(w).await?;
        Ok(())
    }
}
