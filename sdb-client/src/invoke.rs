// Method invocation results
//
// An invoke either returns a value or reports that debuggee code threw.
// The thrown case is an ordinary outcome, not a client error.

use crate::codec::PacketReader;
use crate::commands::{invoke_flags, invoke_result_flags};
use crate::mirror::MirrorCache;
use crate::protocol::{ProtocolVersion, SdbResult};
use crate::value::{read_value, read_values, Value};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvokeOptions {
    pub disable_breakpoints: bool,
    /// Only resume the invoking thread while the call runs
    pub single_threaded: bool,
    /// Ask for the by-ref `this` after the call
    pub return_out_this: bool,
    /// Ask for the by-ref arguments after the call
    pub return_out_args: bool,
    /// Dispatch virtually on the receiver
    pub virtual_call: bool,
}

// Agents return by-ref `this` and arguments from 2.35
pub const OUT_VALUES_VERSION: ProtocolVersion = ProtocolVersion::new(2, 35);

impl InvokeOptions {
    /// Fail with `Unsupported` when `version` cannot honor these options
    pub fn check_version(&self, version: ProtocolVersion) -> SdbResult<()> {
        let ProtocolVersion { major, minor } = OUT_VALUES_VERSION;
        if self.return_out_this {
            version.require(major, minor, "by-ref this after invoke")?;
        }
        if self.return_out_args {
            version.require(major, minor, "by-ref arguments after invoke")?;
        }
        Ok(())
    }

    pub fn flags(&self) -> i32 {
        let mut flags = invoke_flags::NONE;
        if self.disable_breakpoints {
            flags |= invoke_flags::DISABLE_BREAKPOINTS;
        }
        if self.single_threaded {
            flags |= invoke_flags::SINGLE_THREADED;
        }
        if self.return_out_this {
            flags |= invoke_flags::OUT_THIS;
        }
        if self.return_out_args {
            flags |= invoke_flags::OUT_ARGS;
        }
        if self.virtual_call {
            flags |= invoke_flags::VIRTUAL;
        }
        flags
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvokeResult {
    pub value: Value,
    /// Present only when the agent reported an updated `this`
    pub this: Option<Value>,
    /// Present only when the agent reported updated by-ref arguments
    pub args: Option<Vec<Value>>,
}

/// Debuggee code threw during an invoke
#[derive(Debug, Clone, PartialEq, Serialize, Error)]
#[error("Invoked method threw {exception}")]
pub struct ThrownException {
    pub exception: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome")]
pub enum InvokeOutcome {
    Returned(InvokeResult),
    Thrown(ThrownException),
}

impl InvokeOutcome {
    pub fn is_thrown(&self) -> bool {
        matches!(self, InvokeOutcome::Thrown(_))
    }

    /// Turn a thrown exception into an `Err` so call sites can raise it with `?`
    pub fn into_result(self) -> Result<InvokeResult, ThrownException> {
        match self {
            InvokeOutcome::Returned(result) => Ok(result),
            InvokeOutcome::Thrown(thrown) => Err(thrown),
        }
    }
}

/// Decode an InvokeMethod reply: result flags, value, then optional trailers
pub fn decode_invoke_reply(r: &mut PacketReader<'_>, cache: &MirrorCache) -> SdbResult<InvokeOutcome> {
    let flags = r.read_u8()?;
    let value = read_value(r, cache)?;

    if flags & invoke_result_flags::EXCEPTION != 0 {
        return Ok(InvokeOutcome::Thrown(ThrownException { exception: value }));
    }

    let this = if flags & invoke_result_flags::THIS_UPDATED != 0 {
        Some(read_value(r, cache)?)
    } else {
        None
    };

    let args = if flags & invoke_result_flags::ARGS_UPDATED != 0 {
        let count = r.read_count()?;
        Some(read_values(r, cache, count)?)
    } else {
        None
    };

    Ok(InvokeOutcome::Returned(InvokeResult { value, this, args }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PacketWriter;
    use crate::mirror::ObjectMirror;
    use crate::protocol::{ProtocolVersion, SdbError};
    use crate::value::{write_value, PrimitiveValue};

    const V: ProtocolVersion = ProtocolVersion::new(2, 46);

    fn reply(flags: u8, values: &[Value], args: Option<&[Value]>) -> Vec<u8> {
        let mut w = PacketWriter::new(0, 0);
        w.write_u8(flags);
        for value in values {
            write_value(&mut w, value, V).unwrap();
        }
        if let Some(args) = args {
            w.write_i32(args.len() as i32);
            for arg in args {
                write_value(&mut w, arg, V).unwrap();
            }
        }
        w.payload().to_vec()
    }

    fn int(v: i32) -> Value {
        Value::Primitive(PrimitiveValue::I4(v))
    }

    #[test]
    fn test_plain_return() {
        let cache = MirrorCache::detached();
        let data = reply(0b000, &[int(42)], None);
        let mut r = PacketReader::new(&data, V);

        let outcome = decode_invoke_reply(&mut r, &cache).unwrap();
        assert_eq!(
            outcome,
            InvokeOutcome::Returned(InvokeResult {
                value: int(42),
                this: None,
                args: None,
            })
        );
        assert!(r.is_empty());
    }

    #[test]
    fn test_exception_bit_yields_thrown_outcome() {
        let cache = MirrorCache::detached();
        let exc: ObjectMirror = cache.resolve_as(0x99).unwrap();
        let data = reply(0b001, &[Value::Object(exc.clone())], None);
        let mut r = PacketReader::new(&data, V);

        let outcome = decode_invoke_reply(&mut r, &cache).unwrap();
        assert!(outcome.is_thrown());
        let thrown = outcome.into_result().unwrap_err();
        assert_eq!(thrown.exception, Value::Object(exc));
    }

    #[test]
    fn test_args_trailer_only_when_flagged() {
        let cache = MirrorCache::detached();
        let data = reply(0b100, &[Value::Void], Some(&[int(1), int(2)]));
        let mut r = PacketReader::new(&data, V);

        let result = decode_invoke_reply(&mut r, &cache).unwrap().into_result().unwrap();
        assert_eq!(result.value, Value::Void);
        assert_eq!(result.this, None);
        assert_eq!(result.args, Some(vec![int(1), int(2)]));
        assert!(r.is_empty());
    }

    #[test]
    fn test_this_and_args_trailers() {
        let cache = MirrorCache::detached();
        let data = reply(0b110, &[int(7), int(8)], Some(&[int(9)]));
        let mut r = PacketReader::new(&data, V);

        let result = decode_invoke_reply(&mut r, &cache).unwrap().into_result().unwrap();
        assert_eq!(result.value, int(7));
        assert_eq!(result.this, Some(int(8)));
        assert_eq!(result.args, Some(vec![int(9)]));
    }

    #[test]
    fn test_missing_trailer_is_decode_error() {
        let cache = MirrorCache::detached();
        let data = reply(0b100, &[int(1)], None);
        let mut r = PacketReader::new(&data, V);
        assert!(matches!(
            decode_invoke_reply(&mut r, &cache),
            Err(SdbError::Decode(_))
        ));
    }

    #[test]
    fn test_option_flags() {
        assert_eq!(InvokeOptions::default().flags(), 0);
        let options = InvokeOptions {
            disable_breakpoints: true,
            return_out_args: true,
            virtual_call: true,
            ..Default::default()
        };
        assert_eq!(options.flags(), 1 | 8 | 16);
    }
}
