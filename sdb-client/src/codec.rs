// Packet codec: typed writers for outgoing commands and readers for replies
//
// Field order is the wire contract. Writers append in call order; readers
// consume strictly in the order the agent writes.

use crate::protocol::{CommandPacket, ProtocolVersion, SdbError, SdbResult};
use bytes::{Buf, BufMut, BytesMut};
use std::fmt::Debug;
use tracing::trace;

/// Remote handle. Ids are 4 bytes on the wire; 0 is the null sentinel.
pub type RemoteId = u32;

pub const NULL_ID: RemoteId = 0;

// StringReference.GetValue grew an encoding flag byte in 2.41
pub const UTF16_STRING_VERSION: ProtocolVersion = ProtocolVersion::new(2, 41);

/// Builder for one outgoing command packet.
///
/// The correlation id is assigned by the connection when the packet is sent.
#[derive(Debug, Clone)]
pub struct PacketWriter {
    command_set: u8,
    command: u8,
    data: BytesMut,
}

impl PacketWriter {
    pub fn new(command_set: u8, command: u8) -> Self {
        Self {
            command_set,
            command,
            data: BytesMut::new(),
        }
    }

    pub fn command_set(&self) -> u8 {
        self.command_set
    }

    pub fn command(&self) -> u8 {
        self.command
    }

    pub fn payload(&self) -> &[u8] {
        &self.data
    }

    pub fn write_u8(&mut self, v: u8) -> &mut Self {
        self.data.put_u8(v);
        self
    }

    /// Booleans travel as a single byte
    pub fn write_bool(&mut self, v: bool) -> &mut Self {
        self.data.put_u8(v as u8);
        self
    }

    pub fn write_i32(&mut self, v: i32) -> &mut Self {
        self.data.put_i32(v);
        self
    }

    pub fn write_i64(&mut self, v: i64) -> &mut Self {
        self.data.put_i64(v);
        self
    }

    pub fn write_id(&mut self, id: RemoteId) -> &mut Self {
        self.data.put_u32(id);
        self
    }

    /// Count-prefixed id list
    pub fn write_ids(&mut self, ids: &[RemoteId]) -> &mut Self {
        self.write_i32(ids.len() as i32);
        for id in ids {
            self.write_id(*id);
        }
        self
    }

    /// Length-prefixed UTF-8 string
    pub fn write_string(&mut self, s: &str) -> &mut Self {
        self.data.put_i32(s.len() as i32);
        self.data.put_slice(s.as_bytes());
        self
    }

    /// Count-prefixed string list
    pub fn write_strings(&mut self, strings: &[String]) -> &mut Self {
        self.write_i32(strings.len() as i32);
        for s in strings {
            self.write_string(s);
        }
        self
    }

    /// Length-prefixed UTF-16LE string. The prefix is the byte length.
    pub fn write_utf16_string(&mut self, s: &str) -> &mut Self {
        let units: Vec<u16> = s.encode_utf16().collect();
        self.data.put_i32((units.len() * 2) as i32);
        for unit in units {
            self.data.put_u16_le(unit);
        }
        self
    }

    /// String contents as StringReference.GetValue carries them.
    ///
    /// From 2.41 a flag byte selects the encoding; before that only UTF-8 exists.
    pub fn write_string_value(
        &mut self,
        s: &str,
        version: ProtocolVersion,
        utf16: bool,
    ) -> SdbResult<&mut Self> {
        if version >= UTF16_STRING_VERSION {
            self.write_bool(utf16);
        } else if utf16 {
            version.require(
                UTF16_STRING_VERSION.major,
                UTF16_STRING_VERSION.minor,
                "UTF-16 string values",
            )?;
        }

        if utf16 {
            Ok(self.write_utf16_string(s))
        } else {
            Ok(self.write_string(s))
        }
    }

    pub fn into_packet(self, id: u32) -> CommandPacket {
        CommandPacket {
            id,
            command_set: self.command_set,
            command: self.command,
            data: self.data.to_vec(),
        }
    }
}

/// Cursor over a reply (or event) payload.
///
/// Every read is bounds-checked; running off the end is a decode error.
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    buf: &'a [u8],
    offset: usize,
    version: ProtocolVersion,
    trace: bool,
}

impl<'a> PacketReader<'a> {
    pub fn new(buf: &'a [u8], version: ProtocolVersion) -> Self {
        Self {
            buf,
            offset: 0,
            version,
            trace: false,
        }
    }

    /// Emit one trace record per field read
    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn is_at_least(&self, major: i32, minor: i32) -> bool {
        self.version.is_at_least(major, minor)
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn require(&self, n: usize, what: &str) -> SdbResult<()> {
        if self.buf.remaining() < n {
            return Err(SdbError::Decode(format!(
                "Not enough data for {} at offset {}: need {}, have {}",
                what,
                self.offset,
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn traced<T: Debug>(&mut self, what: &'static str, width: usize, value: T) -> T {
        if self.trace {
            trace!(offset = self.offset, field = what, value = ?value, "read");
        }
        self.offset += width;
        value
    }

    pub fn read_u8(&mut self) -> SdbResult<u8> {
        self.require(1, "u8")?;
        let v = self.buf.get_u8();
        Ok(self.traced("u8", 1, v))
    }

    pub fn read_bool(&mut self) -> SdbResult<bool> {
        self.require(1, "bool")?;
        let v = self.buf.get_u8() != 0;
        Ok(self.traced("bool", 1, v))
    }

    pub fn read_i32(&mut self) -> SdbResult<i32> {
        self.require(4, "i32")?;
        let v = self.buf.get_i32();
        Ok(self.traced("i32", 4, v))
    }

    pub fn read_i64(&mut self) -> SdbResult<i64> {
        self.require(8, "i64")?;
        let v = self.buf.get_i64();
        Ok(self.traced("i64", 8, v))
    }

    pub fn read_id(&mut self) -> SdbResult<RemoteId> {
        self.require(4, "id")?;
        let v = self.buf.get_u32();
        Ok(self.traced("id", 4, v))
    }

    /// Read a count prefix and reject negative values
    pub fn read_count(&mut self) -> SdbResult<usize> {
        let count = self.read_i32()?;
        usize::try_from(count)
            .map_err(|_| SdbError::Decode(format!("Negative count: {}", count)))
    }

    pub fn read_ids(&mut self) -> SdbResult<Vec<RemoteId>> {
        let count = self.read_count()?;
        // Each id needs four bytes; reject impossible counts before allocating
        self.require(count.saturating_mul(4), "id list")?;
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            ids.push(self.read_id()?);
        }
        Ok(ids)
    }

    fn read_len_prefixed(&mut self, what: &'static str) -> SdbResult<&'a [u8]> {
        let len = self.read_count()?;
        self.require(len, what)?;
        let buf: &'a [u8] = self.buf;
        let (bytes, rest) = buf.split_at(len);
        self.buf = rest;
        self.offset += len;
        Ok(bytes)
    }

    /// Length-prefixed UTF-8 string
    pub fn read_string(&mut self) -> SdbResult<String> {
        let start = self.offset;
        let bytes = self.read_len_prefixed("string")?;
        let s = String::from_utf8(bytes.to_vec())
            .map_err(|e| SdbError::Decode(format!("Invalid UTF-8 in string: {}", e)))?;
        if self.trace {
            trace!(offset = start, field = "string", value = ?s, "read");
        }
        Ok(s)
    }

    pub fn read_strings(&mut self) -> SdbResult<Vec<String>> {
        let count = self.read_count()?;
        let mut strings = Vec::with_capacity(count.min(self.remaining() / 4));
        for _ in 0..count {
            strings.push(self.read_string()?);
        }
        Ok(strings)
    }

    /// Length-prefixed UTF-16LE string (prefix is the byte length)
    pub fn read_utf16_string(&mut self) -> SdbResult<String> {
        let start = self.offset;
        let bytes = self.read_len_prefixed("utf-16 string")?;
        if bytes.len() % 2 != 0 {
            return Err(SdbError::Decode(format!(
                "Odd byte length for UTF-16 string: {}",
                bytes.len()
            )));
        }

        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        let s = String::from_utf16(&units)
            .map_err(|e| SdbError::Decode(format!("Invalid UTF-16 in string: {}", e)))?;
        if self.trace {
            trace!(offset = start, field = "utf16_string", value = ?s, "read");
        }
        Ok(s)
    }

    /// String contents in the negotiated encoding (see `write_string_value`)
    pub fn read_string_value(&mut self) -> SdbResult<String> {
        if self.version >= UTF16_STRING_VERSION && self.read_bool()? {
            return self.read_utf16_string();
        }
        self.read_string()
    }
}
