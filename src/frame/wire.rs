//! Primitive readers and writers for native-protocol body notations:
//! `[string]`, `[long string]`, `[short bytes]`, `[bytes]`, `[string list]`
//! and `[string multimap]`, all big-endian.

use crate::error::{GeminoError, Result};
use bytes::{BufMut, BytesMut};
use std::collections::HashMap;

/// Positional reader over a frame body.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(GeminoError::Protocol(format!(
                "body truncated: needed {} bytes at offset {}, {} remain",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn get_i16(&mut self) -> Result<i16> {
        Ok(self.get_u16()? as i16)
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// `[string]`: u16 length prefix, UTF-8 payload.
    pub fn get_string(&mut self) -> Result<String> {
        let len = self.get_u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| GeminoError::Protocol("invalid UTF-8 in [string]".to_string()))
    }

    /// `[long string]`: i32 length prefix, UTF-8 payload.
    pub fn get_long_string(&mut self) -> Result<String> {
        let len = self.get_i32()?;
        if len < 0 {
            return Err(GeminoError::Protocol(format!(
                "negative [long string] length: {}",
                len
            )));
        }
        let bytes = self.take(len as usize)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| GeminoError::Protocol("invalid UTF-8 in [long string]".to_string()))
    }

    /// `[short bytes]`: u16 length prefix, opaque payload.
    pub fn get_short_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.get_u16()? as usize;
        self.take(len)
    }

    /// `[bytes]`: i32 length prefix; negative lengths mean null / not-set.
    pub fn get_bytes(&mut self) -> Result<Option<&'a [u8]>> {
        let len = self.get_i32()?;
        if len < 0 {
            return Ok(None);
        }
        Ok(Some(self.take(len as usize)?))
    }

    /// `[string list]`: u16 count, then that many `[string]`s.
    pub fn get_string_list(&mut self) -> Result<Vec<String>> {
        let count = self.get_u16()? as usize;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.get_string()?);
        }
        Ok(out)
    }

    /// `[string multimap]`: u16 count, then that many `[string] [string list]` pairs.
    pub fn get_string_multimap(&mut self) -> Result<HashMap<String, Vec<String>>> {
        let count = self.get_u16()? as usize;
        let mut out = HashMap::with_capacity(count);
        for _ in 0..count {
            let key = self.get_string()?;
            let values = self.get_string_list()?;
            out.insert(key, values);
        }
        Ok(out)
    }
}

pub fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

pub fn put_long_string(buf: &mut BytesMut, s: &str) {
    buf.put_i32(s.len() as i32);
    buf.put_slice(s.as_bytes());
}

pub fn put_short_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u16(bytes.len() as u16);
    buf.put_slice(bytes);
}

pub fn put_string_list(buf: &mut BytesMut, list: &[String]) {
    buf.put_u16(list.len() as u16);
    for s in list {
        put_string(buf, s);
    }
}

pub fn put_string_multimap(buf: &mut BytesMut, map: &HashMap<String, Vec<String>>) {
    buf.put_u16(map.len() as u16);
    // Deterministic order keeps rebuilt bodies stable across calls.
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    for key in keys {
        put_string(buf, key);
        put_string_list(buf, &map[key]);
    }
}
