//! Big-endian data stream encoding used by the query bridge.
//!
//! Strings are a `u16` byte length followed by modified UTF-8: NUL is written
//! as `C0 80` and characters outside the BMP as two three-byte surrogates.
//! Integers are fixed-width, signed, big-endian.

use crate::error::{Result, RosterError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

const MAX_UTF_LEN: usize = u16::MAX as usize;

#[derive(Debug, Default)]
pub struct DataOutput {
    buf: BytesMut,
}

impl DataOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_utf(&mut self, value: &str) -> Result<()> {
        let mut encoded = Vec::with_capacity(value.len());
        for unit in value.encode_utf16() {
            match unit {
                0x0001..=0x007f => encoded.push(unit as u8),
                0x0000 | 0x0080..=0x07ff => {
                    encoded.push(0xc0 | ((unit >> 6) & 0x1f) as u8);
                    encoded.push(0x80 | (unit & 0x3f) as u8);
                }
                _ => {
                    encoded.push(0xe0 | ((unit >> 12) & 0x0f) as u8);
                    encoded.push(0x80 | ((unit >> 6) & 0x3f) as u8);
                    encoded.push(0x80 | (unit & 0x3f) as u8);
                }
            }
        }

        if encoded.len() > MAX_UTF_LEN {
            return Err(RosterError::Codec(format!(
                "encoded string too long: {} bytes",
                encoded.len()
            )));
        }

        self.buf.put_u16(encoded.len() as u16);
        self.buf.put_slice(&encoded);
        Ok(())
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.put_i32(value);
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.put_i64(value);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

pub struct DataInput<'a> {
    buf: &'a [u8],
}

fn truncated(what: &str) -> RosterError {
    RosterError::Codec(format!("truncated input while reading {}", what))
}

impl<'a> DataInput<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn read_utf(&mut self) -> Result<String> {
        if self.buf.remaining() < 2 {
            return Err(truncated("string length"));
        }
        let len = self.buf.get_u16() as usize;
        if self.buf.remaining() < len {
            return Err(truncated("string body"));
        }

        let (body, rest) = self.buf.split_at(len);
        self.buf = rest;
        decode_modified_utf8(body)
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        if self.buf.remaining() < 4 {
            return Err(truncated("i32"));
        }
        Ok(self.buf.get_i32())
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        if self.buf.remaining() < 8 {
            return Err(truncated("i64"));
        }
        Ok(self.buf.get_i64())
    }
}

fn decode_modified_utf8(body: &[u8]) -> Result<String> {
    let malformed = || RosterError::Codec("malformed modified UTF-8".to_string());
    let continuation = |byte: Option<&u8>| -> Result<u16> {
        match byte {
            Some(byte) if byte & 0xc0 == 0x80 => Ok((byte & 0x3f) as u16),
            _ => Err(malformed()),
        }
    };

    let mut units = Vec::with_capacity(body.len());
    let mut bytes = body.iter();
    while let Some(&lead) = bytes.next() {
        let unit = if lead & 0x80 == 0 {
            lead as u16
        } else if lead & 0xe0 == 0xc0 {
            (((lead & 0x1f) as u16) << 6) | continuation(bytes.next())?
        } else if lead & 0xf0 == 0xe0 {
            let high = continuation(bytes.next())?;
            let low = continuation(bytes.next())?;
            (((lead & 0x0f) as u16) << 12) | (high << 6) | low
        } else {
            return Err(malformed());
        };
        units.push(unit);
    }

    String::from_utf16(&units).map_err(|_| malformed())
}

/// `i32` key count, then per key its name and `i32` count.
pub fn write_count_map(out: &mut DataOutput, map: &BTreeMap<String, i32>) -> Result<()> {
    out.write_i32(checked_len(map.len())?);
    for (key, count) in map {
        out.write_utf(key)?;
        out.write_i32(*count);
    }
    Ok(())
}

pub fn read_count_map(input: &mut DataInput<'_>) -> Result<BTreeMap<String, i32>> {
    let size = read_len(input)?;
    let mut map = BTreeMap::new();
    for _ in 0..size {
        let key = input.read_utf()?;
        let count = input.read_i32()?;
        map.insert(key, count);
    }
    Ok(map)
}

/// `i32` key count, then per key its name, an `i32` length and the strings.
pub fn write_list_map(out: &mut DataOutput, map: &BTreeMap<String, Vec<String>>) -> Result<()> {
    out.write_i32(checked_len(map.len())?);
    for (key, values) in map {
        out.write_utf(key)?;
        out.write_i32(checked_len(values.len())?);
        for value in values {
            out.write_utf(value)?;
        }
    }
    Ok(())
}

pub fn read_list_map(input: &mut DataInput<'_>) -> Result<BTreeMap<String, Vec<String>>> {
    let size = read_len(input)?;
    let mut map = BTreeMap::new();
    for _ in 0..size {
        let key = input.read_utf()?;
        let len = read_len(input)?;
        let mut values = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            values.push(input.read_utf()?);
        }
        map.insert(key, values);
    }
    Ok(map)
}

fn checked_len(len: usize) -> Result<i32> {
    i32::try_from(len).map_err(|_| RosterError::Codec(format!("collection too large: {}", len)))
}

fn read_len(input: &mut DataInput<'_>) -> Result<usize> {
    let len = input.read_i32()?;
    usize::try_from(len).map_err(|_| RosterError::Codec(format!("negative length: {}", len)))
}
