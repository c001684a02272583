//! Binary encoding of metric batches carried by messages
//!
//! Layout: magic `MV`, version byte, record count (u32), records, then a
//! CRC32 of everything before it. A record is kind (u8), timestamp (i64),
//! value (i64), name (u32 length + UTF-8) and a tag count (u16) followed by
//! length-prefixed tag names and values. Integers are big-endian.

use crate::schema::{MetricType, MetricValue, Tags};
use crate::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc32fast::Hasher;
use std::sync::Arc;

const MAGIC: &[u8; 2] = b"MV";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 7;
const CRC_LEN: usize = 4;

/// Encode a batch of metric values
pub fn encode(values: &[MetricValue]) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + CRC_LEN + values.len() * 48);
    buf.put_slice(MAGIC);
    buf.put_u8(VERSION);
    buf.put_u32(len_u32(values.len(), "record count")?);

    for value in values {
        buf.put_u8(value.kind().code());
        buf.put_i64(value.timestamp());
        buf.put_i64(value.value());
        put_str(&mut buf, value.name())?;
        let tag_count = u16::try_from(value.tags().len())
            .map_err(|_| Error::Serialization(format!("{} has too many tags", value.name())))?;
        buf.put_u16(tag_count);
        for (name, tag_value) in value.tags() {
            put_str(&mut buf, name)?;
            put_str(&mut buf, tag_value)?;
        }
    }

    let mut hasher = Hasher::new();
    hasher.update(&buf);
    buf.put_u32(hasher.finalize());
    Ok(buf.freeze())
}

/// Decode a batch of metric values, verifying framing and checksum
pub fn decode(payload: &[u8]) -> Result<Vec<MetricValue>> {
    if payload.len() < HEADER_LEN + CRC_LEN {
        return Err(Error::Decode(format!("payload too short: {} bytes", payload.len())));
    }
    let (body, crc) = payload.split_at(payload.len() - CRC_LEN);
    let expected = u32::from_be_bytes([crc[0], crc[1], crc[2], crc[3]]);
    let mut hasher = Hasher::new();
    hasher.update(body);
    if hasher.finalize() != expected {
        return Err(Error::Decode("checksum mismatch".to_string()));
    }

    let mut buf = body;
    if &buf[..2] != MAGIC {
        return Err(Error::Decode("bad magic".to_string()));
    }
    buf.advance(2);
    let version = buf.get_u8();
    if version != VERSION {
        return Err(Error::Decode(format!("unsupported version {}", version)));
    }
    let count = buf.get_u32() as usize;

    // each record is at least 23 bytes, so a lying count cannot over-allocate
    let mut values = Vec::with_capacity(count.min(buf.remaining() / 23));
    for _ in 0..count {
        need(&buf, 17)?;
        let kind = buf.get_u8();
        let kind = MetricType::from_code(kind)
            .ok_or_else(|| Error::Decode(format!("unknown metric kind {}", kind)))?;
        let timestamp = buf.get_i64();
        let value = buf.get_i64();
        let name = get_str(&mut buf)?;
        need(&buf, 2)?;
        let tag_count = buf.get_u16();
        let mut tags = Tags::new();
        for _ in 0..tag_count {
            let tag_name = get_str(&mut buf)?;
            let tag_value = get_str(&mut buf)?;
            if let Some(previous) = tags.insert(tag_name, tag_value) {
                return Err(Error::Decode(format!(
                    "metric {} repeats a tag (earlier value '{}')",
                    name, previous
                )));
            }
        }
        values.push(MetricValue::with_shared_tags(Arc::new(tags), name, timestamp, value, kind));
    }

    if buf.has_remaining() {
        return Err(Error::Decode(format!("{} trailing bytes", buf.remaining())));
    }
    Ok(values)
}

fn len_u32(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::Serialization(format!("{} {} exceeds u32", what, len)))
}

fn put_str(buf: &mut BytesMut, s: &str) -> Result<()> {
    buf.put_u32(len_u32(s.len(), "string length")?);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn need(buf: &&[u8], len: usize) -> Result<()> {
    if buf.remaining() < len {
        return Err(Error::Decode(format!(
            "truncated record: need {} bytes, have {}",
            len,
            buf.remaining()
        )));
    }
    Ok(())
}

fn get_str(buf: &mut &[u8]) -> Result<String> {
    need(buf, 4)?;
    let len = buf.get_u32() as usize;
    need(buf, len)?;
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|e| Error::Decode(format!("invalid UTF-8: {}", e)))?
        .to_string();
    buf.advance(len);
    Ok(s)
}
