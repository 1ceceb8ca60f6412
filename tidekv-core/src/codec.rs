//! Binary entry encoding shared by WAL records and SSTable data blocks
//!
//! Layout (little endian):
//! - 1 byte: flags (deleted, pointer, has expiry)
//! - 8 bytes: sequence number
//! - 4 bytes: key length, N bytes: key
//! - 8 bytes: expiry timestamp (only if flagged)
//! - pointer: 4 bytes file id, 8 bytes offset, 4 bytes length
//!   or inline: 4 bytes value length, N bytes value

use crate::{Entry, EntryMeta, Result, TideError, Value, ValuePointer};
use bytes::{Buf, BufMut, Bytes, BytesMut};

const FLAG_DELETED: u8 = 0b001;
const FLAG_POINTER: u8 = 0b010;
const FLAG_EXPIRY: u8 = 0b100;

/// Fail with `Corruption` unless `buf` holds at least `n` more bytes
pub fn ensure_remaining(buf: &impl Buf, n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        return Err(TideError::Corruption(format!(
            "truncated {}: need {} bytes, have {}",
            what,
            n,
            buf.remaining()
        )));
    }
    Ok(())
}

/// Read a u32 length prefix followed by that many bytes
pub fn get_length_prefixed(buf: &mut Bytes, what: &str) -> Result<Bytes> {
    ensure_remaining(buf, 4, what)?;
    let len = buf.get_u32_le() as usize;
    ensure_remaining(buf, len, what)?;
    Ok(buf.split_to(len))
}

/// Write a u32 length prefix followed by the bytes
pub fn put_length_prefixed(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32_le(data.len() as u32);
    buf.put_slice(data);
}

/// Number of bytes `encode_entry` will produce
pub fn encoded_len(entry: &Entry) -> usize {
    let mut len = 1 + 8 + 4 + entry.key.len();
    if entry.meta.expires_at.is_some() {
        len += 8;
    }
    len += match &entry.value {
        Value::Pointer(_) => 16,
        Value::Inline(v) => 4 + v.len(),
    };
    len
}

/// Append the encoded entry to `buf`
pub fn encode_entry(entry: &Entry, buf: &mut BytesMut) {
    let mut flags = 0u8;
    if entry.meta.deleted {
        flags |= FLAG_DELETED;
    }
    if matches!(entry.value, Value::Pointer(_)) {
        flags |= FLAG_POINTER;
    }
    if entry.meta.expires_at.is_some() {
        flags |= FLAG_EXPIRY;
    }

    buf.reserve(encoded_len(entry));
    buf.put_u8(flags);
    buf.put_u64_le(entry.seq);
    put_length_prefixed(buf, &entry.key);
    if let Some(expires_at) = entry.meta.expires_at {
        buf.put_i64_le(expires_at);
    }
    match &entry.value {
        Value::Pointer(ptr) => {
            buf.put_u32_le(ptr.file_id);
            buf.put_u64_le(ptr.offset);
            buf.put_u32_le(ptr.len);
        }
        Value::Inline(v) => put_length_prefixed(buf, v),
    }
}

/// Decode one entry from the front of `buf`, advancing it
pub fn decode_entry(buf: &mut Bytes) -> Result<Entry> {
    ensure_remaining(buf, 9, "entry header")?;
    let flags = buf.get_u8();
    if flags & !(FLAG_DELETED | FLAG_POINTER | FLAG_EXPIRY) != 0 {
        return Err(TideError::Corruption(format!("invalid entry flags {:#04x}", flags)));
    }
    let seq = buf.get_u64_le();
    let key = get_length_prefixed(buf, "entry key")?;

    let expires_at = if flags & FLAG_EXPIRY != 0 {
        ensure_remaining(buf, 8, "entry expiry")?;
        Some(buf.get_i64_le())
    } else {
        None
    };

    let value = if flags & FLAG_POINTER != 0 {
        ensure_remaining(buf, 16, "value pointer")?;
        Value::Pointer(ValuePointer {
            file_id: buf.get_u32_le(),
            offset: buf.get_u64_le(),
            len: buf.get_u32_le(),
        })
    } else {
        Value::Inline(get_length_prefixed(buf, "entry value")?)
    };

    Ok(Entry {
        key,
        value,
        seq,
        meta: EntryMeta {
            deleted: flags & FLAG_DELETED != 0,
            expires_at,
        },
    })
}
