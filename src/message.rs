//! Primitive wire codec: little-endian integers, strings and qids.
//!
//! Decoders take a `&mut &[u8]` cursor and advance it only on success, so a
//! failed pop leaves the caller's view of the buffer untouched. Encoders append
//! to a growable buffer and never touch bytes already in it.

use crate::error::{Error, Result};
use crate::protocol::{Qid, QidType};

fn take<'a>(buf: &mut &'a [u8], len: usize) -> Result<&'a [u8]> {
    if buf.len() < len {
        return Err(Error::TruncatedInput);
    }
    let (head, rest) = buf.split_at(len);
    *buf = rest;
    Ok(head)
}

fn take_array<const N: usize>(buf: &mut &[u8]) -> Result<[u8; N]> {
    let mut out = [0u8; N];
    out.copy_from_slice(take(buf, N)?);
    Ok(out)
}

pub fn pop_u8(buf: &mut &[u8]) -> Result<u8> {
    Ok(take_array::<1>(buf)?[0])
}

pub fn pop_u16(buf: &mut &[u8]) -> Result<u16> {
    take_array(buf).map(u16::from_le_bytes)
}

pub fn pop_u32(buf: &mut &[u8]) -> Result<u32> {
    take_array(buf).map(u32::from_le_bytes)
}

pub fn pop_u64(buf: &mut &[u8]) -> Result<u64> {
    take_array(buf).map(u64::from_le_bytes)
}

/// Pop `len` raw bytes.
pub fn pop_bytes<'a>(buf: &mut &'a [u8], len: usize) -> Result<&'a [u8]> {
    take(buf, len)
}

/// Pop a `u16`-prefixed string as raw bytes. No UTF-8 validation is done.
pub fn pop_string(buf: &mut &[u8]) -> Result<Vec<u8>> {
    let mut cur = *buf;
    let len = pop_u16(&mut cur)? as usize;
    let bytes = take(&mut cur, len)?;
    *buf = cur;
    Ok(bytes.to_vec())
}

/// Pop a qid in wire order: type, version, path.
pub fn pop_qid(buf: &mut &[u8]) -> Result<Qid> {
    let mut cur = *buf;
    let typ = pop_u8(&mut cur)?;
    let version = pop_u32(&mut cur)?;
    let path = pop_u64(&mut cur)?;
    *buf = cur;
    Ok(Qid {
        typ: QidType::from_bits_retain(typ),
        version,
        path,
    })
}

pub fn push_u8(out: &mut Vec<u8>, value: u8) {
    out.push(value);
}

pub fn push_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

pub fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

pub fn push_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

pub fn push_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(bytes);
}

/// Push a `u16`-prefixed string. Fails if it does not fit the prefix.
pub fn push_string(out: &mut Vec<u8>, value: &[u8]) -> Result<()> {
    let len = u16::try_from(value.len()).map_err(|_| Error::StringTooLong(value.len()))?;
    push_u16(out, len);
    out.extend_from_slice(value);
    Ok(())
}

pub fn push_qid(out: &mut Vec<u8>, qid: &Qid) {
    push_u8(out, qid.typ.bits());
    push_u32(out, qid.version);
    push_u64(out, qid.path);
}

pub fn dump_hex(buf: &[u8]) -> String {
    let mut out = String::with_capacity(buf.len() * 3);
    for (idx, byte) in buf.iter().enumerate() {
        if idx > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_are_little_endian() {
        let mut out = Vec::new();
        push_u16(&mut out, 0x0102);
        push_u32(&mut out, 0x0304_0506);
        push_u64(&mut out, 0x0708_090a_0b0c_0d0e);
        assert_eq!(
            out,
            [0x02, 0x01, 0x06, 0x05, 0x04, 0x03, 0x0e, 0x0d, 0x0c, 0x0b, 0x0a, 0x09, 0x08, 0x07]
        );

        let mut cur = out.as_slice();
        assert_eq!(pop_u16(&mut cur).unwrap(), 0x0102);
        assert_eq!(pop_u32(&mut cur).unwrap(), 0x0304_0506);
        assert_eq!(pop_u64(&mut cur).unwrap(), 0x0708_090a_0b0c_0d0e);
        assert!(cur.is_empty());
    }

    #[test]
    fn short_buffers_are_truncated_input() {
        let bytes = [1u8, 2, 3];
        let mut cur = &bytes[..];
        assert!(matches!(pop_u32(&mut cur), Err(Error::TruncatedInput)));
        assert_eq!(cur.len(), 3);
        assert!(matches!(pop_u64(&mut &bytes[..]), Err(Error::TruncatedInput)));
        assert!(matches!(pop_u8(&mut &[][..]), Err(Error::TruncatedInput)));
        assert!(matches!(pop_u16(&mut &bytes[..1]), Err(Error::TruncatedInput)));
    }

    #[test]
    fn overlong_string_prefix_leaves_cursor_untouched() {
        let bytes = [5u8, 0, b'a', b'b'];
        let mut cur = &bytes[..];
        assert!(matches!(pop_string(&mut cur), Err(Error::TruncatedInput)));
        assert_eq!(cur, &bytes[..]);
    }

    #[test]
    fn strings_are_raw_bytes() {
        let mut out = vec![0xaa];
        push_string(&mut out, &[0xff, 0xfe]).unwrap();
        push_string(&mut out, b"").unwrap();
        assert_eq!(out, [0xaa, 2, 0, 0xff, 0xfe, 0, 0]);

        let mut cur = &out[1..];
        assert_eq!(pop_string(&mut cur).unwrap(), vec![0xff, 0xfe]);
        assert_eq!(pop_string(&mut cur).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn string_longer_than_prefix_is_rejected() {
        let mut out = vec![7];
        let long = vec![b'x'; 65536];
        assert!(matches!(
            push_string(&mut out, &long),
            Err(Error::StringTooLong(65536))
        ));
        assert_eq!(out, [7]);
    }

    #[test]
    fn qid_field_order() {
        let qid = Qid {
            typ: QidType::from_bits_retain(0x80),
            version: 7,
            path: 123_456_789,
        };
        let mut out = Vec::new();
        push_qid(&mut out, &qid);
        assert_eq!(out.len(), 13);
        assert_eq!(out[0], 0x80);
        assert_eq!(&out[1..5], &7u32.to_le_bytes());
        assert_eq!(&out[5..], &123_456_789u64.to_le_bytes());
        assert_eq!(pop_qid(&mut out.as_slice()).unwrap(), qid);
    }

    #[test]
    fn truncated_qid_does_not_advance() {
        let bytes = [0x80u8, 1, 0, 0, 0, 9];
        let mut cur = &bytes[..];
        assert!(pop_qid(&mut cur).is_err());
        assert_eq!(cur.len(), bytes.len());
    }

    #[test]
    fn hex_dump() {
        assert_eq!(dump_hex(&[0x00, 0xab, 0x7f]), "00 ab 7f");
        assert_eq!(dump_hex(&[]), "");
    }
}
