use crate::error::{FrameError, Result};

/// Read a little-endian base-128 varint starting at `offset`.
///
/// Returns the decoded value and the offset just past the last byte read.
/// The shift ceiling bounds runaway continuation chains; it is a loop
/// guard, not a format guarantee.
pub fn read_varint(buf: &[u8], offset: usize) -> Result<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;
    let mut i = offset;

    loop {
        let byte = *buf.get(i).ok_or(FrameError::TruncatedVarint(offset))?;
        i += 1;
        if shift > 63 {
            return Err(FrameError::VarintTooLong(offset));
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i));
        }
        shift += 7;
    }
}

/// Encode a value as a little-endian base-128 varint.
pub fn encode_varint(mut value: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(2);
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            out.push(byte | 0x80);
        } else {
            out.push(byte);
            break;
        }
    }
    out
}
