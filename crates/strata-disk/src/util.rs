use crate::{DiskError, Result};

/// Rounds `value` up to a multiple of `alignment`; a zero alignment is an error.
pub fn align_up_u64(value: u64, alignment: u64) -> Result<u64> {
    value
        .checked_next_multiple_of(alignment)
        .ok_or(DiskError::OffsetOverflow)
}

pub fn align_down_u64(value: u64, alignment: u64) -> Result<u64> {
    if alignment == 0 {
        return Err(DiskError::OffsetOverflow);
    }
    Ok(value - value % alignment)
}

pub fn checked_end(offset: u64, len: u64) -> Result<u64> {
    offset.checked_add(len).ok_or(DiskError::OffsetOverflow)
}

/// Validates that `[offset, offset + len)` lies within `capacity`.
pub fn checked_range(offset: u64, len: u64, capacity: u64) -> Result<()> {
    let end = checked_end(offset, len)?;
    if end > capacity {
        return Err(DiskError::OutOfRange {
            offset,
            len,
            capacity,
        });
    }
    Ok(())
}

/// Number of bytes a clamped read at `pos` may transfer.
pub fn clamped_len(pos: u64, requested: usize, capacity: u64) -> usize {
    if pos >= capacity {
        return 0;
    }
    let available = capacity - pos;
    if (requested as u64) > available {
        available as usize
    } else {
        requested
    }
}

pub(crate) fn le_u16(bytes: &[u8]) -> u16 {
    u16::from_le_bytes([bytes[0], bytes[1]])
}

pub(crate) fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

pub(crate) fn le_u64(bytes: &[u8]) -> u64 {
    u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}

pub(crate) fn put_u16(buf: &mut [u8], offset: usize, val: u16) {
    buf[offset..offset + 2].copy_from_slice(&val.to_le_bytes());
}

pub(crate) fn put_u32(buf: &mut [u8], offset: usize, val: u32) {
    buf[offset..offset + 4].copy_from_slice(&val.to_le_bytes());
}

pub(crate) fn put_u64(buf: &mut [u8], offset: usize, val: u64) {
    buf[offset..offset + 8].copy_from_slice(&val.to_le_bytes());
}
