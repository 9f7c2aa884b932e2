//! Utility functions.

/// Aligns an address or size up to the next multiple of `align`.
/// `align` must be zero or a power of two; zero leaves `addr` unchanged.
pub fn align_up(addr: u64, align: u64) -> u64 {
    if align == 0 {
        return addr;
    }
    assert!(align.is_power_of_two());
    (addr + align - 1) & !(align - 1)
}

/// Reads a little-endian `u16` at `offset`, or `None` when it does not fit.
pub fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset.checked_add(2)?)?;
    Some(u16::from_le_bytes(bytes.try_into().ok()?))
}

/// Reads a little-endian `u32` at `offset`, or `None` when it does not fit.
pub fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

/// Reads a little-endian `u64` at `offset`, or `None` when it does not fit.
pub fn read_u64(data: &[u8], offset: usize) -> Option<u64> {
    let bytes = data.get(offset..offset.checked_add(8)?)?;
    Some(u64::from_le_bytes(bytes.try_into().ok()?))
}

/// Reads a pointer of `width` bytes (4 or 8), zero-extended.
pub fn read_pointer(data: &[u8], offset: usize, width: usize) -> Option<u64> {
    match width {
        4 => read_u32(data, offset).map(u64::from),
        8 => read_u64(data, offset),
        _ => None,
    }
}

/// Writes the low `width` bytes (4 or 8) of `value` at `offset`.
/// Returns `false` when the write would not fit.
pub fn write_pointer(data: &mut [u8], offset: usize, width: usize, value: u64) -> bool {
    let Some(end) = offset.checked_add(width) else {
        return false;
    };
    let Some(dst) = data.get_mut(offset..end) else {
        return false;
    };
    match width {
        4 => dst.copy_from_slice(&(value as u32).to_le_bytes()),
        8 => dst.copy_from_slice(&value.to_le_bytes()),
        _ => return false,
    }
    true
}

/// Encodes `s` as NUL-terminated UTF-16LE.
pub fn utf16z(s: &str) -> Vec<u8> {
    s.encode_utf16()
        .chain(std::iter::once(0))
        .flat_map(u16::to_le_bytes)
        .collect()
}
