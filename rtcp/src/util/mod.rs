
use bytes::BufMut;

use crate::error::Error;

/// Returns the number of bytes needed to align `len` to a 32-bit boundary.
pub fn get_padding_size(len: usize) -> usize {
    (4 - (len % 4)) % 4
}

/// Writes RTCP padding for a packet of raw length `len`: zero octets, the last one
/// holding the padding count.
pub fn put_padding(mut buf: &mut [u8], len: usize) {
    let padding_size = get_padding_size(len);
    for i in 0..padding_size {
        if i + 1 == padding_size {
            buf.put_u8(padding_size as u8);
        } else {
            buf.put_u8(0);
        }
    }
}

/// Writes `get_padding_size(len)` zero octets without a count byte.
pub fn put_zero_padding(mut buf: &mut [u8], len: usize) {
    for _ in 0..get_padding_size(len) {
        buf.put_u8(0);
    }
}

/// Truncates `val` to `size` bits and ors it into `src` so that its most significant
/// bit lands at bit `start_index`, counting from the MSB of the u16.
pub fn set_nbits_of_uint16(src: u16, size: u16, start_index: u16, val: u16) -> Result<u16, Error> {
    if size == 0 || start_index + size > 16 {
        return Err(Error::InvalidSizeOrStartIndex);
    }

    let val = val & (((1u32 << size) - 1) as u16);

    Ok(src | (val << (16 - size - start_index)))
}

/// Shifts `src` left by `n` and appends the low `n` bits of `val`.
pub fn append_nbits_to_uint32(src: u32, n: u32, val: u32) -> u32 {
    if n == 0 {
        return src;
    }
    if n >= 32 {
        return val;
    }
    (src << n) | (val & (u32::MAX >> (32 - n)))
}

/// Reads `n` bits of `b` starting at bit `begin`, counting from the MSB.
pub fn get_nbits_from_byte(b: u8, begin: u16, n: u16) -> u16 {
    let end_shift = 8 - (begin + n);
    let mask = (0xFFu16 >> begin) & (0xFFu16 << end_shift);
    ((b as u16) & mask) >> end_shift
}

/// Reads a big-endian 24-bit value.
pub fn get_24bits_from_bytes(b: &[u8]) -> u32 {
    ((b[0] as u32) << 16) | ((b[1] as u32) << 8) | (b[2] as u32)
}
