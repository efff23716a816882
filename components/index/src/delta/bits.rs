//! Little-endian bit fields at arbitrary bit offsets of a byte buffer.
//!
//! Bits past the end of a buffer read as zero; writers must only touch bits
//! that lie inside the buffer.

/// Read up to 32 bits starting at bit `offset`.
pub fn get_field(mem: &[u8], offset: u64, size: u32) -> u32 {
    debug_assert!(size <= 32);
    if size == 0 {
        return 0;
    }
    let start = (offset / 8) as usize;
    let mut word = 0u64;
    for (i, b) in mem.iter().skip(start).take(8).enumerate() {
        word |= (*b as u64) << (8 * i);
    }
    ((word >> (offset % 8)) & mask(size)) as u32
}

/// Write the low `size` bits of `value` at bit `offset`.
pub fn set_field(mem: &mut [u8], value: u32, offset: u64, size: u32) {
    debug_assert!(size <= 32);
    if size == 0 {
        return;
    }
    let value = value as u64 & mask(size);
    let shift = offset % 8;
    let start = (offset / 8) as usize;
    let end = ((offset + size as u64 + 7) / 8) as usize;
    let field_mask = mask(size) << shift;
    let shifted = value << shift;
    for (i, b) in mem[start..end].iter_mut().enumerate() {
        let m = (field_mask >> (8 * i)) as u8;
        let v = (shifted >> (8 * i)) as u8;
        *b = (*b & !m) | (v & m);
    }
}

/// Clear `size` bits starting at bit `offset`.
pub fn set_zero(mem: &mut [u8], mut offset: u64, mut size: u64) {
    while size > 0 {
        let n = size.min(32) as u32;
        set_field(mem, 0, offset, n);
        offset += n as u64;
        size -= n as u64;
    }
}

/// Copy `size` bits from `src` at `from` to `dst` at `to`.
pub fn copy_bits(src: &[u8], from: u64, dst: &mut [u8], to: u64, size: u64) {
    let mut done = 0;
    while done < size {
        let n = (size - done).min(32) as u32;
        let v = get_field(src, from + done, n);
        set_field(dst, v, to + done, n);
        done += n as u64;
    }
}

/// Move `size` bits within one buffer; the ranges may overlap.
pub fn move_bits(mem: &mut [u8], from: u64, to: u64, size: u64) {
    if from == to || size == 0 {
        return;
    }
    if to < from {
        let mut done = 0;
        while done < size {
            let n = (size - done).min(32) as u32;
            let v = get_field(mem, from + done, n);
            set_field(mem, v, to + done, n);
            done += n as u64;
        }
    } else {
        let mut left = size;
        while left > 0 {
            let n = left.min(32) as u32;
            left -= n as u64;
            let v = get_field(mem, from + left, n);
            set_field(mem, v, to + left, n);
        }
    }
}

/// Bytes needed to hold `bits` bits.
pub const fn bytes_for(bits: u64) -> usize { ((bits + 7) / 8) as usize }

fn mask(size: u32) -> u64 { (1u64 << size) - 1 }

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn fields_cross_byte_boundaries() {
        let mut mem = vec![0u8; 8];
        set_field(&mut mem, 0b1_0110_1101, 5, 9);
        assert_eq!(get_field(&mem, 5, 9), 0b1_0110_1101);
        assert_eq!(get_field(&mem, 0, 5), 0);
        set_field(&mut mem, u32::MAX, 20, 32);
        assert_eq!(get_field(&mem, 20, 32), u32::MAX);
        assert_eq!(get_field(&mem, 5, 9), 0b1_0110_1101);
        set_zero(&mut mem, 20, 32);
        assert_eq!(get_field(&mem, 14, 32), 0);
    }

    #[test]
    fn reads_past_the_end_are_zero() {
        let mem = [0xffu8; 2];
        assert_eq!(get_field(&mem, 12, 8), 0xf);
    }

    proptest! {
        #[test]
        fn move_preserves_bits(
            seed in proptest::collection::vec(any::<u8>(), 32),
            from in 0u64..64,
            to in 0u64..64,
            size in 0u64..120,
        ) {
            let mut mem = seed.clone();
            move_bits(&mut mem, from, to, size);
            for i in 0..size {
                prop_assert_eq!(get_field(&mem, to + i, 1), get_field(&seed, from + i, 1));
            }
        }
    }
}
