//! Raw bit operations over a block bitmap buffer.
//!
//! A bitmap block stores one bit per block in a group, least significant bit
//! first within each byte. Bit value 1 means allocated, 0 means free.

/// Marks a single block as allocated.
pub fn bit_set(bmap: &mut [u8], bit: u32) {
    bmap[(bit >> 3) as usize] |= 1 << (bit & 7);
}

/// Marks a single block as free.
pub fn bit_clear(bmap: &mut [u8], bit: u32) {
    bmap[(bit >> 3) as usize] &= !(1 << (bit & 7));
}

/// Returns true if the block is free.
pub fn bit_is_clear(bmap: &[u8], bit: u32) -> bool {
    bmap[(bit >> 3) as usize] & (1 << (bit & 7)) == 0
}

/// Clears `count` consecutive bits starting at `start`. Whole bytes in the
/// middle of the run are zeroed directly.
pub fn bits_clear_range(bmap: &mut [u8], start: u32, count: u32) {
    let mut bit = start;
    let mut remaining = count;

    while remaining > 0 && bit & 7 != 0 {
        bit_clear(bmap, bit);
        bit += 1;
        remaining -= 1;
    }

    while remaining >= 8 {
        bmap[(bit >> 3) as usize] = 0;
        bit += 8;
        remaining -= 8;
    }

    while remaining > 0 {
        bit_clear(bmap, bit);
        bit += 1;
        remaining -= 1;
    }
}

/// Finds the first free bit in `[start, end)`, skipping fully allocated bytes.
/// Returns `None` when every bit in the range is set.
pub fn find_first_clear(bmap: &[u8], start: u32, end: u32) -> Option<u32> {
    let mut bit = start;

    while bit < end && bit & 7 != 0 {
        if bit_is_clear(bmap, bit) {
            return Some(bit);
        }
        bit += 1;
    }

    while bit + 8 <= end {
        let byte = bmap[(bit >> 3) as usize];
        if byte != 0xff {
            for i in 0..8 {
                if byte & (1 << i) == 0 {
                    return Some(bit + i);
                }
            }
        }
        bit += 8;
    }

    while bit < end {
        if bit_is_clear(bmap, bit) {
            return Some(bit);
        }
        bit += 1;
    }

    None
}
