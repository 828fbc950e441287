use std::ops::RangeInclusive;

/// Helpers to pick apart hardware register values.
/// The index (`bit_idx`) counts from lsb to msb (right to left).
pub trait Bits: Copy {
    fn get_bit(self, bit_idx: u8) -> bool;

    fn set_bit(&mut self, bit_idx: u8, value: bool);

    /// Returns the bits in `bits_range` moved down to position 0.
    fn get_bits(self, bits_range: RangeInclusive<u8>) -> Self;

    /// Replaces the bits in `bits_range` with the low bits of `value`.
    fn set_bits(&mut self, bits_range: RangeInclusive<u8>, value: Self);
}

macro_rules! impl_bits {
    ($($t:ty),*) => {
        $(
            impl Bits for $t {
                fn get_bit(self, bit_idx: u8) -> bool {
                    debug_assert!(u32::from(bit_idx) < <$t>::BITS);
                    (self >> bit_idx) & 1 == 1
                }

                fn set_bit(&mut self, bit_idx: u8, value: bool) {
                    debug_assert!(u32::from(bit_idx) < <$t>::BITS);
                    let mask: $t = 1 << bit_idx;
                    if value {
                        *self |= mask;
                    } else {
                        *self &= !mask;
                    }
                }

                fn get_bits(self, bits_range: RangeInclusive<u8>) -> Self {
                    let start = *bits_range.start();
                    let length = u32::from(*bits_range.end() - start) + 1;
                    let mask = <$t>::MAX.checked_shr(<$t>::BITS - length).unwrap_or(0);
                    (self >> start) & mask
                }

                fn set_bits(&mut self, bits_range: RangeInclusive<u8>, value: Self) {
                    let start = *bits_range.start();
                    let length = u32::from(*bits_range.end() - start) + 1;
                    let mask = <$t>::MAX.checked_shr(<$t>::BITS - length).unwrap_or(0) << start;
                    *self = (*self & !mask) | ((value << start) & mask);
                }
            }
        )*
    };
}

impl_bits!(u16, u32, u64);

/// Reads the little-endian word `word_nth` (0..4) of a quadword.
#[must_use]
pub fn qword_word(qword: &[u8; 16], word_nth: usize) -> u32 {
    let start = word_nth * 4;
    u32::from_le_bytes([
        qword[start],
        qword[start + 1],
        qword[start + 2],
        qword[start + 3],
    ])
}
