use crate::error::TransportError;

/// A counter over an N-bit sequence space that wraps around, plus the signed distance between
///  two sequence numbers in that space.
///
/// Distance works by shifting both values into the high bits of a 64 bit word, subtracting and
///  shifting back arithmetically. This sign-extends the wrapped difference, so values up to half
///  the space 'ahead' are positive and values up to half the space 'behind' are negative.
///
/// NB: for two values that are exactly half the space apart, the result is the minimum negative
///  value regardless of argument order.
#[derive(Debug, Clone)]
pub struct Sequencer {
    bits: u32,
    shift: u32,
    mask: u64,
    value: u64,
}

impl Sequencer {
    pub fn new(bits: u32) -> Result<Sequencer, TransportError> {
        if !(1..=63).contains(&bits) {
            return Err(TransportError::invalid_argument("bits", format!("must be between 1 and 63, was {}", bits)));
        }

        Ok(Sequencer {
            bits,
            shift: 64 - bits,
            mask: (1u64 << bits) - 1,
            value: 0,
        })
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// the number of distinct values in the sequence space
    pub fn size(&self) -> u64 {
        self.mask + 1
    }

    /// returns the current value and advances the counter
    pub fn next(&mut self) -> u64 {
        let result = self.value;
        self.value = self.next_after(self.value);
        result
    }

    pub fn next_after(&self, sequence: u64) -> u64 {
        self.move_in_bounds(sequence.wrapping_add(1))
    }

    pub fn move_in_bounds(&self, sequence: u64) -> u64 {
        sequence & self.mask
    }

    pub fn distance(&self, from: u64, to: u64) -> i64 {
        let from = from << self.shift;
        let to = to << self.shift;
        (from.wrapping_sub(to) as i64) >> self.shift
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::zero(0)]
    #[case::too_big(64)]
    #[case::way_too_big(100)]
    fn test_new_invalid(#[case] bits: u32) {
        assert!(matches!(Sequencer::new(bits), Err(TransportError::InvalidArgument { .. })));
    }

    #[rstest]
    #[case::one(1)]
    #[case::eight(8)]
    #[case::sixteen(16)]
    #[case::max(63)]
    fn test_new_valid(#[case] bits: u32) {
        let sequencer = Sequencer::new(bits).unwrap();
        assert_eq!(sequencer.bits(), bits);
    }

    #[rstest]
    #[case::b1(1)]
    #[case::b3(3)]
    #[case::b8(8)]
    #[case::b12(12)]
    fn test_next_wraps(#[case] bits: u32) {
        let mut sequencer = Sequencer::new(bits).unwrap();
        let size = 1u64 << bits;
        for expected in 0..size {
            assert_eq!(sequencer.next(), expected);
        }
        assert_eq!(sequencer.next(), 0);
        assert_eq!(sequencer.next(), 1);
    }

    #[rstest]
    #[case::simple(8, 5, 6)]
    #[case::wrap(8, 255, 0)]
    #[case::wrap_16(16, 65535, 0)]
    #[case::out_of_bounds(8, 300, 45)]
    fn test_next_after(#[case] bits: u32, #[case] sequence: u64, #[case] expected: u64) {
        assert_eq!(Sequencer::new(bits).unwrap().next_after(sequence), expected);
    }

    #[rstest]
    #[case::in_bounds(8, 17, 17)]
    #[case::one_over(8, 256, 0)]
    #[case::max_u64(8, u64::MAX, 255)]
    #[case::max_u64_16(16, u64::MAX, 65535)]
    fn test_move_in_bounds(#[case] bits: u32, #[case] sequence: u64, #[case] expected: u64) {
        assert_eq!(Sequencer::new(bits).unwrap().move_in_bounds(sequence), expected);
    }

    #[rstest]
    #[case::equal(8, 10, 10, 0)]
    #[case::ahead(8, 12, 10, 2)]
    #[case::behind(8, 10, 12, -2)]
    #[case::ahead_wrapped(8, 1, 254, 3)]
    #[case::behind_wrapped(8, 254, 1, -3)]
    #[case::max_ahead(8, 127, 0, 127)]
    #[case::max_behind(8, 0, 127, -127)]
    #[case::half_space(8, 128, 0, -128)]
    #[case::half_space_reversed(8, 0, 128, -128)]
    #[case::sixteen_wrapped(16, 2, 65534, 4)]
    #[case::sixty_three(63, 0, (1u64 << 63) - 1, 1)]
    fn test_distance(#[case] bits: u32, #[case] from: u64, #[case] to: u64, #[case] expected: i64) {
        assert_eq!(Sequencer::new(bits).unwrap().distance(from, to), expected);
    }

    #[rstest]
    #[case::b4(4)]
    #[case::b6(6)]
    fn test_distance_is_antisymmetric(#[case] bits: u32) {
        let sequencer = Sequencer::new(bits).unwrap();
        let size = 1u64 << bits;
        let half = size / 2;
        for a in 0..size {
            for b in 0..size {
                let d = sequencer.distance(a, b);
                if sequencer.distance(a, b).unsigned_abs() == half {
                    // tie: both directions yield the minimum value
                    assert_eq!(sequencer.distance(b, a), d);
                }
                else {
                    assert_eq!(sequencer.distance(b, a), -d, "a={}, b={}", a, b);
                }
            }
        }
    }
}
