//! Layout transform between flat 32-byte lane states and the big-endian u32
//! word buffer the compute kernel operates on. Pure data movement, no crypto.

use crate::params::HASH_LEN;

/// u32 words per lane state in the device buffer.
pub const WORDS_PER_LANE: usize = HASH_LEN / 4;

/// Flat state bytes (32 per lane, lane order) to device words.
pub fn pack_states(states: &[u8]) -> Vec<u32> {
    debug_assert_eq!(states.len() % HASH_LEN, 0);
    states
        .chunks_exact(4)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Device words back to flat state bytes.
pub fn unpack_states(words: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(words.len() * 4);
    for word in words {
        out.extend_from_slice(&word.to_be_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_round_trip() {
        let states: Vec<u8> = (0..64).collect();
        assert_eq!(unpack_states(&pack_states(&states)), states);
    }

    #[test]
    fn test_pack_is_big_endian() {
        let mut state = [0u8; HASH_LEN];
        state[3] = 1;
        let words = pack_states(&state);
        assert_eq!(words[0], 1);
        assert_eq!(words.len(), WORDS_PER_LANE);
    }
}
