//! The slow chain primitive.
//!
//! One step is a single-iteration PBKDF2-HMAC-SHA256 derivation: password is
//! the current 32-byte state (or the raw lane seed at step 0), salt is the
//! 16-byte lane salt with the step index folded in. Each step's output is the
//! next step's password, so a chain of `n` steps cannot be evaluated in fewer
//! than `n` dependent derivations: that data dependency is the entire
//! security argument.

use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;

use crate::params::{HASH_LEN, SALT_LEN};

/// Per-lane salt: 12 shared random bytes plus the lane's seed index, held as
/// four big-endian u32 words so the CPU path and the GPU kernel agree
/// bit-for-bit on the step-index XOR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneSalt {
    words: [u32; 4],
}

impl LaneSalt {
    pub fn new(salt: &[u8; SALT_LEN], seed_index: u32) -> Self {
        let mut words = [0u32; 4];
        for (word, chunk) in words.iter_mut().zip(salt.chunks_exact(4)) {
            *word = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        words[3] = seed_index;
        Self { words }
    }

    pub fn seed_index(&self) -> u32 {
        self.words[3]
    }

    /// The three shared salt words, without the lane index.
    pub fn salt_words(&self) -> [u32; 3] {
        [self.words[0], self.words[1], self.words[2]]
    }

    /// Salt message for one step. The step index is XORed into the low word
    /// of a copy; the salt itself is never mutated. Only the low 32 bits of
    /// the step index participate, matching the GPU kernel's u32 arithmetic.
    fn message(&self, step_index: u64) -> [u8; 16] {
        let mut words = self.words;
        words[0] ^= step_index as u32;
        let mut out = [0u8; 16];
        for (chunk, word) in out.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_be_bytes());
        }
        out
    }
}

/// One chain step: derive the next state from the current one.
pub fn advance(state: &[u8], salt: &LaneSalt, step_index: u64) -> [u8; HASH_LEN] {
    let mut next = [0u8; HASH_LEN];
    pbkdf2_hmac::<Sha256>(state, &salt.message(step_index), 1, &mut next);
    next
}

/// Resume a chain from `state` at step `base` and advance `steps` more steps.
pub fn chain_from(
    mut state: [u8; HASH_LEN],
    salt: &LaneSalt,
    base: u64,
    steps: u64,
) -> [u8; HASH_LEN] {
    for step_index in base..base + steps {
        state = advance(&state, salt, step_index);
    }
    state
}

/// Run a full chain of `steps` steps from a raw seed. Step 0 takes the
/// variable-length seed as password; every later step takes the previous
/// 32-byte state.
pub fn chain(seed: &[u8], salt: &LaneSalt, steps: u64) -> [u8; HASH_LEN] {
    debug_assert!(steps >= 1);
    let state = advance(seed, salt, 0);
    chain_from(state, salt, 1, steps - 1)
}
