//! Key folding and the sealing AEAD.
//!
//! Lane outputs are folded into a single key with an order-dependent running
//! XOR. The stored seed of lane `i` is masked with the accumulator value
//! *before* lane `i` is absorbed, so a decryptor cannot even begin lane `i`
//! until every earlier lane has been replayed in full. That is what forces
//! decryption to be sequential across lanes.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};

use crate::error::{Error, Result};
use crate::params::HASH_LEN;

/// Keys are single-use (fresh random seeds per payload), so a fixed zero
/// nonce is safe.
const NONCE: [u8; 12] = [0u8; 12];

/// Order-dependent XOR fold of lane outputs. Starts all-zero; after absorbing
/// every lane in order, [`KeyAccumulator::key`] is the sealing key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyAccumulator([u8; HASH_LEN]);

impl KeyAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one lane's final state into the accumulator.
    pub fn absorb(&mut self, lane_state: &[u8; HASH_LEN]) {
        for (acc, byte) in self.0.iter_mut().zip(lane_state) {
            *acc ^= byte;
        }
    }

    /// XOR the current accumulator prefix into `seed`, in place. XOR is an
    /// involution, so the same call masks a seed for storage and recovers it
    /// on replay.
    pub fn mask(&self, seed: &mut [u8]) {
        debug_assert!(seed.len() <= HASH_LEN);
        for (byte, acc) in seed.iter_mut().zip(self.0) {
            *byte ^= acc;
        }
    }

    pub fn key(&self) -> &[u8; HASH_LEN] {
        &self.0
    }
}

/// Seal `plaintext` under a folded key with AES-256-GCM.
pub fn seal(key: &[u8; HASH_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .encrypt(Nonce::from_slice(&NONCE), plaintext)
        .map_err(|_| Error::Validation("plaintext too large to seal".into()))
}

/// Open a sealed ciphertext. Any authentication failure is the single
/// [`Error::Integrity`] outcome; a wrong key is indistinguishable from a
/// tampered ciphertext.
pub fn unseal(key: &[u8; HASH_LEN], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(&NONCE), ciphertext)
        .map_err(|_| Error::Integrity)
}
