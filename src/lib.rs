//! Timelock Library
//!
//! Time-lock puzzle encryption: a secret is sealed behind a configurable
//! amount of forced wall-clock delay.
//!
//! # Overview
//!
//! Encryption spreads a hash-chain delay budget across many parallel lanes
//! (CPU workers and a GPU compute kernel), then folds the lane outputs into
//! one sealing key with an order-dependent accumulator. Decryption has to
//! replay every lane one after another, so it pays the full budget in wall
//! time no matter how much hardware it has.
//!
//! # Example
//!
//! ```no_run
//! use timelock::{Engine, EncryptRequest, SealedPayload};
//!
//! let engine = Engine::new();
//! let payload = engine.encrypt(
//!     &EncryptRequest {
//!         plaintext: b"open after lunch",
//!         cost: 100.0,
//!         seed_len: 4,
//!         cpu_lanes: 8,
//!         gpu_lanes: 1024,
//!     },
//!     |_| {},
//! )?;
//!
//! let json = payload.to_json()?;
//! let restored = SealedPayload::from_json(&json)?;
//! let plaintext = engine.decrypt(&restored, |_| true)?;
//! # Ok::<(), timelock::Error>(())
//! ```

// Re-export the puzzle engine
pub use timelock_core as engine;

// Convenience re-exports
pub use engine::{
    BenchmarkProfile, EncryptRequest, Engine, Error, GpuBackend, LaneRecord, Result,
    SealedPayload, Status, HASHES_PER_COST, HASHES_PER_STEP,
};
