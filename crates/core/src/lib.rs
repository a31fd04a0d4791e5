//! # timelock-core
//!
//! A time-lock puzzle engine: encryption spreads a delay budget across many
//! parallel hash-chain lanes, but the payload is built so decryption must
//! replay every lane sequentially. The asymmetry is the product: sealing a
//! secret takes seconds on a machine with many cores and a GPU, while
//! opening it costs the full configured wall-clock delay on any machine.
//!
//! ## How the asymmetry works
//!
//! - Each lane is a chain of dependent PBKDF2-HMAC-SHA256 steps; a chain of
//!   `n` steps cannot be shortcut below `n` derivations.
//! - The encryptor runs all lanes concurrently (rayon CPU lanes plus a wgpu
//!   compute kernel), then folds the lane outputs into one sealing key with
//!   an order-dependent XOR accumulator.
//! - Each lane's stored seed is masked with the accumulator value *before*
//!   that lane is folded in, so a decryptor cannot start lane `i` until
//!   every earlier lane has been fully replayed.
//!
//! ## Example
//!
//! ```no_run
//! use timelock_core::{Engine, EncryptRequest};
//!
//! let engine = Engine::new();
//! let payload = engine.encrypt(
//!     &EncryptRequest {
//!         plaintext: b"see you in five minutes",
//!         cost: 100.0,
//!         seed_len: 4,
//!         cpu_lanes: 8,
//!         gpu_lanes: 1024,
//!     },
//!     |fraction| eprintln!("{:.1}%", fraction * 100.0),
//! )?;
//! println!("{}", payload.to_json()?);
//! # Ok::<(), timelock_core::Error>(())
//! ```

mod benchmark;
mod control;
mod cpu;
mod engine;
mod error;
mod gpu;
mod params;
mod payload;
mod primitive;
mod seal;

pub use benchmark::BenchmarkProfile;
pub use engine::{EncryptRequest, Engine, Status, CPU_LANE_NAME, GPU_LANE_NAME};
pub use error::{Error, Result};
pub use gpu::GpuBackend;
pub use params::*;
pub use payload::{LaneRecord, SealedPayload, PAYLOAD_VERSION};
pub use primitive::{advance, chain, chain_from, LaneSalt};

#[cfg(test)]
mod tests;
