//! Engine-wide constants and unit conversions.
//!
//! Internally everything is counted in raw chain steps; the public cost unit
//! and the hash/s display figures are derived at the edges.

/// Chain state and lane output size in bytes (SHA-256 digest).
pub const HASH_LEN: usize = 32;

/// Random salt bytes per backend; extended to 16 bytes with the lane index.
pub const SALT_LEN: usize = 12;

/// Maximum steps a backend processes between control checkpoints.
pub const CHUNK_STEPS: u64 = 10_000_000;

/// One cost unit buys this many hash evaluations of delay.
pub const HASHES_PER_COST: u64 = 1_000_000;

/// Hash evaluations per chain step (one HMAC-SHA256 derivation).
pub const HASHES_PER_STEP: u64 = 2;

/// Upper bound on CPU lanes; oversubscription past this only adds overhead.
pub const MAX_CPU_LANES: u32 = 512;

/// GPU lane counts are powers of two within this range so the dispatch grid
/// divides exactly into workgroups.
pub const MIN_GPU_LANES: u32 = 32;
pub const MAX_GPU_LANES: u32 = 65_536;

/// Total chain steps (across all lanes) required for a given cost.
pub fn steps_for_cost(cost: f64) -> u64 {
    (cost * HASHES_PER_COST as f64 / HASHES_PER_STEP as f64).round() as u64
}

/// Display-rate conversion: chain steps/s to hash evaluations/s.
pub fn hashes_per_sec(steps_per_sec: f64) -> f64 {
    steps_per_sec * HASHES_PER_STEP as f64
}
