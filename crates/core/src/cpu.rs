//! CPU backend: one logical lane per rayon worker.
//!
//! Lanes are fanned out over the global rayon pool, so the worker threads are
//! reused across runs. Each lane runs its chain in chunks, hitting the shared
//! gate checkpoint between chunks.

use rayon::prelude::*;

use crate::control::RunGate;
use crate::params::{CHUNK_STEPS, HASH_LEN, SALT_LEN};
use crate::primitive::{advance, chain_from, LaneSalt};

pub struct CpuJob<'a> {
    pub lane_count: u32,
    /// Concatenated lane seeds, `seed_len` bytes each, in lane order.
    pub seeds: &'a [u8],
    pub seed_len: usize,
    pub salt: [u8; SALT_LEN],
    pub steps_per_lane: u64,
}

/// Run every lane of `job` to completion. Returns the concatenated 32-byte
/// final states in lane order, or `None` when the gate was stopped.
pub fn run_lanes(
    job: &CpuJob<'_>,
    gate: &RunGate,
    on_progress: &(dyn Fn(u64) + Sync),
) -> Option<Vec<u8>> {
    debug_assert_eq!(job.seeds.len(), job.lane_count as usize * job.seed_len);

    let states: Vec<Option<[u8; HASH_LEN]>> = (0..job.lane_count)
        .into_par_iter()
        .map(|lane| run_lane(job, lane, gate, on_progress))
        .collect();

    let mut out = Vec::with_capacity(states.len() * HASH_LEN);
    for state in states {
        out.extend_from_slice(&state?);
    }
    Some(out)
}

fn run_lane(
    job: &CpuJob<'_>,
    lane: u32,
    gate: &RunGate,
    on_progress: &(dyn Fn(u64) + Sync),
) -> Option<[u8; HASH_LEN]> {
    let salt = LaneSalt::new(&job.salt, lane);
    let seed = &job.seeds[lane as usize * job.seed_len..][..job.seed_len];

    let mut state = advance(seed, &salt, 0);
    let mut done: u64 = 1;
    let mut unreported: u64 = 1;

    while done < job.steps_per_lane {
        let steps = (job.steps_per_lane - done).min(CHUNK_STEPS);
        state = chain_from(state, &salt, done, steps);
        done += steps;
        unreported += steps;

        if !gate.checkpoint() {
            return None;
        }
        on_progress(unreported);
        unreported = 0;
    }
    if unreported > 0 {
        on_progress(unreported);
    }
    Some(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitive::chain;
    use std::sync::atomic::{AtomicU64, Ordering};

    const SALT: [u8; SALT_LEN] = [9u8; SALT_LEN];

    #[test]
    fn test_lanes_match_direct_chains() {
        let seeds = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let job = CpuJob {
            lane_count: 2,
            seeds: &seeds,
            seed_len: 4,
            salt: SALT,
            steps_per_lane: 50,
        };
        let gate = RunGate::new();
        let out = run_lanes(&job, &gate, &|_| {}).unwrap();

        assert_eq!(&out[..32], chain(&seeds[..4], &LaneSalt::new(&SALT, 0), 50));
        assert_eq!(&out[32..], chain(&seeds[4..], &LaneSalt::new(&SALT, 1), 50));
    }

    #[test]
    fn test_progress_totals_all_steps() {
        let seeds = [0u8; 12];
        let job = CpuJob {
            lane_count: 3,
            seeds: &seeds,
            seed_len: 4,
            salt: SALT,
            steps_per_lane: 17,
        };
        let gate = RunGate::new();
        let counted = AtomicU64::new(0);
        run_lanes(&job, &gate, &|steps| {
            counted.fetch_add(steps, Ordering::Relaxed);
        })
        .unwrap();
        assert_eq!(counted.load(Ordering::Relaxed), 3 * 17);
    }

    #[test]
    fn test_stopped_gate_returns_none() {
        let seeds = [0u8; 4];
        let job = CpuJob {
            lane_count: 1,
            seeds: &seeds,
            seed_len: 4,
            salt: SALT,
            steps_per_lane: 10,
        };
        let gate = RunGate::new();
        gate.stop();
        assert!(run_lanes(&job, &gate, &|_| {}).is_none());
    }
}
