//! Self-calibration: measure what the host is actually capable of.
//!
//! Both searches are geometric. The CPU search grows the lane count by a
//! fixed factor and keeps going while the wall time for a fixed per-lane
//! budget stays close to the single-lane baseline; the GPU search first
//! grows the per-pass step count until a pass is long enough to time
//! reliably, then doubles the lane count while the pass time holds.
//!
//! All rates here are per-lane chain steps per second.

use std::time::{Duration, Instant};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::gpu::GpuBackend;
use crate::params::{
    hashes_per_sec, HASHES_PER_STEP, MAX_CPU_LANES, MAX_GPU_LANES, MIN_GPU_LANES, SALT_LEN,
};
use crate::primitive::{chain, LaneSalt};

/// Single-lane probe budget for the raw CPU speed estimate.
const PROBE_STEPS: u64 = 500_000;
/// CPU lane count growth factor per search round.
const LANE_GROWTH: f64 = 1.2;
/// A lane count is productive while wall time stays within this factor of
/// the single-lane baseline.
const MAX_LOSS_RATIO: f64 = 1.2;

/// GPU search starting points.
const GPU_START_STEPS: u32 = 256;
const GPU_START_LANES: u32 = 256;
/// Per-pass step growth until a pass is long enough to time.
const GPU_STEP_GROWTH: f64 = 1.25;
/// A pass longer than this is reliably measurable.
const FRAME_BUDGET: Duration = Duration::from_millis(17);
/// A pass faster than this at a grown lane count means the driver gave up
/// and returned without doing the work.
const CRASH_FLOOR: Duration = Duration::from_millis(10);
/// Stop doubling GPU lanes once pass time exceeds the best seen by this.
const GPU_MAX_RATIO: f64 = 1.9;

/// Measured per-lane throughput and productive lane counts. Persisted by the
/// caller across sessions; field names match the cache record. A zero
/// `gpu_lane_count` means no usable GPU.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkProfile {
    #[serde(rename = "cpuThread")]
    pub cpu_lane_count: u32,
    #[serde(rename = "cpuHashPerSec")]
    pub cpu_hashes_per_sec: u64,
    #[serde(rename = "gpuThread")]
    pub gpu_lane_count: u32,
    #[serde(rename = "gpuHashPerSec")]
    pub gpu_hashes_per_sec: u64,
}

impl BenchmarkProfile {
    /// Cached profiles come from an external store and are not trusted
    /// until checked.
    pub fn validate(&self) -> Result<()> {
        if self.cpu_lane_count == 0 || self.cpu_lane_count > MAX_CPU_LANES {
            return Err(Error::Validation("profile cpu lane count out of range".into()));
        }
        if self.cpu_hashes_per_sec == 0 {
            return Err(Error::Validation("profile cpu rate must be positive".into()));
        }
        if self.gpu_lane_count != 0 {
            if !self.gpu_lane_count.is_power_of_two()
                || !(MIN_GPU_LANES..=MAX_GPU_LANES).contains(&self.gpu_lane_count)
            {
                return Err(Error::Validation("profile gpu lane count out of range".into()));
            }
            if self.gpu_hashes_per_sec == 0 {
                return Err(Error::Validation("profile gpu rate must be positive".into()));
            }
        }
        Ok(())
    }

    pub fn has_gpu(&self) -> bool {
        self.gpu_lane_count != 0
    }

    pub fn cpu_steps_per_sec(&self) -> f64 {
        self.cpu_hashes_per_sec as f64 / HASHES_PER_STEP as f64
    }

    pub fn gpu_steps_per_sec(&self) -> f64 {
        self.gpu_hashes_per_sec as f64 / HASHES_PER_STEP as f64
    }
}

pub struct CpuCalibration {
    pub lane_count: u32,
    pub steps_per_sec: f64,
}

pub struct GpuCalibration {
    pub lane_count: u32,
    pub steps_per_sec: f64,
}

/// Wall time for `lane_count` lanes each running a `steps_per_lane` budget
/// on the shared rayon pool.
fn time_lanes(lane_count: u32, steps_per_lane: u64) -> Duration {
    let salt = [0u8; SALT_LEN];
    let started = Instant::now();
    (0..lane_count).into_par_iter().for_each(|lane| {
        let lane_salt = LaneSalt::new(&salt, lane);
        let _ = chain(&lane.to_be_bytes(), &lane_salt, steps_per_lane);
    });
    started.elapsed()
}

/// Measure single-lane speed, then grow the lane count while the per-lane
/// budget still completes in near-baseline wall time. `on_progress` receives
/// each accepted (lane count, per-lane steps/s) pair.
pub fn calibrate_cpu(mut on_progress: impl FnMut(u32, f64)) -> CpuCalibration {
    debug!("probing cpu single-lane speed");
    let probe = time_lanes(1, PROBE_STEPS);
    let estimate = (PROBE_STEPS as f64 / probe.as_secs_f64()).max(1.0) as u64;

    // Re-run with roughly one second of work for a stable figure.
    let baseline = time_lanes(1, estimate);
    let steps_per_sec = estimate as f64 / baseline.as_secs_f64();
    info!(
        hashes_per_sec = hashes_per_sec(steps_per_sec),
        "cpu single-lane rate"
    );
    on_progress(1, steps_per_sec);

    let mut lane_count = 1u32;
    loop {
        let candidate = ((lane_count as f64 * LANE_GROWTH).ceil() as u32).min(MAX_CPU_LANES);
        if candidate == lane_count {
            break;
        }
        let elapsed = time_lanes(candidate, estimate);
        let ratio = elapsed.as_secs_f64() / baseline.as_secs_f64();
        debug!(candidate, ratio, "cpu lane probe");
        if ratio > MAX_LOSS_RATIO {
            break;
        }
        lane_count = candidate;
        on_progress(lane_count, steps_per_sec);
    }

    info!(lane_count, "cpu calibration complete");
    CpuCalibration {
        lane_count,
        steps_per_sec,
    }
}

/// Find a measurable per-pass workload, then double the lane count while the
/// device absorbs it. Returns `Ok(None)` when the device degenerates under
/// load (unusable, but not an error for the overall calibration).
pub fn calibrate_gpu(
    gpu: &mut GpuBackend,
    mut on_progress: impl FnMut(u32, f64),
) -> Result<Option<GpuCalibration>> {
    let mut steps = GPU_START_STEPS;
    let mut lane_count = GPU_START_LANES;

    debug!("growing gpu per-pass workload");
    let mut pass_time = gpu.benchmark(lane_count, steps)?;
    while pass_time <= FRAME_BUDGET {
        steps = (steps as f64 * GPU_STEP_GROWTH) as u32;
        pass_time = gpu.benchmark(lane_count, steps)?;
    }
    debug!(steps, ?pass_time, "gpu pass workload fixed");

    let mut best = pass_time;
    let mut chosen_time = pass_time;
    on_progress(lane_count, steps as f64 / chosen_time.as_secs_f64());

    loop {
        let candidate = lane_count * 2;
        if candidate > MAX_GPU_LANES {
            break;
        }
        let elapsed = gpu.benchmark(candidate, steps)?;
        if elapsed < CRASH_FLOOR {
            warn!(candidate, "gpu benchmark degenerated, disabling gpu");
            return Ok(None);
        }
        best = best.min(elapsed);
        let ratio = elapsed.as_secs_f64() / best.as_secs_f64();
        debug!(candidate, ratio, "gpu lane probe");
        if ratio >= GPU_MAX_RATIO {
            break;
        }
        lane_count = candidate;
        chosen_time = elapsed;
        on_progress(lane_count, steps as f64 / chosen_time.as_secs_f64());
    }

    let steps_per_sec = steps as f64 / chosen_time.as_secs_f64();
    info!(
        lane_count,
        hashes_per_sec = hashes_per_sec(steps_per_sec),
        "gpu calibration complete"
    );
    Ok(Some(GpuCalibration {
        lane_count,
        steps_per_sec,
    }))
}
