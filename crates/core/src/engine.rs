//! Lane orchestration and the public encrypt/decrypt surface.
//!
//! The [`Engine`] owns the shared run gate, the cached benchmark profile and
//! the lazily created GPU backend. Runs are serialized: a second operation
//! while one is in flight gets [`Error::Busy`]. Encryption fans lanes out
//! across both backends concurrently; decryption replays every lane in
//! strict order on the CPU chain path, because a single sequential chain has
//! no parallelism for the GPU to exploit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread;

use tracing::{debug, info, warn};

use crate::benchmark::{self, BenchmarkProfile};
use crate::control::RunGate;
use crate::cpu::{self, CpuJob};
use crate::error::{Error, Result};
use crate::gpu::{GpuBackend, GpuOutcome};
use crate::params::{
    hashes_per_sec, steps_for_cost, CHUNK_STEPS, HASH_LEN, MAX_CPU_LANES, MAX_GPU_LANES,
    MIN_GPU_LANES, SALT_LEN,
};
use crate::payload::{LaneRecord, SealedPayload};
use crate::primitive::{advance, chain_from, LaneSalt};
use crate::seal::{self, KeyAccumulator};

pub const CPU_LANE_NAME: &str = "CPU";
pub const GPU_LANE_NAME: &str = "GPU";

/// Target wall time for one GPU pass; keeps the device responsive without
/// drowning the run in dispatch overhead.
const PASS_TARGET_MS: f64 = 25.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ready,
    Benchmarking,
    Running,
    Paused,
}

pub struct EncryptRequest<'a> {
    pub plaintext: &'a [u8],
    /// Delay cost in millions of hash evaluations.
    pub cost: f64,
    /// Stored seed bytes per lane, 1..=32.
    pub seed_len: usize,
    pub cpu_lanes: u32,
    pub gpu_lanes: u32,
}

/// How the total delay budget is sliced across lanes. A GPU lane counts as
/// one slice; a CPU lane counts as `cpu_slices_per_lane` slices because each
/// CPU lane is that many times faster than a single GPU lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WorkSplit {
    pub cpu_lanes: u32,
    pub gpu_lanes: u32,
    pub steps_per_slice: u64,
    pub cpu_slices_per_lane: u64,
}

impl WorkSplit {
    pub fn gpu_steps(&self) -> u64 {
        self.steps_per_slice
    }

    pub fn cpu_steps(&self) -> u64 {
        self.steps_per_slice * self.cpu_slices_per_lane
    }

    pub fn slice_count(&self) -> u64 {
        self.gpu_lanes as u64 + self.cpu_lanes as u64 * self.cpu_slices_per_lane
    }

    /// Total steps across all lanes; never less than the requested budget.
    pub fn total_steps(&self) -> u64 {
        self.steps_per_slice * self.slice_count()
    }
}

/// Clamp requested lane counts into their supported ranges. Only an
/// unsatisfiable request (no lanes at all) is an error.
pub(crate) fn clamp_lanes(cpu_lanes: u32, gpu_lanes: u32) -> Result<(u32, u32)> {
    let cpu = cpu_lanes.min(MAX_CPU_LANES);
    let mut gpu = gpu_lanes;
    if gpu > 0 {
        if gpu < MIN_GPU_LANES {
            gpu = MIN_GPU_LANES;
        }
        if !gpu.is_power_of_two() {
            // round down to the grid-friendly power of two
            gpu = 1 << (31 - gpu.leading_zeros());
        }
        gpu = gpu.min(MAX_GPU_LANES);
    }
    if cpu == 0 && gpu == 0 {
        return Err(Error::Validation(
            "at least one cpu or gpu lane is required".into(),
        ));
    }
    Ok((cpu, gpu))
}

pub(crate) fn compute_split(
    cost: f64,
    cpu_lanes: u32,
    gpu_lanes: u32,
    profile: &BenchmarkProfile,
) -> WorkSplit {
    let required = steps_for_cost(cost);
    let cpu_slices_per_lane = if gpu_lanes > 0 && cpu_lanes > 0 {
        (profile.cpu_steps_per_sec() / profile.gpu_steps_per_sec())
            .round()
            .max(1.0) as u64
    } else {
        1
    };
    let slice_count = gpu_lanes as u64 + cpu_lanes as u64 * cpu_slices_per_lane;
    // Ceiling division: rounding the per-slice budget up means the payload
    // always carries at least the requested amount of work.
    let steps_per_slice = required.div_ceil(slice_count);
    WorkSplit {
        cpu_lanes,
        gpu_lanes,
        steps_per_slice,
        cpu_slices_per_lane,
    }
}

/// GPU task run on its own scoped thread. Returns the backend so the engine
/// can keep it for the next run, plus how the run ended.
pub(crate) type GpuTask<'a> = Box<
    dyn FnOnce(&RunGate, &(dyn Fn(u64) + Sync)) -> (Option<GpuBackend>, GpuOutcome) + Send + 'a,
>;

struct Shared {
    status: Status,
    profile: Option<BenchmarkProfile>,
    gpu: Option<GpuBackend>,
    gpu_available: bool,
    gpu_probed: bool,
}

pub struct Engine {
    shared: Mutex<Shared>,
    gate: RunGate,
}

/// Restores `Ready` on every exit path of a run.
struct RunGuard<'a> {
    engine: &'a Engine,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.engine.shared.lock().unwrap().status = Status::Ready;
    }
}

/// Returns a checked-out GPU backend to the engine unless the run consumed
/// it (handed it to the GPU task).
struct GpuLease<'a> {
    engine: &'a Engine,
    backend: Option<GpuBackend>,
}

impl Drop for GpuLease<'_> {
    fn drop(&mut self) {
        if let Some(backend) = self.backend.take() {
            self.engine.return_gpu(backend);
        }
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            shared: Mutex::new(Shared {
                status: Status::Ready,
                profile: None,
                gpu: None,
                gpu_available: true,
                gpu_probed: false,
            }),
            gate: RunGate::new(),
        }
    }

    pub fn status(&self) -> Status {
        self.shared.lock().unwrap().status
    }

    pub fn profile(&self) -> Option<BenchmarkProfile> {
        self.shared.lock().unwrap().profile
    }

    /// Install an externally persisted profile. Replaces the whole profile
    /// or none of it.
    pub fn set_profile(&self, profile: BenchmarkProfile) -> Result<()> {
        profile.validate()?;
        self.shared.lock().unwrap().profile = Some(profile);
        Ok(())
    }

    /// Whether the GPU is still usable this session. Starts optimistic;
    /// cleared by an init failure or a crash.
    pub fn gpu_available(&self) -> bool {
        self.shared.lock().unwrap().gpu_available
    }

    /// Pause the active run at the next checkpoints. No-op unless running.
    pub fn pause(&self) {
        let mut shared = self.shared.lock().unwrap();
        if shared.status == Status::Running {
            shared.status = Status::Paused;
            self.gate.pause();
        }
    }

    /// Resume a paused run. No-op unless paused.
    pub fn resume(&self) {
        let mut shared = self.shared.lock().unwrap();
        if shared.status == Status::Paused {
            shared.status = Status::Running;
            self.gate.resume();
        }
    }

    /// Stop the active run at the next checkpoints, waking paused workers.
    /// No-op when nothing is running.
    pub fn stop(&self) {
        let shared = self.shared.lock().unwrap();
        if matches!(shared.status, Status::Running | Status::Paused) {
            self.gate.stop();
        }
    }

    fn begin_run(&self, status: Status) -> Result<RunGuard<'_>> {
        let mut shared = self.shared.lock().unwrap();
        if shared.status != Status::Ready {
            return Err(Error::Busy);
        }
        shared.status = status;
        self.gate.reset();
        Ok(RunGuard { engine: self })
    }

    fn checkout_gpu(&self) -> Option<GpuBackend> {
        let mut shared = self.shared.lock().unwrap();
        if !shared.gpu_available {
            return None;
        }
        if let Some(backend) = shared.gpu.take() {
            return Some(backend);
        }
        if shared.gpu_probed {
            return None;
        }
        shared.gpu_probed = true;
        drop(shared);

        match GpuBackend::init() {
            Ok(backend) => {
                info!(adapter = backend.adapter_name(), "gpu backend initialized");
                Some(backend)
            }
            Err(err) => {
                warn!(%err, "gpu unavailable, running cpu-only");
                self.shared.lock().unwrap().gpu_available = false;
                None
            }
        }
    }

    fn return_gpu(&self, backend: GpuBackend) {
        self.shared.lock().unwrap().gpu = Some(backend);
    }

    fn disable_gpu(&self) {
        let mut shared = self.shared.lock().unwrap();
        shared.gpu_available = false;
        shared.gpu = None;
    }

    /// Measure this host and replace the cached profile. `on_update` fires
    /// after every accepted search round with the profile so far.
    pub fn benchmark(
        &self,
        on_update: impl FnMut(&BenchmarkProfile),
    ) -> Result<BenchmarkProfile> {
        let _run = self.begin_run(Status::Benchmarking)?;
        Ok(self.run_calibration(on_update))
    }

    /// Calibration itself cannot fail: a broken GPU just yields a CPU-only
    /// profile.
    fn run_calibration(&self, mut on_update: impl FnMut(&BenchmarkProfile)) -> BenchmarkProfile {
        let mut profile = BenchmarkProfile {
            cpu_lane_count: 1,
            cpu_hashes_per_sec: 0,
            gpu_lane_count: 0,
            gpu_hashes_per_sec: 0,
        };

        let cpu = benchmark::calibrate_cpu(|lane_count, steps_per_sec| {
            profile.cpu_lane_count = lane_count;
            profile.cpu_hashes_per_sec = hashes_per_sec(steps_per_sec).max(1.0) as u64;
            on_update(&profile);
        });
        profile.cpu_lane_count = cpu.lane_count;
        profile.cpu_hashes_per_sec = hashes_per_sec(cpu.steps_per_sec).max(1.0) as u64;

        if let Some(mut backend) = self.checkout_gpu() {
            match benchmark::calibrate_gpu(&mut backend, |lane_count, steps_per_sec| {
                profile.gpu_lane_count = lane_count;
                profile.gpu_hashes_per_sec = hashes_per_sec(steps_per_sec).max(1.0) as u64;
                on_update(&profile);
            }) {
                Ok(Some(gpu)) => {
                    profile.gpu_lane_count = gpu.lane_count;
                    profile.gpu_hashes_per_sec = hashes_per_sec(gpu.steps_per_sec).max(1.0) as u64;
                    self.return_gpu(backend);
                }
                Ok(None) | Err(_) => {
                    profile.gpu_lane_count = 0;
                    profile.gpu_hashes_per_sec = 0;
                    self.disable_gpu();
                }
            }
        }

        self.shared.lock().unwrap().profile = Some(profile);
        on_update(&profile);
        profile
    }

    /// Encrypt with fresh random seeds and salts.
    pub fn encrypt(
        &self,
        req: &EncryptRequest<'_>,
        on_progress: impl Fn(f64) + Sync,
    ) -> Result<SealedPayload> {
        let _run = self.begin_run(Status::Running)?;
        self.encrypt_inner(req, None, &on_progress)
    }

    /// Deterministic entry: caller supplies the seed bytes (lane order, GPU
    /// lanes first) and both backend salts. Same chain semantics as
    /// [`Engine::encrypt`].
    pub fn encrypt_seeded(
        &self,
        req: &EncryptRequest<'_>,
        seeds: &[u8],
        gpu_salt: [u8; SALT_LEN],
        cpu_salt: [u8; SALT_LEN],
        on_progress: impl Fn(f64) + Sync,
    ) -> Result<SealedPayload> {
        let _run = self.begin_run(Status::Running)?;
        self.encrypt_inner(req, Some((seeds, gpu_salt, cpu_salt)), &on_progress)
    }

    fn encrypt_inner(
        &self,
        req: &EncryptRequest<'_>,
        seeded: Option<(&[u8], [u8; SALT_LEN], [u8; SALT_LEN])>,
        on_progress: &(dyn Fn(f64) + Sync),
    ) -> Result<SealedPayload> {
        if req.cost < 1.0 {
            return Err(Error::Validation("cost must be at least 1".into()));
        }
        if !(1..=HASH_LEN).contains(&req.seed_len) {
            return Err(Error::Validation("seed length must be in 1..=32".into()));
        }

        let profile = match self.profile() {
            Some(profile) => profile,
            None => {
                info!("no benchmark profile, calibrating first");
                self.run_calibration(|_| {})
            }
        };

        let gpu_wanted = if profile.has_gpu() && self.gpu_available() {
            req.gpu_lanes
        } else {
            0
        };
        let (cpu_lanes, mut gpu_lanes) = clamp_lanes(req.cpu_lanes, gpu_wanted)?;

        let mut lease = GpuLease {
            engine: self,
            backend: None,
        };
        if gpu_lanes > 0 {
            match self.checkout_gpu() {
                Some(backend) => lease.backend = Some(backend),
                None => {
                    debug!("gpu dropped out before the run, falling back to cpu");
                    gpu_lanes = 0;
                    if cpu_lanes == 0 {
                        return Err(Error::Validation(
                            "at least one cpu or gpu lane is required".into(),
                        ));
                    }
                }
            }
        }

        let split = compute_split(req.cost, cpu_lanes, gpu_lanes, &profile);
        let lane_total = (cpu_lanes + gpu_lanes) as usize;

        let (seeds, gpu_salt, cpu_salt) = match seeded {
            Some((seeds, gpu_salt, cpu_salt)) => {
                if seeds.len() != lane_total * req.seed_len {
                    return Err(Error::Validation(
                        "seed bytes do not match lane count x seed length".into(),
                    ));
                }
                (seeds.to_vec(), gpu_salt, cpu_salt)
            }
            None => {
                let mut seeds = vec![0u8; lane_total * req.seed_len];
                let mut gpu_salt = [0u8; SALT_LEN];
                let mut cpu_salt = [0u8; SALT_LEN];
                getrandom::getrandom(&mut seeds)
                    .and_then(|_| getrandom::getrandom(&mut gpu_salt))
                    .and_then(|_| getrandom::getrandom(&mut cpu_salt))
                    .map_err(|e| Error::Validation(format!("system rng failed: {e}")))?;
                (seeds, gpu_salt, cpu_salt)
            }
        };

        info!(
            cost = req.cost,
            cpu_lanes,
            gpu_lanes,
            steps_per_slice = split.steps_per_slice,
            "starting encryption run"
        );

        let gpu_task: Option<GpuTask<'_>> = lease.backend.take().map(|mut backend| {
            let gpu_seeds = &seeds[..gpu_lanes as usize * req.seed_len];
            let seed_len = req.seed_len;
            let steps = split.gpu_steps();
            let steps_per_batch = gpu_batch_steps(&profile);
            Box::new(
                move |gate: &RunGate, report: &(dyn Fn(u64) + Sync)| {
                    backend.set_lane_count(gpu_lanes);
                    backend.set_steps_per_batch(steps_per_batch);
                    let outcome =
                        backend.start(gpu_seeds, seed_len, &gpu_salt, steps, gate, report);
                    if matches!(outcome, GpuOutcome::Crashed) {
                        // the run is lost either way; take the cpu lanes down
                        gate.stop();
                    }
                    (Some(backend), outcome)
                },
            ) as GpuTask<'_>
        });

        self.run_and_seal(
            req.plaintext,
            req.cost,
            req.seed_len,
            split,
            &seeds,
            gpu_salt,
            cpu_salt,
            gpu_task,
            on_progress,
        )
    }

    /// Run both backends to completion, fold the lane outputs and seal.
    /// Split out from [`Engine::encrypt_inner`] so the GPU task is a seam.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn run_and_seal(
        &self,
        plaintext: &[u8],
        cost: f64,
        seed_len: usize,
        split: WorkSplit,
        seeds: &[u8],
        gpu_salt: [u8; SALT_LEN],
        cpu_salt: [u8; SALT_LEN],
        gpu_task: Option<GpuTask<'_>>,
        on_progress: &(dyn Fn(f64) + Sync),
    ) -> Result<SealedPayload> {
        let total_steps = split.total_steps() as f64;
        let completed = AtomicU64::new(0);
        let report = |steps: u64| {
            let done = completed.fetch_add(steps, Ordering::Relaxed) + steps;
            on_progress(done as f64 / total_steps);
        };

        let mut gpu_result: Option<(Option<GpuBackend>, GpuOutcome)> = None;
        let mut cpu_result: Option<Option<Vec<u8>>> = None;

        thread::scope(|scope| {
            let gate = &self.gate;
            let report_ref: &(dyn Fn(u64) + Sync) = &report;
            let gpu_handle = gpu_task.map(|task| scope.spawn(move || task(gate, report_ref)));

            if split.cpu_lanes > 0 {
                let job = CpuJob {
                    lane_count: split.cpu_lanes,
                    seeds: &seeds[split.gpu_lanes as usize * seed_len..],
                    seed_len,
                    salt: cpu_salt,
                    steps_per_lane: split.cpu_steps(),
                };
                cpu_result = Some(cpu::run_lanes(&job, gate, report_ref));
            }

            if let Some(handle) = gpu_handle {
                // a panicked gpu thread counts as a crash, not a poison
                gpu_result = Some(handle.join().unwrap_or((None, GpuOutcome::Crashed)));
            }
        });

        let mut lane_states = Vec::new();
        if let Some((backend, outcome)) = gpu_result {
            match outcome {
                GpuOutcome::Complete(states) => {
                    lane_states = states;
                    if let Some(backend) = backend {
                        self.return_gpu(backend);
                    }
                }
                GpuOutcome::Stopped => {
                    if let Some(backend) = backend {
                        self.return_gpu(backend);
                    }
                }
                GpuOutcome::Crashed => {
                    warn!("gpu crashed mid-run, disabled for this session");
                    self.disable_gpu();
                    return Err(Error::GpuCrashed);
                }
            }
        }
        if self.gate.is_stopped() {
            return Err(Error::Aborted);
        }
        match cpu_result {
            Some(Some(states)) => lane_states.extend_from_slice(&states),
            Some(None) => return Err(Error::Aborted),
            None => {}
        }

        let lane_total = (split.gpu_lanes + split.cpu_lanes) as usize;
        debug_assert_eq!(lane_states.len(), lane_total * HASH_LEN);

        // Fold lanes in replay order; each stored seed is masked with the
        // accumulator as it stood before that lane was absorbed.
        let mut acc = KeyAccumulator::new();
        let mut stored_seeds = seeds.to_vec();
        for lane in 0..lane_total {
            let mut state = [0u8; HASH_LEN];
            state.copy_from_slice(&lane_states[lane * HASH_LEN..][..HASH_LEN]);
            acc.mask(&mut stored_seeds[lane * seed_len..(lane + 1) * seed_len]);
            acc.absorb(&state);
        }

        let cipher = seal::seal(acc.key(), plaintext)?;

        let mut lanes = Vec::new();
        if split.gpu_lanes > 0 {
            lanes.push(LaneRecord {
                name: GPU_LANE_NAME.into(),
                step_count: split.gpu_steps(),
                seed_count: split.gpu_lanes,
                seed_len: seed_len as u32,
                seeds: stored_seeds[..split.gpu_lanes as usize * seed_len].to_vec(),
                salt: gpu_salt.to_vec(),
            });
        }
        if split.cpu_lanes > 0 {
            lanes.push(LaneRecord {
                name: CPU_LANE_NAME.into(),
                step_count: split.cpu_steps(),
                seed_count: split.cpu_lanes,
                seed_len: seed_len as u32,
                seeds: stored_seeds[split.gpu_lanes as usize * seed_len..].to_vec(),
                salt: cpu_salt.to_vec(),
            });
        }

        let payload = SealedPayload::new(cost, cipher, lanes)?;
        info!(total_steps = split.total_steps(), "encryption run sealed");
        Ok(payload)
    }

    /// Replay every lane in order and open the ciphertext. The progress
    /// callback returns `false` to stop cooperatively.
    pub fn decrypt(
        &self,
        payload: &SealedPayload,
        on_progress: impl Fn(f64) -> bool + Sync,
    ) -> Result<Vec<u8>> {
        let _run = self.begin_run(Status::Running)?;
        payload.validate()?;

        let total_steps = payload.total_steps() as f64;
        let completed = AtomicU64::new(0);
        let report = |steps: u64| -> bool {
            let done = completed.fetch_add(steps, Ordering::Relaxed) + steps;
            on_progress(done as f64 / total_steps)
        };

        info!(total_steps, "starting sequential replay");

        let mut acc = KeyAccumulator::new();
        for record in &payload.lanes {
            let mut salt = [0u8; SALT_LEN];
            salt.copy_from_slice(&record.salt);

            for lane in 0..record.seed_count {
                let lane_salt = LaneSalt::new(&salt, lane);
                let mut seed = record.seed(lane).to_vec();
                // recover the true seed from the stored masked one
                acc.mask(&mut seed);

                let mut state = advance(&seed, &lane_salt, 0);
                let mut done: u64 = 1;
                let mut unreported: u64 = 1;
                while done < record.step_count {
                    let steps = (record.step_count - done).min(CHUNK_STEPS);
                    state = chain_from(state, &lane_salt, done, steps);
                    done += steps;
                    unreported += steps;

                    if !self.gate.checkpoint() {
                        return Err(Error::Aborted);
                    }
                    if !report(unreported) {
                        return Err(Error::Aborted);
                    }
                    unreported = 0;
                }
                if unreported > 0 && !report(unreported) {
                    return Err(Error::Aborted);
                }
                acc.absorb(&state);
            }
        }

        seal::unseal(acc.key(), &payload.cipher)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

fn gpu_batch_steps(profile: &BenchmarkProfile) -> u32 {
    ((profile.gpu_steps_per_sec() / 1000.0 * PASS_TARGET_MS) as u32).max(1)
}
