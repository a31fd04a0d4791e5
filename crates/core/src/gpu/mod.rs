//! GPU backend: advances every lane in lock-step compute passes.
//!
//! The kernel is dispatched over a 2-D grid of `GRID_ROWS` rows by
//! `lane_count / GRID_ROWS` columns with an 8x4 workgroup; lane counts are
//! powers of two of at least 32, so the grid always divides exactly. Lane
//! state lives in a read-write storage buffer; per-pass parameters go through
//! a small uniform buffer rewritten before each pass.
//!
//! Device loss is never a panic. An uncaptured-error hook latches a crash
//! flag, and a failed readback or a degenerate (all-zero) lane state in a
//! readback is treated the same way: the run ends with
//! [`GpuOutcome::Crashed`].

mod pack;

pub use pack::{pack_states, unpack_states, WORDS_PER_LANE};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::control::RunGate;
use crate::error::{Error, Result};
use crate::params::{HASH_LEN, MAX_GPU_LANES, MIN_GPU_LANES, SALT_LEN};
use crate::primitive::{advance, LaneSalt};

/// Rows of the dispatch grid; must match the kernel's workgroup height.
const GRID_ROWS: u32 = 4;
/// Workgroup width; columns per dispatch are `grid_cols / WORKGROUP_COLS`.
const WORKGROUP_COLS: u32 = 8;
/// Passes issued between host readbacks. A readback is where progress is
/// reported, the gate checkpoint runs, and crashes are detected.
const PASSES_PER_SYNC: u32 = 10;
/// Samples taken per benchmark measurement; the fastest is kept.
const BENCH_SAMPLES: u32 = 3;

/// Must match the uniform block in shader.wgsl.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct PassParams {
    steps: u32,
    step_base: u32,
    grid_cols: u32,
    salt0: u32,
    salt1: u32,
    salt2: u32,
    pad0: u32,
    pad1: u32,
}

/// How a GPU run ended.
pub enum GpuOutcome {
    /// Concatenated 32-byte final states in lane order.
    Complete(Vec<u8>),
    /// The gate was stopped at a checkpoint.
    Stopped,
    /// The device was lost or produced degenerate output.
    Crashed,
}

struct LaneBuffers {
    state: wgpu::Buffer,
    readback: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
    size: u64,
}

pub struct GpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    params_buffer: wgpu::Buffer,
    lanes: Option<LaneBuffers>,
    lane_count: u32,
    steps_per_batch: u32,
    adapter_name: String,
    crashed: Arc<AtomicBool>,
}

impl GpuBackend {
    /// Request a high-performance adapter and build the chain pipeline.
    /// Failure is recoverable: the engine falls back to CPU-only.
    pub fn init() -> Result<Self> {
        pollster::block_on(Self::init_async())
    }

    async fn init_async() -> Result<Self> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| Error::GpuUnavailable("no suitable adapter".into()))?;
        let adapter_name = adapter.get_info().name;
        debug!(adapter = %adapter_name, "gpu adapter selected");

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("timelock device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::downlevel_defaults(),
                },
                None,
            )
            .await
            .map_err(|e| Error::GpuUnavailable(e.to_string()))?;

        let crashed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&crashed);
        device.on_uncaptured_error(Box::new(move |err| {
            warn!(%err, "uncaptured gpu error");
            flag.store(true, Ordering::SeqCst);
        }));

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("chain kernel"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shader.wgsl").into()),
        });

        let bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("chain bind group layout"),
                entries: &[
                    wgpu::BindGroupLayoutEntry {
                        binding: 0,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Storage { read_only: false },
                            has_dynamic_offset: false,
                            min_binding_size: None,
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 1,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Uniform,
                            has_dynamic_offset: false,
                            min_binding_size: None,
                        },
                        count: None,
                    },
                ],
            });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("chain pipeline layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("chain pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: "main",
        });

        let params_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("pass params"),
            size: std::mem::size_of::<PassParams>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Ok(Self {
            device,
            queue,
            pipeline,
            bind_group_layout,
            params_buffer,
            lanes: None,
            lane_count: 0,
            steps_per_batch: 1,
            adapter_name,
            crashed,
        })
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    /// Reallocate the lane buffers. Idempotent for an unchanged count.
    pub fn set_lane_count(&mut self, lane_count: u32) {
        debug_assert!(lane_count.is_power_of_two());
        debug_assert!((MIN_GPU_LANES..=MAX_GPU_LANES).contains(&lane_count));
        if self.lane_count == lane_count {
            return;
        }

        let size = lane_count as u64 * HASH_LEN as u64;
        let state = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("lane states"),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("lane states readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("chain bind group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: state.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: self.params_buffer.as_entire_binding(),
                },
            ],
        });

        self.lane_count = lane_count;
        self.lanes = Some(LaneBuffers {
            state,
            readback,
            bind_group,
            size,
        });
    }

    /// Per-lane steps advanced by one compute pass.
    pub fn set_steps_per_batch(&mut self, steps: u32) {
        self.steps_per_batch = steps.max(1);
    }

    fn dispatch_pass(&self, bufs: &LaneBuffers, step_base: u32, steps: u32, salt: [u32; 3]) {
        let grid_cols = self.lane_count / GRID_ROWS;
        let params = PassParams {
            steps,
            step_base,
            grid_cols,
            salt0: salt[0],
            salt1: salt[1],
            salt2: salt[2],
            pad0: 0,
            pad1: 0,
        };
        self.queue
            .write_buffer(&self.params_buffer, 0, bytemuck::bytes_of(&params));

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("chain pass"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("chain pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bufs.bind_group, &[]);
            pass.dispatch_workgroups(grid_cols / WORKGROUP_COLS, 1, 1);
        }
        self.queue.submit(Some(encoder.finish()));
    }

    /// Copy the state buffer back to the host. A failed mapping means the
    /// device is gone.
    fn read_states(&self, bufs: &LaneBuffers) -> Option<Vec<u32>> {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("state readback"),
            });
        encoder.copy_buffer_to_buffer(&bufs.state, 0, &bufs.readback, 0, bufs.size);
        self.queue.submit(Some(encoder.finish()));

        let (tx, rx) = mpsc::channel();
        bufs.readback
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |res| {
                let _ = tx.send(res);
            });
        let _ = self.device.poll(wgpu::Maintain::Wait);

        match rx.recv() {
            Ok(Ok(())) => {}
            _ => return None,
        }
        let words = {
            let mapped = bufs.readback.slice(..).get_mapped_range();
            bytemuck::cast_slice::<u8, u32>(&mapped).to_vec()
        };
        bufs.readback.unmap();
        Some(words)
    }

    fn crash_seen(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    /// A lane state that is all zeros after real work is a telltale of a
    /// reset device handing back cleared memory.
    fn degenerate(words: &[u32]) -> bool {
        words
            .chunks_exact(WORDS_PER_LANE)
            .any(|lane| lane.iter().all(|&w| w == 0))
    }

    /// Run every configured lane for `steps_per_lane` steps.
    ///
    /// Step 0 (raw variable-length seed as password) runs on the host; the
    /// kernel only ever sees 32-byte states. `set_lane_count` and
    /// `set_steps_per_batch` must have been called first.
    pub fn start(
        &self,
        seeds: &[u8],
        seed_len: usize,
        salt: &[u8; SALT_LEN],
        steps_per_lane: u64,
        gate: &RunGate,
        on_progress: &(dyn Fn(u64) + Sync),
    ) -> GpuOutcome {
        let lane_count = self.lane_count;
        debug_assert_eq!(seeds.len(), lane_count as usize * seed_len);
        let Some(bufs) = self.lanes.as_ref() else {
            return GpuOutcome::Crashed;
        };

        let mut states = Vec::with_capacity(lane_count as usize * HASH_LEN);
        for lane in 0..lane_count {
            let lane_salt = LaneSalt::new(salt, lane);
            let seed = &seeds[lane as usize * seed_len..][..seed_len];
            states.extend_from_slice(&advance(seed, &lane_salt, 0));
        }
        on_progress(lane_count as u64);
        if steps_per_lane == 1 {
            return GpuOutcome::Complete(states);
        }

        let words = pack_states(&states);
        self.queue
            .write_buffer(&bufs.state, 0, bytemuck::cast_slice(&words));

        let salt_words = LaneSalt::new(salt, 0).salt_words();
        let mut base: u64 = 1;
        let mut unreported: u64 = 0;
        let mut passes_since_sync: u32 = 0;

        loop {
            let steps = (steps_per_lane - base).min(self.steps_per_batch as u64) as u32;
            self.dispatch_pass(bufs, base as u32, steps, salt_words);
            base += steps as u64;
            unreported += steps as u64 * lane_count as u64;
            passes_since_sync += 1;

            if passes_since_sync == PASSES_PER_SYNC || base == steps_per_lane {
                passes_since_sync = 0;
                let Some(words) = self.read_states(bufs) else {
                    return GpuOutcome::Crashed;
                };
                if self.crash_seen() || Self::degenerate(&words) {
                    return GpuOutcome::Crashed;
                }
                on_progress(unreported);
                unreported = 0;
                if !gate.checkpoint() {
                    return GpuOutcome::Stopped;
                }
                if base == steps_per_lane {
                    return GpuOutcome::Complete(unpack_states(&words));
                }
            }
        }
    }

    /// Time one pass of `steps` steps over `lane_count` lanes, including the
    /// readback. Used by calibration; zeroed input states are fine for
    /// timing since the kernel's work does not depend on data values.
    pub fn benchmark(&mut self, lane_count: u32, steps: u32) -> Result<Duration> {
        self.set_lane_count(lane_count);
        self.set_steps_per_batch(steps);
        let bufs = match self.lanes.as_ref() {
            Some(b) => b,
            None => return Err(Error::GpuCrashed),
        };

        let zero = vec![0u8; lane_count as usize * HASH_LEN];
        self.queue.write_buffer(&bufs.state, 0, &zero);

        let mut best = Duration::MAX;
        for _ in 0..BENCH_SAMPLES {
            let started = Instant::now();
            self.dispatch_pass(bufs, 0, steps, [0, 0, 0]);
            let readback = self.read_states(bufs);
            let elapsed = started.elapsed();

            if readback.is_none() || self.crash_seen() {
                return Err(Error::GpuCrashed);
            }
            best = best.min(elapsed);
        }
        Ok(best)
    }
}
