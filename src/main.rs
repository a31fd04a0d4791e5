//! Timelock CLI
//!
//! Seal a secret behind a wall-clock delay, or grind through the delay to
//! open one.
//!
//! # Commands
//!
//! - `encrypt` - Seal plaintext into a time-lock payload
//! - `decrypt` - Replay a payload's chains and recover the plaintext
//! - `benchmark` - Measure this machine and cache the profile
//! - `info` - Show the cached profile and GPU availability

use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use timelock::{
    BenchmarkProfile, EncryptRequest, Engine, SealedPayload, HASHES_PER_COST, HASHES_PER_STEP,
};

#[derive(Parser)]
#[command(name = "timelock")]
#[command(version)]
#[command(about = "Time-lock puzzle encryption: parallel to seal, sequential to open")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom benchmark cache path
    #[arg(long, global = true)]
    cache: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Seal plaintext into a time-lock payload
    Encrypt {
        /// Plaintext file (default: stdin)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Payload output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Delay cost in millions of hash evaluations
        #[arg(short, long, default_value = "100")]
        cost: f64,

        /// Stored seed bytes per lane (1-32)
        #[arg(long, default_value = "4")]
        seed_len: usize,

        /// CPU lane count (default: from the benchmark profile)
        #[arg(long)]
        cpu_lanes: Option<u32>,

        /// GPU lane count (default: from the benchmark profile)
        #[arg(long)]
        gpu_lanes: Option<u32>,
    },

    /// Replay a payload's chains and recover the plaintext
    Decrypt {
        /// Payload file (default: stdin)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Plaintext output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Measure this machine and cache the profile
    Benchmark,

    /// Show the cached profile and GPU availability
    Info,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let cache = cli.cache.unwrap_or_else(default_cache_path);

    let result = match cli.command {
        Commands::Encrypt {
            input,
            output,
            cost,
            seed_len,
            cpu_lanes,
            gpu_lanes,
        } => cmd_encrypt(&cache, input, output, cost, seed_len, cpu_lanes, gpu_lanes),
        Commands::Decrypt { input, output } => cmd_decrypt(&cache, input, output),
        Commands::Benchmark => cmd_benchmark(&cache).map(|_| ()),
        Commands::Info => cmd_info(&cache),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn default_cache_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".timelock")
        .join("benchmark.json")
}

/// Single-line progress meter, redrawn in place on stderr.
struct ProgressLine {
    started: Instant,
    total_hashes: f64,
    last_print_ms: AtomicU64,
}

impl ProgressLine {
    fn new(total_hashes: f64) -> Self {
        Self {
            started: Instant::now(),
            total_hashes,
            last_print_ms: AtomicU64::new(0),
        }
    }

    fn update(&self, fraction: f64) {
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        let last = self.last_print_ms.load(Ordering::Relaxed);
        if fraction < 1.0 && elapsed_ms < last + 200 {
            return;
        }
        // Lanes report concurrently; one writer per redraw is enough.
        if self
            .last_print_ms
            .compare_exchange(last, elapsed_ms, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let secs = (elapsed_ms as f64 / 1000.0).max(0.001);
        let mhash = fraction * self.total_hashes / secs / 1e6;
        eprint!(
            "\r{:5.1}% | {:.2} MHash/s | {:.0}s elapsed",
            fraction * 100.0,
            mhash,
            secs
        );
        io::stderr().flush().ok();
    }

    fn finish(&self) {
        eprintln!();
    }
}

fn read_input(path: Option<PathBuf>) -> anyhow::Result<Vec<u8>> {
    match path {
        Some(path) => Ok(fs::read(&path)?),
        None => {
            let mut buf = Vec::new();
            io::stdin().read_to_end(&mut buf)?;
            Ok(buf)
        }
    }
}

fn write_output(path: Option<PathBuf>, bytes: &[u8]) -> anyhow::Result<()> {
    match path {
        Some(path) => fs::write(&path, bytes)?,
        None => io::stdout().write_all(bytes)?,
    }
    Ok(())
}

fn load_profile(cache: &PathBuf) -> Option<BenchmarkProfile> {
    let text = fs::read_to_string(cache).ok()?;
    let profile: BenchmarkProfile = match serde_json::from_str(&text) {
        Ok(profile) => profile,
        Err(e) => {
            eprintln!("Ignoring unreadable benchmark cache: {}", e);
            return None;
        }
    };
    if let Err(e) = profile.validate() {
        eprintln!("Ignoring invalid benchmark cache: {}", e);
        return None;
    }
    Some(profile)
}

/// Write the whole profile or nothing: write to a temp file, then rename
/// over the old cache.
fn save_profile(cache: &PathBuf, profile: &BenchmarkProfile) -> anyhow::Result<()> {
    if let Some(dir) = cache.parent() {
        fs::create_dir_all(dir)?;
    }
    let tmp = cache.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_string_pretty(profile)?)?;
    fs::rename(&tmp, cache)?;
    Ok(())
}

fn ensure_profile(engine: &Engine, cache: &PathBuf) -> anyhow::Result<BenchmarkProfile> {
    if let Some(profile) = load_profile(cache) {
        engine.set_profile(profile)?;
        return Ok(profile);
    }
    eprintln!("No benchmark profile cached; measuring this machine first.");
    run_benchmark(engine, cache)
}

fn run_benchmark(engine: &Engine, cache: &PathBuf) -> anyhow::Result<BenchmarkProfile> {
    let profile = engine.benchmark(|p| {
        eprint!(
            "\rCPU: {} lanes @ {:.2} MHash/s | GPU: {} lanes @ {:.2} MHash/s",
            p.cpu_lane_count,
            p.cpu_hashes_per_sec as f64 / 1e6,
            p.gpu_lane_count,
            p.gpu_hashes_per_sec as f64 / 1e6,
        );
        io::stderr().flush().ok();
    })?;
    eprintln!();
    save_profile(cache, &profile)?;
    eprintln!("Profile saved to {}", cache.display());
    Ok(profile)
}

fn cmd_encrypt(
    cache: &PathBuf,
    input: Option<PathBuf>,
    output: Option<PathBuf>,
    cost: f64,
    seed_len: usize,
    cpu_lanes: Option<u32>,
    gpu_lanes: Option<u32>,
) -> anyhow::Result<()> {
    let plaintext = read_input(input)?;
    let engine = Engine::new();
    let profile = ensure_profile(&engine, cache)?;

    let req = EncryptRequest {
        plaintext: &plaintext,
        cost,
        seed_len,
        cpu_lanes: cpu_lanes.unwrap_or(profile.cpu_lane_count),
        gpu_lanes: gpu_lanes.unwrap_or(profile.gpu_lane_count),
    };

    eprintln!(
        "Sealing {} bytes at cost {} ({} Mhash of delay)...",
        plaintext.len(),
        cost,
        cost * HASHES_PER_COST as f64 / 1e6
    );

    let progress = ProgressLine::new(cost * HASHES_PER_COST as f64);
    let started = Instant::now();
    let payload = engine.encrypt(&req, |fraction| progress.update(fraction))?;
    progress.finish();

    eprintln!(
        "Sealed in {:.1}s across {} lane record(s), {} total steps.",
        started.elapsed().as_secs_f64(),
        payload.lanes.len(),
        payload.total_steps()
    );

    write_output(output, payload.to_json()?.as_bytes())?;
    Ok(())
}

fn cmd_decrypt(cache: &PathBuf, input: Option<PathBuf>, output: Option<PathBuf>) -> anyhow::Result<()> {
    let text = String::from_utf8(read_input(input)?)?;
    let payload = SealedPayload::from_json(&text)?;

    // Decryption needs no profile; load one only so a cached CPU rate can
    // hint at the wait, if present.
    if let Some(profile) = load_profile(cache) {
        let eta = payload.total_steps() as f64 * HASHES_PER_STEP as f64
            / profile.cpu_hashes_per_sec as f64;
        eprintln!("Estimated replay time on this machine: ~{:.0}s", eta);
    }

    let engine = Engine::new();
    let progress = ProgressLine::new(payload.total_steps() as f64 * HASHES_PER_STEP as f64);
    let started = Instant::now();
    let plaintext = engine.decrypt(&payload, |fraction| {
        progress.update(fraction);
        true
    })?;
    progress.finish();

    eprintln!("Opened in {:.1}s.", started.elapsed().as_secs_f64());
    write_output(output, &plaintext)?;
    Ok(())
}

fn cmd_benchmark(cache: &PathBuf) -> anyhow::Result<BenchmarkProfile> {
    println!("Measuring CPU and GPU chain throughput...");
    let engine = Engine::new();
    let profile = run_benchmark(&engine, cache)?;

    println!("\nResults:");
    println!(
        "  CPU: {} lanes @ {:.2} MHash/s per lane",
        profile.cpu_lane_count,
        profile.cpu_hashes_per_sec as f64 / 1e6
    );
    if profile.has_gpu() {
        println!(
            "  GPU: {} lanes @ {:.2} MHash/s per lane",
            profile.gpu_lane_count,
            profile.gpu_hashes_per_sec as f64 / 1e6
        );
    } else {
        println!("  GPU: not usable");
    }
    Ok(profile)
}

fn cmd_info(cache: &PathBuf) -> anyhow::Result<()> {
    println!("Benchmark cache: {}", cache.display());
    match load_profile(cache) {
        Some(profile) => {
            println!(
                "  CPU: {} lanes @ {:.2} MHash/s per lane",
                profile.cpu_lane_count,
                profile.cpu_hashes_per_sec as f64 / 1e6
            );
            if profile.has_gpu() {
                println!(
                    "  GPU: {} lanes @ {:.2} MHash/s per lane",
                    profile.gpu_lane_count,
                    profile.gpu_hashes_per_sec as f64 / 1e6
                );
            } else {
                println!("  GPU: not usable");
            }
        }
        None => println!("  (no profile cached; run 'timelock benchmark')"),
    }

    match timelock::GpuBackend::init() {
        Ok(gpu) => println!("GPU adapter: {}", gpu.adapter_name()),
        Err(e) => println!("GPU adapter: unavailable ({})", e),
    }
    Ok(())
}
