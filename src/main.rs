use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use candle_core::Device;
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use nano_kvsched::{DecoderEngine, EngineConfig, GenerateInput, Result, SyntheticExecutor};

const VOCAB_SIZE: u32 = 32000;

#[derive(Parser, Debug)]
#[command(name = "nano-kvsched")]
#[command(about = "Simulate FIFO scheduling over a paged KV cache")]
struct Args {
    /// Engine config JSON (defaults are used when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of requests to submit
    #[arg(short = 'n', long, default_value = "64")]
    requests: usize,

    /// Maximum prompt length, excluding the shared prefix
    #[arg(long, default_value = "128")]
    prompt_len: usize,

    /// Maximum tokens generated per request
    #[arg(long, default_value = "64")]
    max_new_tokens: usize,

    /// Simulated free device memory in MiB
    #[arg(long, default_value = "1088")]
    device_memory_mb: usize,

    /// Seed for the workload generator
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Let requests reuse cached prompt prefixes
    #[arg(long)]
    reuse_cache: bool,

    /// Leading tokens shared by every prompt
    #[arg(long, default_value = "0")]
    shared_prefix: usize,
}

#[derive(Debug, Default, Serialize)]
struct Summary {
    requests: usize,
    finished: usize,
    stopped: usize,
    generated_tokens: usize,
    reused_tokens: usize,
    ticks: usize,
    peak_batch_size: usize,
    peak_block_used_ratio: f64,
    cached_blocks: usize,
    elapsed_ms: f64,
}

fn workload(args: &Args) -> Vec<GenerateInput> {
    let mut rng = StdRng::seed_from_u64(args.seed);
    let prefix: Vec<u32> = (0..args.shared_prefix)
        .map(|_| rng.gen_range(0..VOCAB_SIZE))
        .collect();

    (0..args.requests)
        .map(|_| {
            let suffix_len = rng.gen_range(1..=args.prompt_len.max(1));
            let mut input_ids = prefix.clone();
            input_ids.extend((0..suffix_len).map(|_| rng.gen_range(0..VOCAB_SIZE)));

            let mut input = GenerateInput::new(input_ids);
            input.generate_config.max_new_tokens = rng.gen_range(1..=args.max_new_tokens.max(1));
            input
        })
        .collect()
}

fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };

    let device_free_bytes = args.device_memory_mb * 1024 * 1024;
    let engine = DecoderEngine::from_config(
        &config,
        device_free_bytes,
        &Device::Cpu,
        Arc::new(SyntheticExecutor::new(VOCAB_SIZE)),
    )?;
    let cache_config = engine.cache_manager().cache_config().clone();
    println!("nano-kvsched v{}", env!("CARGO_PKG_VERSION"));
    println!(
        "KV cache: {} blocks x {} tokens ({} bytes per block)",
        cache_config.block_nums,
        cache_config.seq_size_per_block,
        cache_config.block_size_bytes()
    );

    let mut streams = Vec::with_capacity(args.requests);
    for input in workload(&args) {
        let stream = engine.submit(input)?;
        stream.set_reuse_cache(args.reuse_cache);
        streams.push(stream);
    }

    let start = Instant::now();
    let mut summary = Summary {
        requests: streams.len(),
        ..Default::default()
    };
    while engine.has_unfinished_streams() {
        let stats = engine.step()?;
        summary.ticks += 1;
        summary.peak_batch_size = summary.peak_batch_size.max(stats.running_batch_size);
        summary.peak_block_used_ratio = summary.peak_block_used_ratio.max(stats.block_used_ratio);
    }
    summary.elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

    for stream in &streams {
        if stream.finished() {
            summary.finished += 1;
        } else if stream.stopped() {
            summary.stopped += 1;
        }
        summary.generated_tokens += stream.output_length();
        summary.reused_tokens += stream.reuse_length();
    }
    summary.cached_blocks = engine.cache_manager().cached_block_nums();

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
