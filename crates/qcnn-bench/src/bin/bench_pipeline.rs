// SPDX-License-Identifier: AGPL-3.0-only

//! Pipeline throughput versus batch size.
//!
//! A single image pays the full fill latency of every stage; larger
//! batches keep all stages busy at once, so images/s should climb until
//! the slowest stage saturates.
//!
//! Usage:
//!   cargo run --release --bin bench_pipeline
//!   cargo run --release --bin bench_pipeline -- --iterations 10 --depth 16

use anyhow::Result;
use qcnn_core::{BitWord, TRANSPORT_BITS};
use qcnn_engine::transport::pack_pixel_batch;
use qcnn_engine::{Engine, EngineConfig};
use qcnn_models::reference_model;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

const DEFAULT_ITERATIONS: usize = 5;
const DEFAULT_DEPTH: usize = 64;
const BATCHES: [usize; 7] = [1, 2, 4, 8, 16, 32, 64];

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let iterations = parse_arg(&args, "--iterations", DEFAULT_ITERATIONS).max(1);
    let depth = parse_arg(&args, "--depth", DEFAULT_DEPTH);

    let model = reference_model(0)?;
    let config = EngineConfig::default().with_channel_depth(depth);
    let engine = Engine::new(&model, config)?;

    println!("Pipeline throughput benchmark");
    println!("=============================");
    println!("Model          : reference MNIST 1W5A ({} layers)", model.layer_count());
    println!("Channel depth  : {}", config.channel_depth);
    println!("Lane threads   : ≤ {}", config.lane_thread_cap);
    println!("Iterations     : {}", iterations);
    println!();

    let max_batch = BATCHES[BATCHES.len() - 1];
    let input = random_input(&engine, max_batch)?;
    let mut output = vec![BitWord::zero(TRANSPORT_BITS); max_batch];

    // Warmup
    engine.run(&input, &mut output, 4)?;

    println!(
        "  {:>6}  {:>12}  {:>10}  {:>12}  {:>10}",
        "batch", "µs/image", "images/s", "vs batch=1", "sequential"
    );

    let mut single = None;
    for &batch in &BATCHES {
        let threaded = time_per_image(iterations, batch, || {
            engine.run(&input, &mut output, batch)
        })?;
        let sequential = time_per_image(iterations, batch, || {
            engine.run_sequential(&input, &mut output, batch)
        })?;
        let base = *single.get_or_insert(threaded);
        println!(
            "  {:>6}  {:>12.0}  {:>10.0}  {:>11.2}×  {:>8.0}µs",
            batch,
            threaded,
            1e6 / threaded,
            base / threaded,
            sequential
        );
    }

    Ok(())
}

fn random_input(engine: &Engine, images: usize) -> Result<Vec<BitWord>> {
    let layout = engine.ingest_layout();
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(42);
    let pixels: Vec<Vec<u8>> = (0..images)
        .map(|_| (0..layout.image_bits() / 8).map(|_| rng.random()).collect())
        .collect();
    let refs: Vec<&[u8]> = pixels.iter().map(Vec::as_slice).collect();
    Ok(pack_pixel_batch(&refs, layout)?)
}

#[allow(clippy::cast_precision_loss)]
fn time_per_image(
    iterations: usize,
    batch: usize,
    mut run: impl FnMut() -> qcnn_engine::Result<()>,
) -> Result<f64> {
    let t0 = Instant::now();
    for _ in 0..iterations {
        run()?;
    }
    let elapsed_us = t0.elapsed().as_micros() as f64;
    Ok(elapsed_us / (iterations * batch) as f64)
}

fn parse_arg(args: &[String], flag: &str, default: usize) -> usize {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}
