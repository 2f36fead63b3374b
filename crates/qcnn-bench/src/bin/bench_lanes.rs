// SPDX-License-Identifier: AGPL-3.0-only

//! Channel-lane sweep.
//!
//! Refolds every weighted layer of the reference network with a range of
//! OutP factors and lane thread caps, times a fixed batch and checks that
//! each configuration produces bit-identical output words.
//!
//! Usage:
//!   cargo run --release --bin bench_lanes
//!   cargo run --release --bin bench_lanes -- --batch 64

use anyhow::{bail, Result};
use qcnn_core::{BitWord, TRANSPORT_BITS};
use qcnn_engine::transport::pack_pixel_batch;
use qcnn_engine::{Engine, EngineConfig};
use qcnn_models::{reference_model, Model};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

const DEFAULT_BATCH: usize = 32;
const OUT_P: [usize; 4] = [1, 2, 8, 64];
const THREAD_CAPS: [usize; 4] = [1, 2, 4, 8];

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let batch = parse_arg(&args, "--batch", DEFAULT_BATCH).max(1);

    println!("Channel-lane sweep");
    println!("==================");
    println!("Batch          : {} images", batch);
    println!();
    println!(
        "  {:>6}  {:>8}  {:>12}  {:>10}  {:>9}",
        "OutP≤", "threads", "µs/image", "images/s", "identical"
    );

    let base = reference_model(0)?;
    let input = random_input(&base, batch)?;
    let mut reference: Option<Vec<BitWord>> = None;
    let mut mismatches = 0usize;

    for &out_p in &OUT_P {
        let model = refold(&base, out_p)?;
        for &cap in &THREAD_CAPS {
            let engine = Engine::new(&model, EngineConfig::default().with_lane_threads(cap))?;
            let mut output = vec![BitWord::zero(TRANSPORT_BITS); batch];

            let t0 = Instant::now();
            engine.run(&input, &mut output, batch)?;
            #[allow(clippy::cast_precision_loss)]
            let us = t0.elapsed().as_micros() as f64 / batch as f64;

            let identical = reference.as_ref().map_or(true, |words| *words == output);
            if reference.is_none() {
                reference = Some(output);
            }
            mismatches += usize::from(!identical);
            println!(
                "  {:>6}  {:>8}  {:>12.0}  {:>10.0}  {:>9}",
                out_p,
                cap,
                us,
                1e6 / us,
                if identical { "yes" } else { "NO" }
            );
        }
    }

    println!();
    if mismatches > 0 {
        bail!("{mismatches} configurations diverged from the baseline");
    }
    println!("✅ All lane configurations bit-identical");
    Ok(())
}

/// Reference network with OutP set to the largest divisor of Cout ≤ `cap`.
fn refold(model: &Model, cap: usize) -> Result<Model> {
    let layers = model
        .layers()
        .iter()
        .cloned()
        .map(|mut layer| {
            if layer.kind.has_weights() {
                let cout = layer.config.cout;
                layer.config.out_p = (1..=cap.min(cout)).rev().find(|d| cout % d == 0).unwrap_or(1);
            }
            layer
        })
        .collect();
    Ok(Model::new(model.fixed_point(), model.ingest(), layers)?)
}

fn random_input(model: &Model, images: usize) -> Result<Vec<BitWord>> {
    let layout = model.ingest();
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(7);
    let pixels: Vec<Vec<u8>> = (0..images)
        .map(|_| (0..layout.image_bits() / 8).map(|_| rng.random()).collect())
        .collect();
    let refs: Vec<&[u8]> = pixels.iter().map(Vec::as_slice).collect();
    Ok(pack_pixel_batch(&refs, layout)?)
}

fn parse_arg(args: &[String], flag: &str, default: usize) -> usize {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}
