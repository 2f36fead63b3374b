// SPDX-License-Identifier: AGPL-3.0-only

//! `qcnn`: command-line front end for the quantized CNN pipeline.
//!
//! ```text
//! USAGE:
//!   qcnn info [--model <file>]              Layer table and stream shapes
//!   qcnn synth --out <file> [--seed N]      Write a seeded reference model
//!   qcnn run [--model <file>] [--input <file>] [--reps N] [--monitor <stream>]…
//!                                           Stream images through the pipeline
//!   qcnn selftest                           Hand-checked two-layer scenario
//! ```
//!
//! Without `--model` the reference network with seed 0 is used. Without
//! `--input`, `--reps` images of random samples are generated.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use qcnn_core::bits::low_mask;
use qcnn_core::BitWord;
use qcnn_engine::transport::{pack_image_lines, read_words, write_words};
use qcnn_engine::{Engine, EngineConfig, InferenceExecutor, TracingMonitor};
use qcnn_models::synthetic::{SELFTEST_IMAGE, SELFTEST_SCORES};
use qcnn_models::{reference_model, selftest_model, Model};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "qcnn", about = "Quantized CNN streaming inference", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Print the layer table, stream shapes and accumulator headroom.
    Info {
        /// Model blob (defaults to the seeded reference network).
        #[arg(long)]
        model: Option<PathBuf>,
    },
    /// Write the reference network with seeded random parameters.
    Synth {
        /// Output path.
        #[arg(long)]
        out: PathBuf,
        /// RNG seed.
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
    /// Run images through the pipeline and print the predicted classes.
    Run {
        /// Model blob (defaults to the seeded reference network).
        #[arg(long)]
        model: Option<PathBuf>,
        /// File of 64-byte transport words (defaults to random images).
        #[arg(long)]
        input: Option<PathBuf>,
        /// Where to write the output transport words.
        #[arg(long)]
        output: Option<PathBuf>,
        /// Number of images.
        #[arg(long, default_value_t = 1)]
        reps: usize,
        /// Trace every element on these streams (needs RUST_LOG=trace).
        #[arg(long)]
        monitor: Vec<String>,
        /// Run stages one after another instead of concurrently.
        #[arg(long)]
        sequential: bool,
        /// Inter-stage channel depth.
        #[arg(long, default_value_t = 64)]
        depth: usize,
        /// Seed for generated images.
        #[arg(long, default_value_t = 1)]
        seed: u64,
    },
    /// Run a tiny network with hand-computed expected scores.
    Selftest,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Info { model } => cmd_info(model.as_deref())?,
        Cmd::Synth { out, seed } => cmd_synth(&out, seed)?,
        Cmd::Run {
            model,
            input,
            output,
            reps,
            monitor,
            sequential,
            depth,
            seed,
        } => {
            let options = RunOptions {
                reps,
                monitors: monitor,
                sequential,
                depth,
                seed,
            };
            cmd_run(model.as_deref(), input.as_deref(), output.as_deref(), &options)?;
        }
        Cmd::Selftest => cmd_selftest()?,
    }

    Ok(())
}

struct RunOptions {
    reps: usize,
    monitors: Vec<String>,
    sequential: bool,
    depth: usize,
    seed: u64,
}

fn load_model(path: Option<&Path>) -> Result<Model> {
    match path {
        Some(p) => Model::from_file(p).with_context(|| format!("loading {}", p.display())),
        None => Ok(reference_model(0)?),
    }
}

fn cmd_info(path: Option<&Path>) -> Result<()> {
    let model = load_model(path)?;
    let fixed = model.fixed_point();
    let ingest = model.ingest();

    println!(
        "Fixed point  : SCALE_BITS={}  FACTOR_SCALE_BITS={}",
        fixed.scale_bits, fixed.factor_scale_bits
    );
    println!(
        "Ingest       : {} lines × {} bits per image",
        ingest.lines_per_image, ingest.line_bits
    );
    println!("Weights      : {}", model.total_weight_count());
    println!();
    println!(
        "{:<8} {:<14} {:>20} {:>3} {:>3} {:>3} {:>4} {:>5} {:>5} {:>8}",
        "layer", "kind", "output", "I", "W", "A", "M", "InP", "OutP", "headroom"
    );

    for layer in model.layers() {
        let c = &layer.config;
        let headroom = if layer.kind.has_weights() {
            c.accumulator_headroom().to_string()
        } else {
            "-".to_owned()
        };
        println!(
            "{:<8} {:<14} {:>20} {:>3} {:>3} {:>3} {:>4} {:>5} {:>5} {:>8}",
            layer.name,
            layer.kind.to_string(),
            layer.output_shape().to_string(),
            c.ibit,
            c.wbit,
            c.abit,
            c.mbit,
            c.in_p,
            c.out_p,
            headroom
        );
    }

    let engine = Engine::new(&model, EngineConfig::minimal())?;
    println!();
    println!("Streams      : {}", engine.stream_names().join(" → "));
    Ok(())
}

fn cmd_synth(out: &Path, seed: u64) -> Result<()> {
    let model = reference_model(seed)?;
    model.save(out)?;
    tracing::info!("✅ Reference model saved to {}", out.display());
    println!(
        "Wrote {} ({} layers, {} weights, seed {})",
        out.display(),
        model.layer_count(),
        model.total_weight_count(),
        seed
    );
    Ok(())
}

fn cmd_run(
    model_path: Option<&Path>,
    input_path: Option<&Path>,
    output_path: Option<&Path>,
    options: &RunOptions,
) -> Result<()> {
    let model = load_model(model_path)?;
    let config = EngineConfig::default().with_channel_depth(options.depth);
    let mut engine = Engine::new(&model, config)?;
    for stream in &options.monitors {
        engine.attach_monitor(stream, Arc::new(TracingMonitor))?;
    }

    let input = match input_path {
        Some(p) => read_words(p).with_context(|| format!("reading {}", p.display()))?,
        None => random_images(&model, options.reps, options.seed)?,
    };
    let reps = options.reps;
    if input.len() < reps * engine.input_words_per_image() {
        bail!(
            "input holds {} words, {} images need {}",
            input.len(),
            reps,
            reps * engine.input_words_per_image()
        );
    }

    let executor = InferenceExecutor::new(engine).sequential(options.sequential);
    let result = executor.infer(&input, reps)?;

    let scale = 2f64.powf(f64::from(executor.engine().fixed_point().scale_bits));
    for (i, (scores, class)) in result.scores.iter().zip(&result.predictions).enumerate() {
        #[allow(clippy::cast_precision_loss)]
        let best = scores[*class] as f64 / scale;
        println!("[{i:>4}] class {class}  score {best:.3}");
    }
    println!();
    println!(
        "{} images in {:.2?}  ({:.0} img/s, {:.1} µs/img)",
        result.images,
        result.total_duration,
        result.throughput_ips(),
        result.latency_us()
    );

    if let Some(p) = output_path {
        write_words(p, &result.output)?;
        println!("Output words written to {}", p.display());
    }
    Ok(())
}

/// `count` images of uniformly random samples at the first layer's width.
fn random_images(model: &Model, count: usize, seed: u64) -> Result<Vec<BitWord>> {
    let layout = model.ingest();
    let bits = model.input_shape().bits;
    if bits == 0 || layout.image_bits() % bits != 0 {
        bail!("{}-bit samples do not fill a {}-bit image", bits, layout.image_bits());
    }
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    let mut words = Vec::with_capacity(count * layout.lines_per_image);
    for _ in 0..count {
        let samples: Vec<u64> = (0..layout.image_bits() / bits)
            .map(|_| rng.random_range(0..=low_mask(bits)))
            .collect();
        words.extend(pack_image_lines(&samples, bits, layout)?);
    }
    Ok(words)
}

fn cmd_selftest() -> Result<()> {
    let model = selftest_model()?;
    let input = pack_image_lines(&SELFTEST_IMAGE, 1, model.ingest())?;
    let executor = InferenceExecutor::new(Engine::new(&model, EngineConfig::default())?);
    let result = executor.infer(&input, 1)?;

    println!("scores   {:?}", result.scores[0]);
    println!("expected {SELFTEST_SCORES:?}");
    if result.scores[0] != SELFTEST_SCORES || result.predictions[0] != 0 {
        bail!("selftest failed");
    }
    println!("✅ selftest passed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use qcnn_core::TRANSPORT_BITS;

    #[test]
    fn test_random_images_follow_first_layer_width() {
        // 1-bit samples: only the 16 payload bits of each line may be set
        let model = selftest_model().unwrap();
        let words = random_images(&model, 4, 3).unwrap();
        assert_eq!(words.len(), 4);
        assert!(words.iter().all(|w| w.width() == TRANSPORT_BITS));
        assert!(words.iter().all(|w| w.extract(16, TRANSPORT_BITS - 16).is_zero()));
        assert!(words.iter().any(|w| !w.is_zero()));

        let reference = reference_model(0).unwrap();
        assert_eq!(random_images(&reference, 2, 3).unwrap().len(), 2 * 14);
    }
}
