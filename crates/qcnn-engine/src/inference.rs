// SPDX-License-Identifier: AGPL-3.0-only

//! Batched inference with timing metrics
//!
//! Wraps [`Engine::run`] with the host-side steps around it: packing
//! pixels into transport words, decoding the score words and picking the
//! predicted class of every image.

use crate::pipeline::Engine;
use crate::transport::{argmax, pack_pixel_batch};
use crate::Result;
use qcnn_core::{BitWord, TRANSPORT_BITS};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Inference executor
pub struct InferenceExecutor {
    engine: Engine,
    sequential: bool,
}

impl InferenceExecutor {
    /// Create executor around a built engine
    pub fn new(engine: Engine) -> Self {
        info!("Creating inference executor");
        debug!(
            "Input: {} words/image, output: {:?}",
            engine.input_words_per_image(),
            engine.score_layout()
        );
        Self {
            engine,
            sequential: false,
        }
    }

    /// Run stages one after another on the calling thread instead of
    /// concurrently
    #[must_use]
    pub fn sequential(mut self, sequential: bool) -> Self {
        self.sequential = sequential;
        self
    }

    /// Execute `num_reps` images already packed as transport words
    ///
    /// # Errors
    ///
    /// Returns error if the input buffer is too small or the pipeline fails.
    pub fn infer(&self, input: &[BitWord], num_reps: usize) -> Result<InferenceResult> {
        debug!("Starting inference: {} images", num_reps);
        let mut output = vec![BitWord::zero(TRANSPORT_BITS); num_reps];

        let start = Instant::now();
        if self.sequential {
            self.engine.run_sequential(input, &mut output, num_reps)?;
        } else {
            self.engine.run(input, &mut output, num_reps)?;
        }
        let total_duration = start.elapsed();

        let layout = self.engine.score_layout();
        let scores: Vec<Vec<i64>> = output.iter().map(|w| layout.decode(w)).collect();
        let predictions = scores
            .iter()
            .map(|s| argmax(s).unwrap_or_default())
            .collect();

        info!("✅ Inference complete: {} images in {:?}", num_reps, total_duration);

        Ok(InferenceResult {
            output,
            scores,
            predictions,
            total_duration,
            images: num_reps,
        })
    }

    /// Pack 8-bit images and execute them
    ///
    /// # Errors
    ///
    /// Returns error if an image does not match the ingest layout or the
    /// pipeline fails.
    pub fn infer_pixels(&self, images: &[&[u8]]) -> Result<InferenceResult> {
        let words = pack_pixel_batch(images, self.engine.ingest_layout())?;
        self.infer(&words, images.len())
    }

    /// Underlying engine
    pub const fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Mutable engine access (monitor attachment)
    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }
}

/// Inference result with metrics
#[derive(Debug, Clone)]
pub struct InferenceResult {
    /// Raw output transport words, one per image
    pub output: Vec<BitWord>,

    /// Decoded signed scores per image
    pub scores: Vec<Vec<i64>>,

    /// Predicted class per image (first maximum)
    pub predictions: Vec<usize>,

    /// Wall time of the pipeline run
    pub total_duration: Duration,

    /// Images processed
    pub images: usize,
}

impl InferenceResult {
    /// Calculate throughput (inferences per second)
    pub fn throughput_ips(&self) -> f64 {
        if self.total_duration.as_secs_f64() == 0.0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let images = self.images as f64;
        images / self.total_duration.as_secs_f64()
    }

    /// Average latency per image in microseconds
    pub fn latency_us(&self) -> f64 {
        if self.images == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let images = self.images as f64;
        self.total_duration.as_secs_f64() * 1_000_000.0 / images
    }
}
