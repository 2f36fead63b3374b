// SPDX-License-Identifier: AGPL-3.0-only

//! Pipeline driver.
//!
//! ```text
//! feeder ─input─▶ ingest ─ingest─▶ conv0 ─conv0─▶ pool0 ─pool0─▶ … ─dense1─▶ egress ─egress─▶ caller
//! ```
//!
//! Every stage is built once in [`Engine::new`] and runs on its own named
//! thread for the duration of [`Engine::run`]. Links are bounded channels
//! named after the stage that writes them. The caller's thread collects the
//! output words, so a run returns only once every image is through.

use crate::error::{EngineError, Result};
use crate::monitor::{StreamMonitor, Tap};
use crate::stages::{build_layer_stage, RepackStage, Stage};
use crate::stream::{self, ElementSink, ElementSource, TappedVec};
use crate::transport::ScoreLayout;
use qcnn_core::{BitWord, FixedPoint, IngestLayout, LayerKind, TRANSPORT_BITS};
use qcnn_models::{Model, ModelError};
use std::collections::{HashMap, HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, info, trace};

/// Name of the stream the feeder writes.
pub const INPUT_STREAM: &str = "input";

/// Runtime knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Slots per inter-stage channel
    pub channel_depth: usize,

    /// Upper bound on lane threads per stage (1 disables lane pools)
    pub lane_thread_cap: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channel_depth: 64,
            lane_thread_cap: thread::available_parallelism().map_or(1, NonZeroUsize::get),
        }
    }
}

impl EngineConfig {
    /// Single-threaded lanes, shallow channels
    pub const fn minimal() -> Self {
        Self {
            channel_depth: 1,
            lane_thread_cap: 1,
        }
    }

    /// Override channel depth
    #[must_use]
    pub const fn with_channel_depth(mut self, depth: usize) -> Self {
        self.channel_depth = depth;
        self
    }

    /// Override the lane thread cap
    #[must_use]
    pub const fn with_lane_threads(mut self, cap: usize) -> Self {
        self.lane_thread_cap = cap;
        self
    }
}

/// Configured inference pipeline
pub struct Engine {
    fixed: FixedPoint,
    ingest: IngestLayout,
    stages: Vec<Box<dyn Stage>>,
    monitors: HashMap<String, Vec<Arc<dyn StreamMonitor>>>,
    config: EngineConfig,
    scores: ScoreLayout,
}

impl Engine {
    /// Build and validate the whole chain.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - the chain does not end in a dense-no-act layer
    /// - layer names collide with each other or with the boundary streams
    /// - a stage cannot consume its producer's stream
    /// - the ingest or egress payload widths do not fit
    pub fn new(model: &Model, config: EngineConfig) -> Result<Self> {
        let fixed = model.fixed_point();
        let terminal = model.terminal();
        if terminal.kind != LayerKind::DenseNoAct {
            return Err(ModelError::invalid_layer(
                &terminal.name,
                format!("pipeline must end in a dense-no-act layer, found {}", terminal.kind),
            )
            .into());
        }

        let mut seen: HashSet<&str> = [INPUT_STREAM, "ingest", "egress"].into_iter().collect();
        for layer in model.layers() {
            if !seen.insert(layer.name.as_str()) {
                return Err(ModelError::invalid_layer(&layer.name, "duplicate stream name").into());
            }
        }

        let ingest = RepackStage::ingest(model.ingest(), model.input_shape())?;
        let mut upstream = ingest.output_shape();
        let mut producer = ingest.name().to_owned();
        let mut stages: Vec<Box<dyn Stage>> = vec![Box::new(ingest)];

        for spec in model.layers() {
            let stage = build_layer_stage(spec, &producer, upstream, fixed, config.lane_thread_cap)?;
            debug!("{:?}", stage);
            upstream = stage.output_shape();
            producer = stage.name().to_owned();
            stages.push(stage);
        }

        let egress = RepackStage::egress(upstream)?;
        stages.push(Box::new(egress));

        let scores = ScoreLayout {
            classes: terminal.config.cout,
            bits: terminal.config.mbit as usize,
            scale_bits: fixed.scale_bits,
        };

        info!(
            "✅ Engine ready: {} stages, {} classes × {} bits",
            stages.len(),
            scores.classes,
            scores.bits
        );

        Ok(Self {
            fixed,
            ingest: model.ingest(),
            stages,
            monitors: HashMap::new(),
            config,
            scores,
        })
    }

    /// Stream names in pipeline order, starting with the feeder's.
    pub fn stream_names(&self) -> Vec<&str> {
        std::iter::once(INPUT_STREAM)
            .chain(self.stages.iter().map(|s| s.name()))
            .collect()
    }

    /// Stages in pipeline order (ingest first, egress last).
    pub fn stages(&self) -> &[Box<dyn Stage>] {
        &self.stages
    }

    /// Attach a passive observer to the stream named `stream`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownStream`] if no stream has that name.
    pub fn attach_monitor(&mut self, stream: &str, monitor: Arc<dyn StreamMonitor>) -> Result<()> {
        if !self.stream_names().contains(&stream) {
            return Err(EngineError::UnknownStream {
                name: stream.to_owned(),
            });
        }
        self.monitors
            .entry(stream.to_owned())
            .or_default()
            .push(monitor);
        debug!("Monitor attached to {}", stream);
        Ok(())
    }

    /// Remove every monitor.
    pub fn detach_monitors(&mut self) {
        self.monitors.clear();
    }

    /// Transport words consumed per image
    pub const fn input_words_per_image(&self) -> usize {
        self.ingest.lines_per_image
    }

    /// Input line layout
    pub const fn ingest_layout(&self) -> IngestLayout {
        self.ingest
    }

    /// Transport words produced per image
    pub const fn output_words_per_image(&self) -> usize {
        1
    }

    /// Score placement in each output word
    pub const fn score_layout(&self) -> ScoreLayout {
        self.scores
    }

    /// Fixed-point widths
    pub const fn fixed_point(&self) -> FixedPoint {
        self.fixed
    }

    /// Runtime configuration
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Process `num_reps` images: read `num_reps · input_words_per_image()`
    /// words from `input`, write `num_reps` words to `output`.
    ///
    /// All stages run concurrently. Nothing outside the two buffers is
    /// touched apart from attached monitors.
    ///
    /// # Errors
    ///
    /// Returns error if a buffer is too small, an input word is not
    /// 512 bits, or a worker fails. When several stages fail the first
    /// root cause in pipeline order is reported rather than the
    /// [`EngineError::StreamClosed`] it triggers in its neighbours.
    pub fn run(&self, input: &[BitWord], output: &mut [BitWord], num_reps: usize) -> Result<()> {
        if num_reps == 0 {
            return Ok(());
        }
        let (input, output) = self.check_buffers(input, output, num_reps)?;
        let depth = self.config.channel_depth;
        let started = Instant::now();

        thread::scope(|scope| -> Result<()> {
            let (mut feed, mut upstream) =
                stream::link(self.tap(INPUT_STREAM, self.ingest.lines_per_image), depth);
            let mut workers = Vec::with_capacity(self.stages.len() + 1);

            let feeder = thread::Builder::new()
                .name("feeder".to_owned())
                .spawn_scoped(scope, move || -> Result<()> {
                    for word in input {
                        feed.push(word.clone())?;
                    }
                    Ok(())
                })?;
            workers.push((INPUT_STREAM, feeder));

            for stage in &self.stages {
                let stage: &dyn Stage = stage.as_ref();
                let (mut writer, reader) =
                    stream::link(self.tap(stage.name(), stage.output_shape().elements()), depth);
                let mut reader = std::mem::replace(&mut upstream, reader);
                let handle = thread::Builder::new()
                    .name(stage.name().to_owned())
                    .spawn_scoped(scope, move || -> Result<()> {
                        for rep in 0..num_reps {
                            stage.process_image(&mut reader, &mut writer)?;
                            trace!("{}: image {} done", stage.name(), rep);
                        }
                        Ok(())
                    })?;
                workers.push((stage.name(), handle));
            }

            let mut collected = Ok(());
            for slot in output.iter_mut() {
                match upstream.pull() {
                    Ok(word) => *slot = word,
                    Err(e) => {
                        collected = Err(e);
                        break;
                    }
                }
            }
            drop(upstream);

            let mut errors = Vec::new();
            for (name, handle) in workers {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => errors.push(e),
                    Err(_) => errors.push(EngineError::WorkerPanicked {
                        stage: name.to_owned(),
                    }),
                }
            }
            errors.extend(collected.err());
            root_cause(errors)
        })?;

        let elapsed = started.elapsed();
        debug!("Run complete: {} images in {:?}", num_reps, elapsed);
        Ok(())
    }

    /// Same contract as [`Engine::run`], executed stage by stage on the
    /// calling thread. Monitors see the same elements in the same order.
    ///
    /// # Errors
    ///
    /// Returns error if a buffer is too small or an element is malformed.
    pub fn run_sequential(
        &self,
        input: &[BitWord],
        output: &mut [BitWord],
        num_reps: usize,
    ) -> Result<()> {
        if num_reps == 0 {
            return Ok(());
        }
        let (input, output) = self.check_buffers(input, output, num_reps)?;

        let mut feed = TappedVec::new(self.tap(INPUT_STREAM, self.ingest.lines_per_image));
        for word in input {
            feed.push(word.clone())?;
        }
        let mut queue: VecDeque<BitWord> = feed.words.into();
        for stage in &self.stages {
            let mut sink = TappedVec::new(self.tap(stage.name(), stage.output_shape().elements()));
            for _ in 0..num_reps {
                stage.process_image(&mut queue, &mut sink)?;
            }
            queue = sink.words.into();
        }
        for slot in output.iter_mut() {
            *slot = queue.pull()?;
        }
        Ok(())
    }

    fn check_buffers<'i, 'o>(
        &self,
        input: &'i [BitWord],
        output: &'o mut [BitWord],
        num_reps: usize,
    ) -> Result<(&'i [BitWord], &'o mut [BitWord])> {
        let need_in = num_reps * self.input_words_per_image();
        let need_out = num_reps * self.output_words_per_image();
        if input.len() < need_in {
            return Err(EngineError::BufferSize {
                what: "input",
                expected: need_in,
                actual: input.len(),
            });
        }
        if output.len() < need_out {
            return Err(EngineError::BufferSize {
                what: "output",
                expected: need_out,
                actual: output.len(),
            });
        }
        let input = &input[..need_in];
        if let Some((i, w)) = input
            .iter()
            .enumerate()
            .find(|(_, w)| w.width() != TRANSPORT_BITS)
        {
            return Err(EngineError::payload_width(
                INPUT_STREAM,
                format!("word {i} is {} bits, expected {TRANSPORT_BITS}", w.width()),
            ));
        }
        Ok((input, &mut output[..need_out]))
    }

    fn tap(&self, stream: &str, per_image: usize) -> Tap {
        let monitors = self.monitors.get(stream).cloned().unwrap_or_default();
        Tap::new(stream, monitors, per_image)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("stages", &self.stream_names())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// First error that is not a secondary stream closure, else the first error.
fn root_cause(mut errors: Vec<EngineError>) -> Result<()> {
    if errors.is_empty() {
        return Ok(());
    }
    let pos = errors
        .iter()
        .position(|e| !e.is_stream_closed())
        .unwrap_or(0);
    Err(errors.swap_remove(pos))
}
