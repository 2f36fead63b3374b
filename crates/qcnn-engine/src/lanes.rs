// SPDX-License-Identifier: AGPL-3.0-only

//! Concurrent output/input channel lanes.
//!
//! `OutP` output-channel groups are evaluated concurrently on a per-stage
//! rayon pool; within each dot product the fan-in is folded into `InP`
//! partial sums over contiguous input slices. Integer addition is exact,
//! so any `(InP, OutP)` produces the same accumulators.
//!
//! ```text
//! cout = 8, OutP = 4          fan_in = 18, InP = 2
//! ┌──┬──┬──┬──┐              [ 0 .. 9 ) [ 9 .. 18 )
//! │01│23│45│67│  ← lanes         part₀  +   part₁
//! └──┴──┴──┴──┘
//! ```

use crate::error::{EngineError, Result};
use qcnn_models::WeightTensor;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::debug;

/// Lane configuration and worker pool of one stage.
pub struct Lanes {
    in_p: usize,
    out_p: usize,
    pool: Option<ThreadPool>,
}

impl Lanes {
    /// Lanes for `stage` with at most `thread_cap` worker threads.
    ///
    /// A pool is only created when more than one thread would be used.
    ///
    /// # Errors
    ///
    /// Returns error if the folding factors are zero or the pool cannot be
    /// built.
    pub fn new(stage: &str, in_p: usize, out_p: usize, thread_cap: usize) -> Result<Self> {
        if in_p == 0 || out_p == 0 {
            return Err(EngineError::ThreadPool {
                stage: stage.to_owned(),
                reason: format!("folding factors must be non-zero (InP={in_p}, OutP={out_p})"),
            });
        }
        let threads = out_p.min(thread_cap);
        let pool = if threads > 1 {
            let prefix = stage.to_owned();
            let pool = ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(move |i| format!("{prefix}-lane{i}"))
                .build()
                .map_err(|e| EngineError::ThreadPool {
                    stage: stage.to_owned(),
                    reason: e.to_string(),
                })?;
            debug!("{stage}: {threads} lane threads (OutP={out_p}, InP={in_p})");
            Some(pool)
        } else {
            None
        };
        Ok(Self { in_p, out_p, pool })
    }

    /// Sequential lanes (no pool).
    pub const fn sequential(in_p: usize, out_p: usize) -> Self {
        Self {
            in_p,
            out_p,
            pool: None,
        }
    }

    /// Input folding factor.
    pub const fn in_p(&self) -> usize {
        self.in_p
    }

    /// Output folding factor.
    pub const fn out_p(&self) -> usize {
        self.out_p
    }

    /// Worker threads backing the lanes (1 when sequential).
    pub fn threads(&self) -> usize {
        self.pool.as_ref().map_or(1, ThreadPool::current_num_threads)
    }

    /// `acc[o] = Σᵢ weights[o][i] · input[i]` for every output channel.
    ///
    /// `acc.len()` is the output channel count and `input.len()` the fan-in.
    pub fn accumulate(&self, weights: &WeightTensor, input: &[i64], acc: &mut [i64]) {
        let fan_in = input.len();
        let group = acc.len().div_ceil(self.out_p).max(1);
        let in_p = self.in_p;
        let lane = |(g, chunk): (usize, &mut [i64])| {
            for (j, a) in chunk.iter_mut().enumerate() {
                let o = g * group + j;
                *a = folded_dot(weights.row(o, fan_in), input, in_p);
            }
        };
        match &self.pool {
            Some(pool) => pool.install(|| acc.par_chunks_mut(group).enumerate().for_each(lane)),
            None => acc.chunks_mut(group).enumerate().for_each(lane),
        }
    }
}

impl std::fmt::Debug for Lanes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lanes")
            .field("in_p", &self.in_p)
            .field("out_p", &self.out_p)
            .field("threads", &self.threads())
            .finish()
    }
}

/// Dot product folded into `in_p` contiguous partial sums.
pub fn folded_dot(weights: &[i8], input: &[i64], in_p: usize) -> i64 {
    let slice = input.len().div_ceil(in_p.max(1)).max(1);
    weights
        .chunks(slice)
        .zip(input.chunks(slice))
        .map(|(w, x)| {
            w.iter()
                .zip(x)
                .map(|(&w, &x)| i64::from(w) * x)
                .sum::<i64>()
        })
        .sum()
}
