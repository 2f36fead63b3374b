// SPDX-License-Identifier: AGPL-3.0-only

//! Diagnostic taps on pipeline streams.
//!
//! A monitor sees every element written to the stream it is attached to,
//! after the producer hands it off and before the consumer receives it.
//! Monitors get a shared reference only; they cannot alter or reorder the
//! data. With no monitors attached a stream does no extra work.

use qcnn_core::BitWord;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::trace;

/// Passive observer of one or more streams.
pub trait StreamMonitor: Send + Sync {
    /// Called once per element, in stream order.
    ///
    /// `rep` is the image index within the run, `index` the element index
    /// within that image.
    fn observe(&self, stream: &str, rep: usize, index: usize, word: &BitWord);
}

/// Logs every element at `trace` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMonitor;

impl StreamMonitor for TracingMonitor {
    fn observe(&self, stream: &str, rep: usize, index: usize, word: &BitWord) {
        trace!(stream, rep, index, "0x{word:x}");
    }
}

/// One recorded element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    /// Stream name
    pub stream: String,
    /// Image index
    pub rep: usize,
    /// Element index within the image
    pub index: usize,
    /// Element value
    pub word: BitWord,
}

/// Keeps every observed element in memory.
#[derive(Debug, Default)]
pub struct RecordingMonitor {
    records: Mutex<Vec<Observation>>,
}

impl RecordingMonitor {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor for [`Engine::attach_monitor`](crate::Engine::attach_monitor).
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Snapshot of everything recorded so far.
    pub fn observations(&self) -> Vec<Observation> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Words seen on `stream`, in order.
    pub fn words(&self, stream: &str) -> Vec<BitWord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|o| o.stream == stream)
            .map(|o| o.word.clone())
            .collect()
    }

    /// Number of elements recorded.
    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// True if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StreamMonitor for RecordingMonitor {
    fn observe(&self, stream: &str, rep: usize, index: usize, word: &BitWord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Observation {
                stream: stream.to_owned(),
                rep,
                index,
                word: word.clone(),
            });
    }
}

/// Per-stream fan-out to the attached monitors, tracking image/element
/// position.
#[derive(Clone)]
pub struct Tap {
    stream: Arc<str>,
    monitors: Vec<Arc<dyn StreamMonitor>>,
    per_image: usize,
    seen: usize,
}

impl Tap {
    /// Tap for `stream` carrying `per_image` elements per image.
    pub fn new(stream: &str, monitors: Vec<Arc<dyn StreamMonitor>>, per_image: usize) -> Self {
        Self {
            stream: Arc::from(stream),
            monitors,
            per_image: per_image.max(1),
            seen: 0,
        }
    }

    /// Stream name.
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Report one element to every monitor.
    pub fn observe(&mut self, word: &BitWord) {
        if !self.monitors.is_empty() {
            let rep = self.seen / self.per_image;
            let index = self.seen % self.per_image;
            for m in &self.monitors {
                m.observe(&self.stream, rep, index, word);
            }
        }
        self.seen += 1;
    }
}

impl std::fmt::Debug for Tap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tap")
            .field("stream", &self.stream)
            .field("monitors", &self.monitors.len())
            .field("seen", &self.seen)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tap_tracks_image_and_index() {
        let rec = RecordingMonitor::shared();
        let shared: Arc<dyn StreamMonitor> = rec.clone();
        let mut tap = Tap::new("conv0", vec![shared], 3);
        for v in 0..7u64 {
            tap.observe(&BitWord::from_u64(8, v));
        }
        let obs = rec.observations();
        assert_eq!(obs.len(), 7);
        assert_eq!((obs[4].rep, obs[4].index), (1, 1));
        assert_eq!((obs[6].rep, obs[6].index), (2, 0));
        assert_eq!(rec.words("conv0")[5], BitWord::from_u64(8, 5));
        assert!(rec.words("pool0").is_empty());
    }

    #[test]
    fn test_tap_without_monitors_counts() {
        let mut tap = Tap::new("x", Vec::new(), 2);
        tap.observe(&BitWord::zero(4));
        assert_eq!(tap.seen, 1);
        assert_eq!(tap.stream(), "x");
    }
}
