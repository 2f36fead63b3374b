// SPDX-License-Identifier: AGPL-3.0-only

//! Bounded element streams between stages.
//!
//! Every link is a single-producer/single-consumer `crossbeam-channel`
//! bounded channel. `push` blocks while the channel is full, `pull` blocks
//! while it is empty. That blocking is the only synchronization between
//! stages. Ownership of each [`BitWord`] moves to the consumer on transfer.
//!
//! Stages are written against [`ElementSource`] / [`ElementSink`] so the
//! same code runs on threads (channels) or sequentially (in-memory queues).

use crate::error::{EngineError, Result};
use crate::monitor::Tap;
use crossbeam_channel::{bounded, Receiver, Sender};
use qcnn_core::BitWord;
use std::collections::VecDeque;

/// Something a stage reads elements from.
pub trait ElementSource {
    /// Next element, blocking until one is available.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::StreamClosed`] if no element will ever arrive.
    fn pull(&mut self) -> Result<BitWord>;
}

/// Something a stage writes elements to.
pub trait ElementSink {
    /// Hand off one element, blocking while the link is full.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::StreamClosed`] if the consumer has gone away.
    fn push(&mut self, word: BitWord) -> Result<()>;
}

/// Create a named link of `depth` slots.
pub fn link(tap: Tap, depth: usize) -> (StreamWriter, StreamReader) {
    let (tx, rx) = bounded(depth.max(1));
    let name = tap.stream().to_owned();
    (StreamWriter { tx, tap }, StreamReader { name, rx })
}

/// Producer end of a link.
#[derive(Debug)]
pub struct StreamWriter {
    tx: Sender<BitWord>,
    tap: Tap,
}

impl ElementSink for StreamWriter {
    fn push(&mut self, word: BitWord) -> Result<()> {
        self.tap.observe(&word);
        self.tx
            .send(word)
            .map_err(|_| EngineError::stream_closed(self.tap.stream()))
    }
}

/// Consumer end of a link.
#[derive(Debug)]
pub struct StreamReader {
    name: String,
    rx: Receiver<BitWord>,
}

impl StreamReader {
    /// Stream name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl ElementSource for StreamReader {
    fn pull(&mut self) -> Result<BitWord> {
        self.rx
            .recv()
            .map_err(|_| EngineError::stream_closed(&self.name))
    }
}

impl ElementSource for VecDeque<BitWord> {
    fn pull(&mut self) -> Result<BitWord> {
        self.pop_front()
            .ok_or_else(|| EngineError::stream_closed("memory"))
    }
}

impl ElementSink for Vec<BitWord> {
    fn push(&mut self, word: BitWord) -> Result<()> {
        Vec::push(self, word);
        Ok(())
    }
}

/// In-memory sink that still reports to monitors.
#[derive(Debug)]
pub struct TappedVec {
    /// Collected words
    pub words: Vec<BitWord>,
    tap: Tap,
}

impl TappedVec {
    /// Empty sink reporting to `tap`.
    pub fn new(tap: Tap) -> Self {
        Self {
            words: Vec::new(),
            tap,
        }
    }
}

impl ElementSink for TappedVec {
    fn push(&mut self, word: BitWord) -> Result<()> {
        self.tap.observe(&word);
        self.words.push(word);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_link_preserves_order_under_backpressure() {
        let (mut tx, mut rx) = link(Tap::new("s", Vec::new(), 1), 2);
        let producer = thread::spawn(move || {
            for v in 0..100u64 {
                tx.push(BitWord::from_u64(16, v)).unwrap();
            }
        });
        for v in 0..100u64 {
            assert_eq!(rx.pull().unwrap().get(0, 16), v);
        }
        producer.join().unwrap();
    }

    #[test]
    fn test_closed_link_reports_stream() {
        let (tx, mut rx) = link(Tap::new("pool0", Vec::new(), 1), 1);
        drop(tx);
        match rx.pull() {
            Err(EngineError::StreamClosed { stream }) => assert_eq!(stream, "pool0"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_queue_source_runs_dry() {
        let mut q: VecDeque<BitWord> = VecDeque::from(vec![BitWord::zero(1)]);
        assert!(q.pull().is_ok());
        assert!(q.pull().unwrap_err().is_stream_closed());
    }
}
