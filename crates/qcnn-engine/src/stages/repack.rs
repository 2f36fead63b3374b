// SPDX-License-Identifier: AGPL-3.0-only

//! Host-boundary width conversion.
//!
//! - **Ingest**: keeps the low `line_bits` of each transport word and
//!   narrows the concatenated payload to first-layer elements.
//! - **Egress**: widens the terminal score element to one transport word,
//!   zero-padding the high bits.
//!
//! Both flush at the end of every image, so residue never crosses images.

use super::{pull_checked, Stage};
use crate::error::{EngineError, Result};
use crate::stream::{ElementSink, ElementSource};
use qcnn_core::{IngestLayout, Repacker, StreamShape, TRANSPORT_BITS};
use tracing::trace;

/// Stream width converter.
#[derive(Debug, Clone)]
pub struct RepackStage {
    name: String,
    input: StreamShape,
    output: StreamShape,
    payload_bits: usize,
}

impl RepackStage {
    /// Ingest converter: transport lines → elements of `first`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::PayloadWidth`] if a line does not carry a
    /// whole number of `first` elements or the lines of an image do not
    /// add up to exactly one image of `first`.
    pub fn ingest(layout: IngestLayout, first: StreamShape) -> Result<Self> {
        let name = "ingest";
        if layout.line_bits == 0 || layout.line_bits > TRANSPORT_BITS {
            return Err(EngineError::payload_width(
                name,
                format!("line payload of {} bits outside 1..={TRANSPORT_BITS}", layout.line_bits),
            ));
        }
        let element = first.element_bits();
        if element == 0 || layout.line_bits % element != 0 {
            return Err(EngineError::payload_width(
                name,
                format!(
                    "{}-bit line payload is not a multiple of the {element}-bit element",
                    layout.line_bits
                ),
            ));
        }
        if layout.image_bits() != first.image_bits() {
            return Err(EngineError::payload_width(
                name,
                format!(
                    "{} lines × {} bits = {} bits per image, first layer consumes {}",
                    layout.lines_per_image,
                    layout.line_bits,
                    layout.image_bits(),
                    first.image_bits()
                ),
            ));
        }
        Ok(Self {
            name: name.to_owned(),
            input: StreamShape::words(layout.lines_per_image, TRANSPORT_BITS),
            output: first,
            payload_bits: layout.line_bits,
        })
    }

    /// Egress padder: one terminal element → one transport word.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::PayloadWidth`] if the scores do not fit one
    /// transport word.
    pub fn egress(last: StreamShape) -> Result<Self> {
        let name = "egress";
        if last.elements() != 1 || last.element_bits() == 0 || last.element_bits() > TRANSPORT_BITS {
            return Err(EngineError::payload_width(
                name,
                format!("terminal output {last} does not fit one {TRANSPORT_BITS}-bit word"),
            ));
        }
        Ok(Self {
            name: name.to_owned(),
            input: last,
            output: StreamShape::words(1, TRANSPORT_BITS),
            payload_bits: last.element_bits(),
        })
    }
}

impl Stage for RepackStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_shape(&self) -> StreamShape {
        self.input
    }

    fn output_shape(&self) -> StreamShape {
        self.output
    }

    fn process_image(
        &self,
        input: &mut dyn ElementSource,
        output: &mut dyn ElementSink,
    ) -> Result<()> {
        let mut repacker = Repacker::new(self.payload_bits, self.output.element_bits());
        let mut ready = Vec::new();
        let mut emitted = 0;
        for _ in 0..self.input.elements() {
            let word = pull_checked(&self.name, input, self.input.element_bits())?;
            let payload = if self.payload_bits < word.width() {
                word.extract(0, self.payload_bits)
            } else {
                word
            };
            repacker.push(&payload, |w| ready.push(w));
            for w in ready.drain(..) {
                output.push(w)?;
                emitted += 1;
            }
        }
        repacker.flush(|w| ready.push(w));
        for w in ready.drain(..) {
            output.push(w)?;
            emitted += 1;
        }
        trace!("{}: image done, {} elements", self.name, emitted);
        debug_assert_eq!(emitted, self.output.elements());
        Ok(())
    }
}
