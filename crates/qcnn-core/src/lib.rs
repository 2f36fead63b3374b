// SPDX-License-Identifier: AGPL-3.0-only

//! Arithmetic model of the quantized CNN pipeline.
//!
//! This crate has **no dependencies** and performs no I/O. It describes
//! the bit-level surface every other crate agrees on: fixed-width words,
//! lossless width conversion, layer geometry, the host transport layout and
//! the reference MNIST network constants.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`bits`] | `BitWord` fixed-width bit buffer with field extraction/insertion |
//! | [`repack`] | `Repacker` lossless W_in → W_out conversion |
//! | [`layer`] | `LayerConfig`, shape law, accumulator sizing, `StreamShape` |
//! | [`transport`] | 512-bit host word layout, `IngestLayout` |
//! | [`topology`] | Reference 1W5A MNIST network (4 conv, 2 pool, 2 dense) |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod bits;
pub mod layer;
pub mod repack;
pub mod topology;
pub mod transport;

pub use bits::BitWord;
pub use layer::{FixedPoint, LayerConfig, LayerKind, StreamShape};
pub use repack::Repacker;
pub use transport::{IngestLayout, TRANSPORT_BITS};
