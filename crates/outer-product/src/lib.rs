//! Masked outer-product mean: per-sequence residue features to pair features.
//!
//! Given sequence features `m` shaped `[batch, seq, residue, c_in]` and a
//! validity mask `[batch, seq, residue]`, the layer normalises `m`, projects it
//! to left/right hidden features of width `H`, and averages their outer
//! products over the valid sequence copies of every residue pair. The averaged
//! `[batch, residue, residue, H * H]` tensor is projected to `c_out` channels.
//!
//! Two contraction strategies produce the same result. Dense contraction
//! materialises the full pair tensor and is always used while training.
//! Chunked contraction bounds peak memory at inference by walking the hidden
//! axis in slices and accumulating partial projections; it is enabled by a
//! chunk size in [`OuterProductConfig`], the `OPM_CHUNK_SIZE` environment
//! variable, or per call.
//!
//! Contractions run in at least `f32` whatever the input dtype, and the output
//! matches the dtype of `m`.

pub mod contraction;
pub mod core;
pub mod masks;
pub mod module;
pub mod reference;

pub use contraction::{
    select_strategy, ChunkedContraction, ContractionStrategy, DenseContraction, Strategy,
};
pub use core::{OuterProductConfig, OuterProductError, PairAggregator, Result};
pub use masks::pair_counts;
pub use module::OuterProductMean;
