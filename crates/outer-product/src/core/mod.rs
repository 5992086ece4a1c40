//! Configuration and error types shared by every part of the aggregator.
//!
//! Tensors follow the layout conventions below throughout the crate:
//!
//! * sequence features `m`: `[batch, seq, residue, c_in]`
//! * validity mask: `[batch, seq, residue]`, entries in `{0, 1}`
//! * left/right hidden projections: `[batch, seq, residue, hidden]`
//! * aggregated pair features: `[batch, residue, residue, hidden * hidden]`,
//!   flattened row-major so channel pair `(c, d)` sits at `c * hidden + d`
//! * output: `[batch, residue, residue, c_out]`

pub mod config;
pub mod errors;

pub use config::{validate_chunk_size, OuterProductConfig, CHUNK_SIZE_ENV};
pub use errors::{OuterProductError, Result};

use candle_core::Tensor;

/// Aggregates per-sequence residue features into pair features.
pub trait PairAggregator: Send + Sync {
    /// Maps `m` `[batch, seq, residue, c_in]` and its validity `mask`
    /// `[batch, seq, residue]` to `[batch, residue, residue, c_out]`.
    ///
    /// `training` only affects how the result is computed, never its value.
    fn forward(&self, m: &Tensor, mask: &Tensor, training: bool) -> Result<Tensor>;
}
