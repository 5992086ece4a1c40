//! Contraction strategies turning masked hidden projections into pair features.
//!
//! Both strategies compute, for every residue pair `(i, j)` and channel pair
//! `(c, d)`,
//!
//! ```text
//! z[b, i, j, c * H + d] = Σ_s left[b, s, i, c] · right[b, s, j, d] / max(count[b, i, j], 1)
//! ```
//!
//! and feed `z` through the output projection. [`DenseContraction`]
//! materialises all of `z` at once. [`ChunkedContraction`] walks the left
//! hidden axis in slices, projecting each partial `z` with the matching
//! columns of the output weight and summing the contributions, so peak memory
//! is bounded by `[batch, N, N, chunk * H]`.
//!
//! Contractions always run in the policy's compute dtype (at least `f32`) and
//! the averaged tensor is cast back to the storage dtype before projection.

pub mod chunked;
pub mod dense;

pub use chunked::{chunk_ranges, ChunkedContraction};
pub use dense::DenseContraction;

use candle_core::Tensor;
use layers::{Linear, LinearLayer, PrecisionPolicy};

use crate::core::{OuterProductError, Result};

/// Masked projections and divisor shared by every strategy.
#[derive(Debug, Clone, Copy)]
pub struct ContractionInputs<'a> {
    left: &'a Tensor,
    right: &'a Tensor,
    divisor: &'a Tensor,
}

impl<'a> ContractionInputs<'a> {
    /// `left`/`right` are `[batch, seq, residue, hidden]` (already masked) and
    /// `divisor` is `[batch, residue, residue, 1]`.
    pub fn new(left: &'a Tensor, right: &'a Tensor, divisor: &'a Tensor) -> Result<Self> {
        let (batch, _, residues, _) = left.dims4().map_err(|_| {
            OuterProductError::shape(format!(
                "left projection must be [batch, seq, residue, hidden], got {:?}",
                left.dims()
            ))
        })?;
        if right.dims() != left.dims() {
            return Err(OuterProductError::shape(format!(
                "left {:?} and right {:?} projections must share a shape",
                left.dims(),
                right.dims()
            )));
        }
        if divisor.dims() != [batch, residues, residues, 1].as_slice() {
            return Err(OuterProductError::shape(format!(
                "divisor must be [{batch}, {residues}, {residues}, 1], got {:?}",
                divisor.dims()
            )));
        }
        Ok(Self {
            left,
            right,
            divisor,
        })
    }

    pub fn left(&self) -> &'a Tensor {
        self.left
    }

    pub fn right(&self) -> &'a Tensor {
        self.right
    }

    pub fn divisor(&self) -> &'a Tensor {
        self.divisor
    }

    /// Width of the hidden projections.
    pub fn hidden_dim(&self) -> usize {
        self.left.dims()[3]
    }

    fn check_projection(&self, projection: &Linear) -> Result<()> {
        let hidden = self.hidden_dim();
        let expected = hidden * hidden;
        let actual = projection.config().input_dim;
        if actual != expected {
            return Err(OuterProductError::shape(format!(
                "output projection expects {actual} input features, pair features have {expected}"
            )));
        }
        Ok(())
    }
}

/// One way of evaluating the contraction followed by the output projection.
pub trait ContractionStrategy: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Returns the projected pair features `[batch, residue, residue, c_out]`
    /// in the policy's storage dtype.
    fn contract(
        &self,
        inputs: &ContractionInputs<'_>,
        projection: &Linear,
        policy: &PrecisionPolicy,
    ) -> Result<Tensor>;
}

/// Strategy chosen for one forward call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Dense(DenseContraction),
    Chunked(ChunkedContraction),
}

/// Picks the strategy for a call.
///
/// Training always contracts densely; chunking is an inference-only memory
/// bound and is never selected while `training` is set.
pub fn select_strategy(chunk_size: Option<usize>, training: bool) -> Strategy {
    match chunk_size {
        Some(chunk_size) if !training => Strategy::Chunked(ChunkedContraction::new(chunk_size)),
        _ => Strategy::Dense(DenseContraction),
    }
}

impl ContractionStrategy for Strategy {
    fn name(&self) -> &'static str {
        match self {
            Strategy::Dense(dense) => dense.name(),
            Strategy::Chunked(chunked) => chunked.name(),
        }
    }

    fn contract(
        &self,
        inputs: &ContractionInputs<'_>,
        projection: &Linear,
        policy: &PrecisionPolicy,
    ) -> Result<Tensor> {
        match self {
            Strategy::Dense(dense) => dense.contract(inputs, projection, policy),
            Strategy::Chunked(chunked) => chunked.contract(inputs, projection, policy),
        }
    }
}

/// Sums `left ⊗ right` over the sequence axis and divides by `divisor`.
///
/// `left` is `[batch, seq, residue, c]`, `right` is `[batch, seq, residue, d]`;
/// the result is `[batch, residue, residue, c * d]` with channel pair `(c, d)`
/// flattened row-major. Both operands must share a dtype, which is also the
/// dtype of the result.
pub fn outer_product_mean(left: &Tensor, right: &Tensor, divisor: &Tensor) -> Result<Tensor> {
    let (batch, seq, residues, left_dim) = left.dims4()?;
    let right_dim = right.dims4()?.3;

    // [b, (i, c), s] x [b, s, (j, d)] -> [b, (i, c), (j, d)]
    let lhs = left
        .permute((0, 2, 3, 1))?
        .contiguous()?
        .reshape((batch, residues * left_dim, seq))?;
    let rhs = right
        .contiguous()?
        .reshape((batch, seq, residues * right_dim))?;
    let summed = lhs
        .matmul(&rhs)?
        .reshape((batch, residues, left_dim, residues, right_dim))?
        .transpose(2, 3)?
        .contiguous()?
        .reshape((batch, residues, residues, left_dim * right_dim))?;

    let divisor = divisor.to_dtype(summed.dtype())?;
    Ok(summed.broadcast_div(&divisor)?)
}
