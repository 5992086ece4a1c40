//! Pairwise validity counts derived from a sequence mask.

use candle_core::{DType, Tensor};
use layers::PrecisionPolicy;

use super::validate_mask;
use crate::core::Result;

/// Masks derived once per forward call and shared by both contraction strategies.
#[derive(Debug, Clone)]
pub struct PairMask {
    sequence: Tensor,
    divisor: Tensor,
}

impl PairMask {
    /// Validates `mask` against `features` and derives both masks.
    ///
    /// The sequence mask is kept in the storage dtype so it can multiply the
    /// projections directly; the divisor is kept in the compute dtype because
    /// it divides the upcast contraction result.
    pub fn new(mask: &Tensor, features: &Tensor, policy: &PrecisionPolicy) -> Result<Self> {
        validate_mask(mask, features)?;
        let sequence = mask.to_dtype(policy.storage())?.unsqueeze(3)?;
        let counts = pair_counts(mask, policy.compute())?;
        let divisor = pair_divisor(&counts)?.unsqueeze(3)?;
        Ok(Self { sequence, divisor })
    }

    /// Validity mask shaped `[batch, seq, residue, 1]`.
    pub fn sequence(&self) -> &Tensor {
        &self.sequence
    }

    /// Floored pair counts shaped `[batch, residue, residue, 1]`.
    pub fn divisor(&self) -> &Tensor {
        &self.divisor
    }
}

/// Number of sequence copies in which both residues of a pair are valid.
///
/// Equivalent to broadcasting `mask[:, :, :, None] * mask[:, :, None, :]` to
/// `[batch, seq, residue, residue]` and summing over `seq`, computed as a
/// batched `maskᵀ · mask` product so the `seq`-sized intermediate is never
/// materialised. The result is symmetric and shaped `[batch, residue, residue]`.
pub fn pair_counts(mask: &Tensor, dtype: DType) -> Result<Tensor> {
    let mask = mask.to_dtype(dtype)?.contiguous()?;
    let transposed = mask.transpose(1, 2)?.contiguous()?;
    Ok(transposed.matmul(&mask)?)
}

/// Floors pair counts at one.
pub fn pair_divisor(counts: &Tensor) -> Result<Tensor> {
    let floor = counts.ones_like()?;
    Ok(counts.maximum(&floor)?)
}
