//! Masking stage: sequence validity masks and pairwise averaging divisors.
//!
//! A validity mask shaped `[batch, seq, residue]` marks which residues of
//! which sequence copies carry data. It is used twice:
//!
//! * expanded to `[batch, seq, residue, 1]` to zero the left/right hidden
//!   projections at invalid positions;
//! * contracted over `seq` into `[batch, residue, residue]` pair counts, the
//!   number of sequence copies in which both residues are valid. Counts are
//!   floored at one before they divide the outer-product sum, so a pair with no
//!   evidence averages to zero instead of NaN.
//!
//! Masks may arrive as `u8`, `u32`, `i64`, or any float dtype; entries are
//! expected to be 0 or 1 and are converted, not validated.

pub mod pairwise;

pub use pairwise::{pair_counts, pair_divisor, PairMask};

use candle_core::{DType, Tensor};

use crate::core::{OuterProductError, Result};

/// Dtypes accepted for validity masks.
pub const MASK_DTYPES: &[DType] = &[
    DType::U8,
    DType::U32,
    DType::I64,
    DType::F16,
    DType::BF16,
    DType::F32,
    DType::F64,
];

/// Checks that `mask` matches the leading `[batch, seq, residue]` axes of `features`.
///
/// Broadcasting is never attempted; any disagreement is an error.
pub fn validate_mask(mask: &Tensor, features: &Tensor) -> Result<()> {
    let feature_dims = features.dims();
    if feature_dims.len() != 4 {
        return Err(OuterProductError::shape(format!(
            "sequence features must be [batch, seq, residue, channel], got {feature_dims:?}"
        )));
    }
    if mask.dims() != &feature_dims[..3] {
        return Err(OuterProductError::shape(format!(
            "mask shape {:?} does not match sequence features {:?}; expected {:?}",
            mask.dims(),
            feature_dims,
            &feature_dims[..3]
        )));
    }
    if !MASK_DTYPES.contains(&mask.dtype()) {
        return Err(OuterProductError::UnsupportedDType {
            requested: format!("mask dtype {:?}", mask.dtype()),
        });
    }
    if !mask.device().same_device(features.device()) {
        return Err(OuterProductError::shape(
            "mask must reside on the same device as the sequence features",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests;
