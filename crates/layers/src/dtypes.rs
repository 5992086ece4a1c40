//! Precision and dtype policy utilities used throughout the layers crate.
//!
//! Parameters typically reside in `f16`/`bf16` for memory efficiency while
//! compute-intensive paths promote tensors to `f32`. Contractions that sum
//! over many terms (matmuls, outer-product means) and reductions (layer norm
//! statistics) always run at single precision or wider. This module exposes
//! [`PrecisionPolicy`] so callers can consistently cast tensors before
//! contractions, reductions, or final outputs.

use candle_core::{DType, Result, Tensor};

/// Epsilon values used for comparisons at different stages of a computation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrecisionEpsilons {
    /// Tolerance for tensors stored on disk or in module parameters.
    pub storage: f32,
    /// Tolerance for intermediate matmul/contraction results.
    pub compute: f32,
    /// Tolerance for statistics computed during reductions.
    pub reduction: f32,
}

/// Describes how tensors should be cast during different phases of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    storage: DType,
    compute: DType,
    reduction: DType,
}

impl PrecisionPolicy {
    /// Constructs a new policy from explicit dtype selections.
    pub fn new(storage: DType, compute: DType, reduction: DType) -> Self {
        Self {
            storage,
            compute,
            reduction,
        }
    }

    /// Builds a policy from the parameter storage dtype.
    ///
    /// Half-precision storage computes in `f32`; `f64` storage keeps `f64`
    /// everywhere so the promotion never narrows.
    pub fn from_parameter_dtype(storage: DType) -> Self {
        let compute = widen(storage);
        Self::new(storage, compute, compute)
    }

    /// Returns the dtype used to store parameters and outputs.
    pub fn storage(&self) -> DType {
        self.storage
    }

    /// Returns the dtype used for matmuls and contractions.
    pub fn compute(&self) -> DType {
        self.compute
    }

    /// Returns the dtype used for reductions such as layer norm statistics.
    pub fn reduction(&self) -> DType {
        self.reduction
    }

    /// Indicates whether the policy performs mixed precision work.
    pub fn is_mixed_precision(&self) -> bool {
        self.storage != self.compute || self.compute != self.reduction
    }

    /// Tolerance values derived from the configured dtypes.
    pub fn epsilons(&self) -> PrecisionEpsilons {
        PrecisionEpsilons {
            storage: epsilon_for(self.storage),
            compute: epsilon_for(self.compute),
            reduction: epsilon_for(self.reduction),
        }
    }

    /// Casts a tensor to the compute dtype for matmul readiness.
    pub fn cast_for_matmul(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.compute)
    }

    /// Casts a tensor to the reduction dtype for statistics.
    pub fn cast_for_reduction(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.reduction)
    }

    /// Casts a tensor back to the storage dtype (or leaves it unchanged).
    pub fn cast_to_storage(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.storage)
    }
}

fn widen(dtype: DType) -> DType {
    match dtype {
        DType::F64 => DType::F64,
        _ => DType::F32,
    }
}

fn cast_tensor(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}

fn epsilon_for(dtype: DType) -> f32 {
    match dtype {
        DType::BF16 => 2e-2,
        DType::F16 => 5e-3,
        DType::F32 => 1e-5,
        DType::F64 => 1e-7,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn policy_promotes_reduced_precision_parameters() {
        for dtype in [DType::F16, DType::BF16] {
            let policy = PrecisionPolicy::from_parameter_dtype(dtype);
            assert_eq!(policy.storage(), dtype);
            assert_eq!(policy.compute(), DType::F32);
            assert_eq!(policy.reduction(), DType::F32);
            assert!(policy.is_mixed_precision());
        }
    }

    #[test]
    fn double_precision_is_never_narrowed() {
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F64);
        assert_eq!(policy.compute(), DType::F64);
        assert_eq!(policy.reduction(), DType::F64);
        assert!(!policy.is_mixed_precision());
    }

    #[test]
    fn cast_round_trip_preserves_values_within_tolerance() -> Result<()> {
        let device = Device::Cpu;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::BF16);
        let base = Tensor::from_vec(vec![0.125f32, -0.75, 3.5], (3,), &device)?;
        let storage = base.to_dtype(policy.storage())?;

        let compute = policy.cast_for_matmul(&storage)?;
        assert_eq!(compute.dtype(), policy.compute());

        let round_trip = policy.cast_to_storage(&compute)?;
        let original = base.to_vec1::<f32>()?;
        let restored = round_trip.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        let eps = policy.epsilons().storage;
        for (orig, rest) in original.iter().zip(restored.iter()) {
            assert!((orig - rest).abs() <= eps);
        }
        Ok(())
    }

    #[test]
    fn half_precision_sums_survive_in_compute_dtype() -> Result<()> {
        let device = Device::Cpu;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F16);
        // Accumulating 4096 ones one at a time in f16 stalls at 2048.
        let tensor = Tensor::ones(4096, DType::F16, &device)?;
        let summed = policy
            .cast_for_reduction(&tensor)?
            .sum_all()?
            .to_vec0::<f32>()?;
        assert_eq!(summed, 4096.0);
        Ok(())
    }

    #[test]
    fn epsilons_track_dtype_expectations() {
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let eps = policy.epsilons();
        assert!(eps.compute < 1e-4);
        assert_eq!(eps.compute, eps.reduction);
        assert_eq!(eps.storage, eps.compute);
    }
}
