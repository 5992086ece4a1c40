//! Single-shot contraction used for training and unchunked inference.

use candle_core::Tensor;
use layers::{Linear, LinearLayer, PrecisionPolicy};

use super::{outer_product_mean, ContractionInputs, ContractionStrategy};
use crate::core::Result;

/// Materialises the full `[batch, N, N, H * H]` pair tensor, then projects it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DenseContraction;

impl DenseContraction {
    /// Averaged pair features `[batch, N, N, H * H]` in the storage dtype.
    ///
    /// Operands are promoted to the compute dtype for the contraction and the
    /// division; only the averaged result is narrowed back.
    pub fn average(&self, inputs: &ContractionInputs<'_>, policy: &PrecisionPolicy) -> Result<Tensor> {
        let left = policy.cast_for_matmul(inputs.left())?;
        let right = policy.cast_for_matmul(inputs.right())?;
        let averaged = outer_product_mean(&left, &right, inputs.divisor())?;
        Ok(policy.cast_to_storage(&averaged)?)
    }
}

impl ContractionStrategy for DenseContraction {
    fn name(&self) -> &'static str {
        "dense"
    }

    fn contract(
        &self,
        inputs: &ContractionInputs<'_>,
        projection: &Linear,
        policy: &PrecisionPolicy,
    ) -> Result<Tensor> {
        inputs.check_projection(projection)?;
        let averaged = self.average(inputs, policy)?;
        Ok(projection.forward(&averaged, policy)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use layers::LinearConfig;

    #[test]
    fn half_precision_inputs_contract_in_f32() -> Result<()> {
        let device = Device::Cpu;
        // 600 products of 16.0 sum to 9600, exact in f32; a bf16 running sum
        // starts dropping the 16s once it passes 4096.
        let (seq, hidden) = (600, 2);
        let left = Tensor::full(4f32, (1, seq, 1, hidden), &device)?.to_dtype(DType::BF16)?;
        let divisor = Tensor::full(seq as f32, (1, 1, 1, 1), &device)?;
        let inputs = ContractionInputs::new(&left, &left, &divisor)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::BF16);

        let averaged = DenseContraction.average(&inputs, &policy)?;
        assert_eq!(averaged.dtype(), DType::BF16);
        let values = averaged.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|&v| v == 16.0), "{values:?}");
        Ok(())
    }

    #[test]
    fn projection_width_must_match_pair_features() -> Result<()> {
        let device = Device::Cpu;
        let left = Tensor::zeros((1, 2, 3, 4), DType::F32, &device)?;
        let divisor = Tensor::ones((1, 3, 3, 1), DType::F32, &device)?;
        let inputs = ContractionInputs::new(&left, &left, &divisor)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let weight = Tensor::zeros((5, 8), DType::F32, &device)?;
        let projection = Linear::new(LinearConfig::without_bias(8, 5), weight, None)?;
        assert!(DenseContraction.contract(&inputs, &projection, &policy).is_err());
        Ok(())
    }
}
