//! Memory-bounded contraction for inference.
//!
//! The left hidden axis is split into contiguous slices `[start, start + len)`.
//! Because pair features are flattened as `c * H + d`, the slice owns the
//! contiguous feature range `[start * H, (start + len) * H)` and therefore the
//! same columns of the output weight. Each slice is contracted against the full
//! right projection, averaged, projected with those columns only, and summed.
//!
//! The fold is seeded with the output bias (zeros without one), so the bias
//! lands in the result exactly once whatever the number of chunks.

use std::ops::Range;

use candle_core::Tensor;
use layers::{Linear, LinearLayer, PrecisionPolicy};

use super::{outer_product_mean, ContractionInputs, ContractionStrategy};
use crate::core::{validate_chunk_size, Result};

/// Splits `[0, hidden_dim)` into ranges of `chunk_size`.
///
/// The last range is shorter when `chunk_size` does not divide `hidden_dim`.
pub fn chunk_ranges(hidden_dim: usize, chunk_size: usize) -> impl Iterator<Item = Range<usize>> {
    (0..hidden_dim)
        .step_by(chunk_size.max(1))
        .map(move |start| start..(start + chunk_size).min(hidden_dim))
}

/// Contracts `chunk_size` left channels at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkedContraction {
    chunk_size: usize,
}

impl ChunkedContraction {
    /// The size is checked against the hidden width when contracting.
    pub fn new(chunk_size: usize) -> Self {
        Self { chunk_size }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

impl ContractionStrategy for ChunkedContraction {
    fn name(&self) -> &'static str {
        "chunked"
    }

    fn contract(
        &self,
        inputs: &ContractionInputs<'_>,
        projection: &Linear,
        policy: &PrecisionPolicy,
    ) -> Result<Tensor> {
        let hidden = inputs.hidden_dim();
        validate_chunk_size(self.chunk_size, hidden)?;
        inputs.check_projection(projection)?;

        let left = inputs.left();
        let (batch, _, residues, _) = left.dims4()?;
        let out_shape = (batch, residues, residues, projection.config().output_dim);
        let seed = match projection.bias() {
            Some(bias) => policy
                .cast_for_matmul(bias)?
                .broadcast_as(out_shape)?
                .contiguous()?,
            None => Tensor::zeros(out_shape, policy.compute(), left.device())?,
        };

        let right = policy.cast_for_matmul(inputs.right())?;
        let projected = chunk_ranges(hidden, self.chunk_size).try_fold(
            seed,
            |acc, range| -> Result<Tensor> {
                log::trace!(
                    "outer_product_mean chunk channels={:?} weight_columns={:?}",
                    range,
                    range.start * hidden..range.end * hidden
                );
                let width = range.len();
                let left_chunk = policy.cast_for_matmul(&left.narrow(3, range.start, width)?)?;
                let averaged = outer_product_mean(&left_chunk, &right, inputs.divisor())?;
                let averaged = policy.cast_to_storage(&averaged)?;
                let columns = projection.input_slice(range.start * hidden, width * hidden)?;
                let contribution = columns.forward_compute(&averaged, policy)?;
                Ok((acc + contribution)?)
            },
        )?;

        Ok(policy.cast_to_storage(&projected)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contraction::DenseContraction;
    use crate::core::OuterProductError;
    use candle_core::{DType, Device};
    use layers::LinearConfig;

    fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        Ok(a.to_dtype(DType::F32)?
            .sub(&b.to_dtype(DType::F32)?)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()?)
    }

    fn fixture(
        device: &Device,
        hidden: usize,
        output_dim: usize,
    ) -> Result<(Tensor, Tensor, Tensor, Linear)> {
        let (batch, seq, residues) = (2, 3, 4);
        let left = Tensor::randn(0f32, 1.0, (batch, seq, residues, hidden), device)?;
        let right = Tensor::randn(0f32, 1.0, (batch, seq, residues, hidden), device)?;
        let divisor = Tensor::full(seq as f32, (batch, residues, residues, 1), device)?;
        let weight = Tensor::randn(0f32, 0.1, (output_dim, hidden * hidden), device)?;
        let bias = Tensor::randn(0f32, 1.0, output_dim, device)?;
        let projection = Linear::new(
            LinearConfig::new(hidden * hidden, output_dim),
            weight,
            Some(bias),
        )?;
        Ok((left, right, divisor, projection))
    }

    #[test]
    fn ranges_cover_hidden_axis_once() {
        let collect = |h, c| chunk_ranges(h, c).collect::<Vec<_>>();
        assert_eq!(collect(8, 4), vec![0..4, 4..8]);
        assert_eq!(collect(8, 3), vec![0..3, 3..6, 6..8]);
        assert_eq!(collect(5, 5), vec![0..5]);
        assert_eq!(collect(3, 1), vec![0..1, 1..2, 2..3]);
    }

    #[test]
    fn every_chunk_size_matches_dense() -> Result<()> {
        let device = Device::Cpu;
        let hidden = 6;
        let (left, right, divisor, projection) = fixture(&device, hidden, 5)?;
        let inputs = ContractionInputs::new(&left, &right, &divisor)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let dense = DenseContraction.contract(&inputs, &projection, &policy)?;

        // 4 and 5 leave a shorter trailing chunk.
        for chunk in 1..=hidden {
            let chunked = ChunkedContraction::new(chunk).contract(&inputs, &projection, &policy)?;
            assert_eq!(chunked.dims(), dense.dims());
            let diff = max_diff(&chunked, &dense)?;
            assert!(diff < 1e-4, "chunk {} diverged by {}", chunk, diff);
        }
        Ok(())
    }

    #[test]
    fn bias_is_added_once() -> Result<()> {
        let device = Device::Cpu;
        let hidden = 4;
        let (_, _, divisor, projection) = fixture(&device, hidden, 3)?;
        // Zero projections leave only the bias in the output.
        let zeros = Tensor::zeros((2, 3, 4, hidden), DType::F32, &device)?;
        let inputs = ContractionInputs::new(&zeros, &zeros, &divisor)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);

        let chunked = ChunkedContraction::new(1).contract(&inputs, &projection, &policy)?;
        let bias = projection
            .bias()
            .expect("fixture has a bias")
            .broadcast_as(chunked.shape())?;
        assert!(max_diff(&chunked, &bias)? < 1e-6);
        Ok(())
    }

    #[test]
    fn bias_free_projection_starts_from_zero() -> Result<()> {
        let device = Device::Cpu;
        let hidden = 3;
        let (left, right, divisor, with_bias) = fixture(&device, hidden, 2)?;
        let projection = Linear::new(
            LinearConfig::without_bias(hidden * hidden, 2),
            with_bias.weight().clone(),
            None,
        )?;
        let inputs = ContractionInputs::new(&left, &right, &divisor)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let dense = DenseContraction.contract(&inputs, &projection, &policy)?;
        let chunked = ChunkedContraction::new(2).contract(&inputs, &projection, &policy)?;
        assert!(max_diff(&chunked, &dense)? < 1e-4);
        Ok(())
    }

    #[test]
    fn oversized_or_zero_chunks_fail_fast() -> Result<()> {
        let device = Device::Cpu;
        let (left, right, divisor, projection) = fixture(&device, 4, 2)?;
        let inputs = ContractionInputs::new(&left, &right, &divisor)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        for chunk in [0, 5] {
            let err = ChunkedContraction::new(chunk)
                .contract(&inputs, &projection, &policy)
                .unwrap_err();
            assert!(matches!(
                err,
                OuterProductError::InvalidChunkSize { hidden_dim: 4, .. }
            ));
        }
        Ok(())
    }

    #[test]
    fn half_precision_chunks_track_dense() -> Result<()> {
        let device = Device::Cpu;
        let (left, right, divisor, projection) = fixture(&device, 4, 3)?;
        let dtype = DType::BF16;
        let left = left.to_dtype(dtype)?;
        let right = right.to_dtype(dtype)?;
        let projection = Linear::new(
            projection.config().clone(),
            projection.weight().to_dtype(dtype)?,
            projection.bias().map(|b| b.to_dtype(dtype)).transpose()?,
        )?;
        let inputs = ContractionInputs::new(&left, &right, &divisor)?;
        let policy = PrecisionPolicy::from_parameter_dtype(dtype);

        let dense = DenseContraction.contract(&inputs, &projection, &policy)?;
        let chunked = ChunkedContraction::new(2).contract(&inputs, &projection, &policy)?;
        assert_eq!(chunked.dtype(), dtype);
        let tol = 4.0 * policy.epsilons().storage;
        let scale = dense.to_dtype(DType::F32)?.abs()?.max_all()?.to_vec0::<f32>()?.max(1.0);
        assert!(max_diff(&chunked, &dense)? <= tol * scale);
        Ok(())
    }
}
