//! Feature-wise normalisation with unified shape and dtype handling.
//!
//! Normalisation happens along the last axis while preserving the original
//! layout, so `(batch, seq, residue, channel)` tensors normalise per
//! `(batch, seq, residue)` row. Statistics (mean, variance) are computed in
//! [`PrecisionPolicy::reduction`] before the affine parameters are applied in
//! [`PrecisionPolicy::compute`] and the output is cast back to storage.

use candle_core::{DType, Device, Error, Result, Tensor, D};

use crate::{checks, dtypes::PrecisionPolicy};

const PARAM_DTYPES: &[DType] = &[DType::F16, DType::BF16, DType::F32, DType::F64];

/// Configuration for a normalisation layer.
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    /// Size of the feature dimension being normalised.
    pub hidden_size: usize,
    /// Numeric stabiliser added to the variance.
    pub epsilon: f64,
    /// Whether post-normalisation affine parameters are applied.
    pub elementwise_affine: bool,
}

impl NormConfig {
    /// Creates a configuration with the usual `1e-5` stabiliser.
    pub fn new(hidden_size: usize) -> Self {
        Self {
            hidden_size,
            epsilon: 1e-5,
            elementwise_affine: true,
        }
    }
}

/// Shared interface for normalisation layers.
pub trait NormalizationLayer: Send + Sync {
    /// Returns the configuration so callers can check shape compatibility.
    fn config(&self) -> &NormConfig;

    /// Applies the normalisation to a feature tensor.
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

/// LayerNorm with optional learned scale and shift.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    config: NormConfig,
    weight: Option<Tensor>,
    bias: Option<Tensor>,
}

impl LayerNorm {
    /// Constructs a LayerNorm with learnable scale and shift parameters.
    pub fn new(weight: Tensor, bias: Tensor, mut config: NormConfig) -> Result<Self> {
        config.elementwise_affine = true;
        Self::validate_param("norm.weight", &weight, &config)?;
        Self::validate_param("norm.bias", &bias, &config)?;
        Ok(Self {
            config,
            weight: Some(weight),
            bias: Some(bias),
        })
    }

    /// Constructs a LayerNorm with scale one and shift zero.
    pub fn identity_affine(config: NormConfig, dtype: DType, device: &Device) -> Result<Self> {
        let weight = Tensor::ones(config.hidden_size, dtype, device)?;
        let bias = Tensor::zeros(config.hidden_size, dtype, device)?;
        Self::new(weight, bias, config)
    }

    /// Constructs a LayerNorm without affine parameters.
    pub fn without_affine(mut config: NormConfig) -> Self {
        config.elementwise_affine = false;
        Self {
            config,
            weight: None,
            bias: None,
        }
    }

    /// Learned scale, if any.
    pub fn weight(&self) -> Option<&Tensor> {
        self.weight.as_ref()
    }

    /// Learned shift, if any.
    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    fn validate_param(name: &str, param: &Tensor, config: &NormConfig) -> Result<()> {
        checks::expect_shape(name, param, &[config.hidden_size])?;
        checks::expect_dtype_in(name, param, PARAM_DTYPES)?;
        checks::expect_contiguous(name, param)?;
        Ok(())
    }
}

impl NormalizationLayer for LayerNorm {
    fn config(&self) -> &NormConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        if hidden.rank() == 0 {
            return Err(Error::Msg("layer norm expects input shaped [..., H]".into()));
        }
        checks::expect_last_dim("norm.input", hidden, self.config.hidden_size)?;

        let hidden_size = self.config.hidden_size as f64;
        let compute = policy.cast_for_reduction(hidden)?;
        let mean = (compute.sum_keepdim(D::Minus1)? / hidden_size)?;
        let centered = compute.broadcast_sub(&mean)?;
        let variance = (centered.sqr()?.sum_keepdim(D::Minus1)? / hidden_size)?;
        let denom = (variance + self.config.epsilon)?.sqrt()?;
        let mut normalized = centered.broadcast_div(&denom)?;

        if normalized.dtype() != policy.compute() {
            normalized = normalized.to_dtype(policy.compute())?;
        }
        if let Some(weight) = &self.weight {
            let weight = weight.to_dtype(normalized.dtype())?;
            normalized = normalized.broadcast_mul(&weight)?;
        }
        if let Some(bias) = &self.bias {
            let bias = bias.to_dtype(normalized.dtype())?;
            normalized = normalized.broadcast_add(&bias)?;
        }

        policy.cast_to_storage(&normalized)
    }
}
