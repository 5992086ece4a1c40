//! The assembled outer-product mean layer.
//!
//! `m` is normalised, projected twice to the hidden width, masked, contracted
//! into pair features, and projected to the output width:
//!
//! ```text
//! m ─ norm ─┬─ proj_a ─ ⊙ mask ─┐
//!           └─ proj_b ─ ⊙ mask ─┴─ contraction (dense | chunked) ─ proj_o ─ out
//! ```

use std::fmt;
use std::sync::OnceLock;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use layers::{
    checks, LayerNorm, Linear, LinearConfig, LinearInit, LinearLayer, NormConfig,
    NormalizationLayer, PrecisionPolicy,
};

use crate::contraction::{
    select_strategy, ContractionInputs, ContractionStrategy, DenseContraction,
};
use crate::core::{validate_chunk_size, OuterProductConfig, OuterProductError, PairAggregator, Result};
use crate::masks::PairMask;

const FEATURE_DTYPES: &[DType] = &[DType::F16, DType::BF16, DType::F32, DType::F64];

/// Outer-product mean over the sequence axis.
pub struct OuterProductMean {
    config: OuterProductConfig,
    norm: LayerNorm,
    proj_a: Linear,
    proj_b: Linear,
    proj_o: Linear,
    first_call: OnceLock<()>,
}

impl fmt::Debug for OuterProductMean {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OuterProductMean")
            .field("input_dim", &self.config.input_dim)
            .field("hidden_dim", &self.config.hidden_dim)
            .field("output_dim", &self.config.output_dim)
            .field("chunk_size", &self.config.chunk_size)
            .finish()
    }
}

impl OuterProductMean {
    /// Builds fresh parameters.
    ///
    /// The norm starts as the identity affine map, the hidden projections use
    /// the default affine init, and the output projection starts at zero so a
    /// freshly built layer contributes nothing to a residual stream.
    pub fn new(config: OuterProductConfig, device: &Device, dtype: DType) -> Result<Self> {
        config.validate()?;
        let norm = LayerNorm::identity_affine(norm_config(&config), dtype, device)?;
        let hidden = LinearConfig::without_bias(config.input_dim, config.hidden_dim);
        let proj_a = Linear::with_init(hidden.clone(), &LinearInit::default_affine(), device, dtype)?;
        let proj_b = Linear::with_init(hidden, &LinearInit::default_affine(), device, dtype)?;
        let proj_o = Linear::with_init(
            LinearConfig::new(config.pair_dim(), config.output_dim),
            &LinearInit::Zeros,
            device,
            dtype,
        )?;
        Self::from_parts(config, norm, proj_a, proj_b, proj_o)
    }

    /// Restores parameters named `norm.{weight,bias}`, `proj_a.weight`,
    /// `proj_b.weight` and `proj_o.{weight,bias}` under `vb`.
    pub fn load(vb: VarBuilder, config: OuterProductConfig) -> Result<Self> {
        config.validate()?;
        let (input, hidden, pair, output) = (
            config.input_dim,
            config.hidden_dim,
            config.pair_dim(),
            config.output_dim,
        );

        let norm_vb = vb.pp("norm");
        let norm = LayerNorm::new(
            norm_vb.get(input, "weight")?,
            norm_vb.get(input, "bias")?,
            norm_config(&config),
        )?;
        let proj_a = Linear::new(
            LinearConfig::without_bias(input, hidden),
            vb.pp("proj_a").get((hidden, input), "weight")?,
            None,
        )?;
        let proj_b = Linear::new(
            LinearConfig::without_bias(input, hidden),
            vb.pp("proj_b").get((hidden, input), "weight")?,
            None,
        )?;
        let out_vb = vb.pp("proj_o");
        let proj_o = Linear::new(
            LinearConfig::new(pair, output),
            out_vb.get((output, pair), "weight")?,
            Some(out_vb.get(output, "bias")?),
        )?;
        Self::from_parts(config, norm, proj_a, proj_b, proj_o)
    }

    /// Assembles the layer from existing sublayers, checking their widths
    /// against `config`.
    pub fn from_parts(
        config: OuterProductConfig,
        norm: LayerNorm,
        proj_a: Linear,
        proj_b: Linear,
        proj_o: Linear,
    ) -> Result<Self> {
        config.validate()?;
        let mut mismatches = Vec::new();
        if norm.config().hidden_size != config.input_dim {
            mismatches.push(format!(
                "norm width {} != input_dim {}",
                norm.config().hidden_size,
                config.input_dim
            ));
        }
        for (name, proj) in [("proj_a", &proj_a), ("proj_b", &proj_b)] {
            let LinearConfig {
                input_dim,
                output_dim,
                ..
            } = *proj.config();
            if (input_dim, output_dim) != (config.input_dim, config.hidden_dim) {
                mismatches.push(format!(
                    "{name} maps {input_dim} -> {output_dim}, expected {} -> {}",
                    config.input_dim, config.hidden_dim
                ));
            }
        }
        let out = proj_o.config();
        if (out.input_dim, out.output_dim) != (config.pair_dim(), config.output_dim) {
            mismatches.push(format!(
                "proj_o maps {} -> {}, expected {} -> {}",
                out.input_dim,
                out.output_dim,
                config.pair_dim(),
                config.output_dim
            ));
        }
        if !mismatches.is_empty() {
            return Err(OuterProductError::InvalidConfig(mismatches.join("; ")));
        }

        Ok(Self {
            config,
            norm,
            proj_a,
            proj_b,
            proj_o,
            first_call: OnceLock::new(),
        })
    }

    pub fn config(&self) -> &OuterProductConfig {
        &self.config
    }

    pub fn norm(&self) -> &LayerNorm {
        &self.norm
    }

    pub fn proj_a(&self) -> &Linear {
        &self.proj_a
    }

    pub fn proj_b(&self) -> &Linear {
        &self.proj_b
    }

    pub fn proj_o(&self) -> &Linear {
        &self.proj_o
    }

    /// Runs the layer with an explicit chunk size instead of the configured one.
    ///
    /// `chunk_size` is validated against `hidden_dim` before any work, even
    /// when `training` is set; training then ignores it and contracts densely.
    pub fn forward_with_chunk_size(
        &self,
        m: &Tensor,
        mask: &Tensor,
        training: bool,
        chunk_size: Option<usize>,
    ) -> Result<Tensor> {
        if let Some(chunk_size) = chunk_size {
            validate_chunk_size(chunk_size, self.config.hidden_dim)?;
        }
        let policy = self.policy_for(m)?;
        self.log_first_call(m, &policy, chunk_size);

        let (left, right, pair_mask) = self.project(m, mask, &policy)?;
        let strategy = select_strategy(chunk_size, training);
        log::debug!(
            "outer_product_mean strategy={} training={} chunk_size={:?}",
            strategy.name(),
            training,
            chunk_size
        );
        let inputs = ContractionInputs::new(&left, &right, pair_mask.divisor())?;
        strategy.contract(&inputs, &self.proj_o, &policy)
    }

    /// Averaged pair features `[batch, residue, residue, hidden * hidden]`
    /// before the output projection, in the dtype of `m`.
    pub fn aggregate(&self, m: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let policy = self.policy_for(m)?;
        let (left, right, pair_mask) = self.project(m, mask, &policy)?;
        let inputs = ContractionInputs::new(&left, &right, pair_mask.divisor())?;
        DenseContraction.average(&inputs, &policy)
    }

    fn policy_for(&self, m: &Tensor) -> Result<PrecisionPolicy> {
        let dtype = m.dtype();
        if !FEATURE_DTYPES.contains(&dtype) {
            return Err(OuterProductError::UnsupportedDType {
                requested: format!("{dtype:?}"),
            });
        }
        Ok(PrecisionPolicy::from_parameter_dtype(dtype))
    }

    /// Normalised, projected and masked `(left, right)` plus the pair mask.
    fn project(
        &self,
        m: &Tensor,
        mask: &Tensor,
        policy: &PrecisionPolicy,
    ) -> Result<(Tensor, Tensor, PairMask)> {
        checks::expect_rank("m", m, 4).map_err(|err| OuterProductError::shape(err.to_string()))?;
        checks::expect_last_dim("m", m, self.config.input_dim)
            .map_err(|err| OuterProductError::shape(err.to_string()))?;
        let pair_mask = PairMask::new(mask, m, policy)?;

        let normed = self.norm.forward(m, policy)?;
        let left = self
            .proj_a
            .forward(&normed, policy)?
            .broadcast_mul(pair_mask.sequence())?;
        let right = self
            .proj_b
            .forward(&normed, policy)?
            .broadcast_mul(pair_mask.sequence())?;
        Ok((left, right, pair_mask))
    }

    fn log_first_call(&self, m: &Tensor, policy: &PrecisionPolicy, chunk_size: Option<usize>) {
        if self.first_call.set(()).is_ok() {
            log::info!(
                "outer_product_mean init input_dim={} hidden_dim={} output_dim={} chunk_size={:?} dtype={:?} mixed_precision={} device={:?}",
                self.config.input_dim,
                self.config.hidden_dim,
                self.config.output_dim,
                chunk_size,
                m.dtype(),
                policy.is_mixed_precision(),
                m.device().location()
            );
        }
    }
}

impl PairAggregator for OuterProductMean {
    /// Uses the configured chunk size; see [`OuterProductMean::forward_with_chunk_size`].
    fn forward(&self, m: &Tensor, mask: &Tensor, training: bool) -> Result<Tensor> {
        self.forward_with_chunk_size(m, mask, training, self.config.chunk_size)
    }
}

fn norm_config(config: &OuterProductConfig) -> NormConfig {
    let mut norm = NormConfig::new(config.input_dim);
    norm.epsilon = config.norm_epsilon;
    norm
}
