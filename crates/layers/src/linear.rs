//! Linear and affine projection helpers.
//!
//! Linear layers act on the last axis: inputs shaped `(..., in_dim)` return
//! tensors shaped `(..., out_dim)`, with every leading axis preserved. Weights
//! follow the `(out_dim, in_dim)` layout so checkpoints exported from other
//! frameworks load without transposition. We consistently cast weights and
//! activations to [`PrecisionPolicy::compute`] for matmuls and rely on
//! [`PrecisionPolicy::cast_to_storage`](crate::dtypes::PrecisionPolicy::cast_to_storage)
//! for the final dtype.
//!
//! Parameters are immutable once constructed. Cloning a [`Linear`] clones
//! reference-counted tensor handles, so a layer can be shared across threads
//! without locking.

use candle_core::{DType, Device, Error, Result, Tensor};

use crate::{checks, dtypes::PrecisionPolicy};

const PARAM_DTYPES: &[DType] = &[DType::F16, DType::BF16, DType::F32, DType::F64];

/// Configuration shared by dense projection layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    /// Incoming feature dimension.
    pub input_dim: usize,
    /// Output feature dimension.
    pub output_dim: usize,
    /// Whether a learnable bias vector should be applied.
    pub bias: bool,
}

impl LinearConfig {
    /// Creates a configuration for a projection with bias.
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: true,
        }
    }

    /// Creates a configuration for a bias-free projection.
    pub fn without_bias(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: false,
        }
    }
}

/// Shared interface for affine projections.
pub trait LinearLayer: Send + Sync {
    /// Returns the static configuration used to validate inputs.
    fn config(&self) -> &LinearConfig;

    /// Applies the linear projection, promoting to the compute dtype when needed.
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

/// Supported weight initialisation policies.
#[derive(Debug, Clone)]
pub enum LinearInit {
    /// Xavier/Glorot uniform initialisation.
    XavierUniform,
    /// Kaiming/He uniform initialisation.
    ///
    /// `negative_slope = sqrt(5)` reproduces the customary default for affine
    /// layers (uniform in `±1/sqrt(fan_in)`).
    KaimingUniform { negative_slope: f64 },
    /// All-zero weights and bias, used for the last projection of a residual
    /// branch so the branch starts as an identity contribution.
    Zeros,
}

impl LinearInit {
    /// Default initialisation for hidden projections.
    pub fn default_affine() -> Self {
        Self::KaimingUniform {
            negative_slope: 5f64.sqrt(),
        }
    }

    fn sample(&self, shape: (usize, usize), device: &Device, dtype: DType) -> Result<Tensor> {
        let (out_dim, in_dim) = shape;
        let (fan_in, fan_out) = (in_dim as f64, out_dim as f64);
        let weight_f32 = match self {
            LinearInit::XavierUniform => {
                let bound = (6.0f64 / (fan_in + fan_out)).sqrt();
                Tensor::rand(-bound as f32, bound as f32, shape, device)?
            }
            LinearInit::KaimingUniform { negative_slope } => {
                let gain = (2.0f64 / (1.0 + negative_slope.powi(2))).sqrt();
                let bound = (3.0f64).sqrt() * gain / fan_in.sqrt();
                Tensor::rand(-bound as f32, bound as f32, shape, device)?
            }
            LinearInit::Zeros => Tensor::zeros(shape, DType::F32, device)?,
        };
        if dtype == DType::F32 {
            Ok(weight_f32)
        } else {
            weight_f32.to_dtype(dtype)
        }
    }
}

/// Dense affine projection with optional bias and mixed-precision aware forward pass.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Linear {
    /// Constructs a linear layer from pre-existing parameters.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        Self::validate_weight(&config, &weight)?;
        Self::validate_bias(&config, bias.as_ref())?;
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    /// Builds a linear layer with weights following `init`.
    ///
    /// The bias (when enabled) starts at zero for every policy.
    pub fn with_init(
        config: LinearConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let weight = init.sample((config.output_dim, config.input_dim), device, dtype)?;
        let bias = if config.bias {
            Some(Tensor::zeros(config.output_dim, dtype, device)?)
        } else {
            None
        };
        Self::new(config, weight, bias)
    }

    /// Weight tensor shaped `(output_dim, input_dim)`.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Bias tensor shaped `(output_dim,)`, if the layer has one.
    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// Restricts the projection to the input features `[start, start + len)`.
    ///
    /// The returned layer maps `(..., len)` to `(..., output_dim)` and carries
    /// no bias, so partial projections over disjoint input ranges can be summed
    /// and the bias added once by the caller.
    pub fn input_slice(&self, start: usize, len: usize) -> Result<Self> {
        if len == 0 || start + len > self.config.input_dim {
            return Err(Error::Msg(format!(
                "input slice [{start}, {}) out of range for input_dim {}",
                start + len,
                self.config.input_dim
            )));
        }
        let weight = self.weight.narrow(1, start, len)?.contiguous()?;
        Ok(Self {
            config: LinearConfig::without_bias(len, self.config.output_dim),
            weight,
            bias: None,
        })
    }

    /// Applies the projection and leaves the result in the compute dtype.
    ///
    /// Used when several partial projections are accumulated before a single
    /// cast back to storage precision.
    pub fn forward_compute(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        self.validate_input(hidden)?;

        let input = policy.cast_for_matmul(hidden)?;
        let weight_t = policy.cast_for_matmul(&self.weight)?.t()?;

        let dims = input.dims().to_vec();
        let rows: usize = dims[..dims.len() - 1].iter().product();
        let flat = input.reshape((rows, self.config.input_dim))?;
        let proj = flat.matmul(&weight_t)?;
        let mut out_dims = dims;
        if let Some(last) = out_dims.last_mut() {
            *last = self.config.output_dim;
        }
        let mut output = proj.reshape(out_dims)?;

        if let Some(bias) = &self.bias {
            let bias = policy.cast_for_matmul(bias)?;
            output = output.broadcast_add(&bias)?;
        }
        Ok(output)
    }

    fn validate_weight(config: &LinearConfig, weight: &Tensor) -> Result<()> {
        checks::expect_rank("linear.weight", weight, 2)?;
        checks::expect_shape(
            "linear.weight",
            weight,
            &[config.output_dim, config.input_dim],
        )?;
        checks::expect_dtype_in("linear.weight", weight, PARAM_DTYPES)?;
        checks::expect_contiguous("linear.weight", weight)?;
        Ok(())
    }

    fn validate_bias(config: &LinearConfig, bias: Option<&Tensor>) -> Result<()> {
        match (config.bias, bias) {
            (true, Some(tensor)) => {
                checks::expect_rank("linear.bias", tensor, 1)?;
                checks::expect_shape("linear.bias", tensor, &[config.output_dim])?;
                checks::expect_dtype_in("linear.bias", tensor, PARAM_DTYPES)?;
                checks::expect_contiguous("linear.bias", tensor)?;
                Ok(())
            }
            (false, Some(_)) => Err(Error::Msg("bias provided but config disables bias".into())),
            (true, None) => Err(Error::Msg("config expects bias but none supplied".into())),
            (false, None) => Ok(()),
        }
    }

    fn validate_input(&self, hidden: &Tensor) -> Result<()> {
        if hidden.rank() == 0 {
            return Err(Error::Msg("linear expects input shaped [..., H_in]".into()));
        }
        checks::expect_last_dim("linear.input", hidden, self.config.input_dim)
    }
}

impl LinearLayer for Linear {
    fn config(&self) -> &LinearConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let output = self.forward_compute(hidden, policy)?;
        policy.cast_to_storage(&output)
    }
}
