//! Dense affine projections.
//!
//! Linear layers accept inputs shaped `(batch, seq, in_dim)` or `(rows, in_dim)`
//! and return the same leading layout with `out_dim` features. Weights are
//! stored as `(out_dim, in_dim)` candle `Var`s so an external optimiser can
//! update them in place. Matmuls run in [`PrecisionPolicy::compute`] and the
//! result is cast back with [`PrecisionPolicy::cast_to_storage`].

use candle_core::{DType, Device, Error, Result, Tensor, Var};
use rand::Rng;

use crate::{checks, dtypes::PrecisionPolicy, init::TruncatedNormal};

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
    /// Creates a configuration for a projection layer with bias.
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: true,
        }
    }

    /// Same as [`LinearConfig::new`] with an explicit bias choice.
    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }
}

/// Dense affine projection with optional bias.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Var,
    bias: Option<Var>,
}

impl Linear {
    /// Constructs a linear layer from pre-existing parameters.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        Self::validate_weight(&config, &weight)?;
        Self::validate_bias(&config, bias.as_ref())?;
        Ok(Self {
            config,
            weight: Var::from_tensor(&weight)?,
            bias: bias.as_ref().map(Var::from_tensor).transpose()?,
        })
    }

    /// Builds a linear layer with truncated-normal weights and zero bias.
    pub fn with_init<R: Rng + ?Sized>(
        config: LinearConfig,
        init: &TruncatedNormal,
        rng: &mut R,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let weight = init.tensor((config.output_dim, config.input_dim), rng, device, dtype)?;
        let bias = if config.bias {
            Some(Tensor::zeros(config.output_dim, dtype, device)?)
        } else {
            None
        };
        Self::new(config, weight, bias)
    }

    pub fn config(&self) -> &LinearConfig {
        &self.config
    }

    /// The `(out_dim, in_dim)` weight parameter.
    pub fn weight(&self) -> &Var {
        &self.weight
    }

    /// The bias parameter, if the layer has one.
    pub fn bias(&self) -> Option<&Var> {
        self.bias.as_ref()
    }

    /// All learnable parameters of the layer.
    pub fn vars(&self) -> Vec<Var> {
        let mut vars = vec![self.weight.clone()];
        vars.extend(self.bias.iter().cloned());
        vars
    }

    fn validate_weight(config: &LinearConfig, weight: &Tensor) -> Result<()> {
        checks::expect_rank("linear.weight", weight, 2)?;
        checks::expect_shape(
            "linear.weight",
            weight,
            &[config.output_dim, config.input_dim],
        )?;
        checks::expect_dtype_in(
            "linear.weight",
            weight,
            &[DType::F16, DType::BF16, DType::F32, DType::F64],
        )
    }

    fn validate_bias(config: &LinearConfig, bias: Option<&Tensor>) -> Result<()> {
        match (config.bias, bias) {
            (true, Some(tensor)) => {
                checks::expect_shape("linear.bias", tensor, &[config.output_dim])?;
                checks::expect_dtype_in(
                    "linear.bias",
                    tensor,
                    &[DType::F16, DType::BF16, DType::F32, DType::F64],
                )
            }
            (false, Some(_)) => Err(Error::Msg("bias provided but config disables bias".into())),
            (true, None) => Err(Error::Msg("config expects bias but none supplied".into())),
            (false, None) => Ok(()),
        }
    }

    fn validate_input(&self, hidden: &Tensor) -> Result<()> {
        match hidden.dims() {
            [batch, seq, _] => {
                checks::expect_batch_seq_hidden("linear.input", hidden, self.config.input_dim)?;
                if *batch == 0 || *seq == 0 {
                    return Err(Error::Msg("batch/seq dimensions must be non-zero".into()));
                }
                Ok(())
            }
            [_, hidden_dim] if *hidden_dim == self.config.input_dim => Ok(()),
            [_, hidden_dim] => Err(Error::Msg(format!(
                "expected last dim {} but received {}",
                self.config.input_dim, hidden_dim
            ))),
            dims => Err(Error::Msg(format!(
                "linear expects input shaped [B, T, H_in] or [T, H_in], got {:?}",
                dims
            ))),
        }
    }

    /// Applies the projection, promoting to the compute dtype for the matmul.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        self.validate_input(hidden)?;

        let input = policy.cast_for_matmul(hidden)?;
        let weight_t = policy.cast_for_matmul(self.weight.as_tensor())?.t()?;

        let mut output = match *input.dims() {
            [batch, seq, _] => {
                let flat = input.reshape((batch * seq, self.config.input_dim))?;
                flat.matmul(&weight_t)?
                    .reshape((batch, seq, self.config.output_dim))?
            }
            _ => input.matmul(&weight_t)?,
        };

        if let Some(bias) = &self.bias {
            let bias = policy.cast_for_matmul(bias.as_tensor())?;
            output = output.broadcast_add(&bias)?;
        }

        policy.cast_to_storage(&output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn reference_linear(input: &Tensor, weight: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
        let weight_t = weight.t()?;
        let mut out = match input.dims() {
            [batch, seq, hidden] => input
                .reshape((*batch * *seq, *hidden))?
                .matmul(&weight_t)?
                .reshape((*batch, *seq, weight.dims()[0]))?,
            _ => input.matmul(&weight_t)?,
        };
        if let Some(bias) = bias {
            out = out.broadcast_add(bias)?;
        }
        Ok(out)
    }

    #[test]
    fn forward_matches_reference_for_rank_two_and_three() -> Result<()> {
        let device = Device::Cpu;
        let config = LinearConfig::new(8, 4);
        let weight = Tensor::randn(0f32, 0.05, (4, 8), &device)?;
        let bias = Tensor::randn(0f32, 0.02, 4, &device)?;
        let linear = Linear::new(config, weight.clone(), Some(bias.clone()))?;
        let policy = PrecisionPolicy::default();

        for input in [
            Tensor::randn(0f32, 1.0, (2, 5, 8), &device)?,
            Tensor::randn(0f32, 1.0, (3, 8), &device)?,
        ] {
            let output = linear.forward(&input, &policy)?;
            let reference = reference_linear(&input, &weight, Some(&bias))?;
            assert_eq!(output.dims(), reference.dims());
            let max = output
                .sub(&reference)?
                .abs()?
                .flatten_all()?
                .max(0)?
                .to_vec0::<f32>()?;
            assert!(max < 1e-5, "max diff {max}");
        }
        Ok(())
    }

    #[test]
    fn rejects_wrong_input_width() -> Result<()> {
        let device = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(1);
        let linear = Linear::with_init(
            LinearConfig::new(8, 4),
            &TruncatedNormal::new(0.02),
            &mut rng,
            &device,
            DType::F32,
        )?;
        let input = Tensor::zeros((1, 2, 7), DType::F32, &device)?;
        assert!(linear.forward(&input, &PrecisionPolicy::default()).is_err());
        Ok(())
    }

    #[test]
    fn bias_configuration_must_match_parameters() -> Result<()> {
        let device = Device::Cpu;
        let weight = Tensor::zeros((2, 2), DType::F32, &device)?;
        let err = Linear::new(LinearConfig::new(2, 2), weight.clone(), None).unwrap_err();
        assert!(err.to_string().contains("expects bias"));
        let linear = Linear::new(LinearConfig::new(2, 2).with_bias(false), weight, None)?;
        assert_eq!(linear.vars().len(), 1);
        Ok(())
    }
}
