//! Layer normalisation over the hidden axis.
//!
//! Inputs follow the `(batch, seq, hidden)` convention; rank-2 `(rows, hidden)`
//! inputs are also accepted. Statistics are computed in
//! [`PrecisionPolicy::reduction`] before the affine parameters are applied.

use candle_core::{DType, Device, Result, Tensor, Var, D};

use crate::{checks, dtypes::PrecisionPolicy};

/// Configuration for [`LayerNorm`].
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    /// Size of the hidden dimension being normalised.
    pub hidden_size: usize,
    /// Numeric stabiliser added to the variance.
    pub epsilon: f64,
}

impl NormConfig {
    /// Creates a configuration using the usual `1e-5` epsilon.
    pub fn new(hidden_size: usize) -> Self {
        Self {
            hidden_size,
            epsilon: 1e-5,
        }
    }
}

/// Standard LayerNorm with learnable scale and bias.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    config: NormConfig,
    weight: Var,
    bias: Var,
}

impl LayerNorm {
    /// Constructs a LayerNorm from explicit scale and bias parameters.
    pub fn new(weight: Tensor, bias: Tensor, config: NormConfig) -> Result<Self> {
        for (name, tensor) in [("norm.weight", &weight), ("norm.bias", &bias)] {
            checks::expect_shape(name, tensor, &[config.hidden_size])?;
            checks::expect_dtype_in(name, tensor, &[DType::F16, DType::BF16, DType::F32, DType::F64])?;
        }
        Ok(Self {
            config,
            weight: Var::from_tensor(&weight)?,
            bias: Var::from_tensor(&bias)?,
        })
    }

    /// Unit scale, zero bias.
    pub fn identity(config: NormConfig, dtype: DType, device: &Device) -> Result<Self> {
        let weight = Tensor::ones(config.hidden_size, dtype, device)?;
        let bias = Tensor::zeros(config.hidden_size, dtype, device)?;
        Self::new(weight, bias, config)
    }

    pub fn config(&self) -> &NormConfig {
        &self.config
    }

    pub fn weight(&self) -> &Var {
        &self.weight
    }

    pub fn bias(&self) -> &Var {
        &self.bias
    }

    pub fn vars(&self) -> Vec<Var> {
        vec![self.weight.clone(), self.bias.clone()]
    }

    /// Normalises `hidden` along its last axis.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        if hidden.rank() == 3 {
            checks::expect_batch_seq_hidden("norm.input", hidden, self.config.hidden_size)?;
        } else {
            checks::expect_rank("norm.input", hidden, 2)?;
        }

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
        let weight = self.weight.as_tensor().to_dtype(normalized.dtype())?;
        let bias = self.bias.as_tensor().to_dtype(normalized.dtype())?;
        let normalized = normalized.broadcast_mul(&weight)?.broadcast_add(&bias)?;

        policy.cast_to_storage(&normalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_have_zero_mean_unit_variance() -> Result<()> {
        let device = Device::Cpu;
        let norm = LayerNorm::identity(NormConfig::new(4), DType::F32, &device)?;
        let input = Tensor::from_vec(
            vec![1f32, 2.0, 3.0, 4.0, -2.0, 0.0, 2.0, 8.0],
            (1, 2, 4),
            &device,
        )?;
        let out = norm.forward(&input, &PrecisionPolicy::default())?;
        for row in out.squeeze(0)?.to_vec2::<f32>()? {
            let mean = row.iter().sum::<f32>() / 4.0;
            let var = row.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 4.0;
            assert!(mean.abs() < 1e-5);
            assert!((var - 1.0).abs() < 1e-3);
        }
        Ok(())
    }

    #[test]
    fn affine_parameters_are_applied() -> Result<()> {
        let device = Device::Cpu;
        let norm = LayerNorm::new(
            Tensor::full(2f32, 2, &device)?,
            Tensor::full(0.5f32, 2, &device)?,
            NormConfig::new(2),
        )?;
        let input = Tensor::from_vec(vec![-1f32, 1.0], (1, 2), &device)?;
        let out = norm.forward(&input, &PrecisionPolicy::default())?.to_vec2::<f32>()?;
        assert!((out[0][0] + 1.5).abs() < 1e-3);
        assert!((out[0][1] - 2.5).abs() < 1e-3);
        Ok(())
    }

    #[test]
    fn mismatched_hidden_size_errors() -> Result<()> {
        let device = Device::Cpu;
        let norm = LayerNorm::identity(NormConfig::new(4), DType::F32, &device)?;
        let input = Tensor::zeros((1, 2, 3), DType::F32, &device)?;
        assert!(norm.forward(&input, &PrecisionPolicy::default()).is_err());
        Ok(())
    }
}
