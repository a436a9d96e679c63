//! Activation used by the encoder feed-forward stack.

use candle_core::{Result, Tensor};

use crate::dtypes::PrecisionPolicy;

/// Non-linearity applied inside [`FeedForward`](crate::mlp::FeedForward).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivationKind {
    /// Exact erf form `0.5 * x * (1 + erf(x / sqrt(2)))`.
    #[default]
    Gelu,
}

impl ActivationKind {
    /// Evaluates in the compute dtype and returns the storage dtype.
    pub fn forward(self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        match self {
            ActivationKind::Gelu => {
                let compute = policy.cast_for_matmul(input)?;
                policy.cast_to_storage(&compute.gelu_erf()?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use std::f64::consts::SQRT_2;

    #[test]
    fn gelu_matches_erf_formula() -> Result<()> {
        let input = Tensor::from_slice(&[-2.5f32, -0.5, 0.0, 1.0, 3.0], (5,), &Device::Cpu)?;
        let output = ActivationKind::Gelu.forward(&input, &PrecisionPolicy::default())?;

        let half_x = input.affine(0.5, 0.0)?;
        let expected = half_x.mul(&input.affine(1.0 / SQRT_2, 0.0)?.erf()?.affine(1.0, 1.0)?)?;
        let diff = output.sub(&expected)?.abs()?.max(0)?.to_vec0::<f32>()?;
        assert!(diff < 5e-6);
        Ok(())
    }

    #[test]
    fn half_precision_input_keeps_its_dtype() -> Result<()> {
        let policy = PrecisionPolicy::from_parameter_dtype(DType::BF16);
        let input = Tensor::from_slice(&[-1f32, 0.0, 2.0], (3,), &Device::Cpu)?.to_dtype(DType::BF16)?;
        let output = ActivationKind::Gelu.forward(&input, &policy)?;
        assert_eq!(output.dtype(), DType::BF16);
        Ok(())
    }
}
