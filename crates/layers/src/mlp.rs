//! Position-wise feed-forward block.
//!
//! Operates on hidden states shaped `(batch, seq, hidden)`: expand to
//! `intermediate_size`, apply the activation and dropout, then contract back to
//! the model hidden size.

use candle_core::{DType, Device, Error, Result, Tensor, Var};
use rand::Rng;

use crate::{
    activations::ActivationKind,
    context::ForwardContext,
    dropout::Dropout,
    dtypes::PrecisionPolicy,
    init::TruncatedNormal,
    linear::{Linear, LinearConfig},
};

/// Configuration shared by transformer feed-forward networks.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedForwardConfig {
    /// Model hidden size.
    pub hidden_size: usize,
    /// Width of the activation space.
    pub intermediate_size: usize,
    /// Activation applied between projections.
    pub activation: ActivationKind,
    /// Dropout applied to the activated expansion.
    pub dropout_p: f32,
}

impl FeedForwardConfig {
    /// Sizes the intermediate layer as `floor(hidden_size * ratio)`.
    pub fn with_expansion_ratio(hidden_size: usize, ratio: f32, activation: ActivationKind) -> Self {
        Self {
            hidden_size,
            intermediate_size: (hidden_size as f32 * ratio) as usize,
            activation,
            dropout_p: 0.0,
        }
    }
}

/// Two-projection MLP: `linear2(dropout(act(linear1(x))))`.
#[derive(Debug, Clone)]
pub struct FeedForward {
    config: FeedForwardConfig,
    linear1: Linear,
    dropout: Dropout,
    linear2: Linear,
}

impl FeedForward {
    pub fn with_init<R: Rng + ?Sized>(
        config: FeedForwardConfig,
        init: &TruncatedNormal,
        rng: &mut R,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        if config.intermediate_size == 0 {
            return Err(Error::Msg(
                "feed-forward intermediate size must be greater than zero".into(),
            ));
        }
        let linear1 = Linear::with_init(
            LinearConfig::new(config.hidden_size, config.intermediate_size),
            init,
            rng,
            device,
            dtype,
        )?;
        let linear2 = Linear::with_init(
            LinearConfig::new(config.intermediate_size, config.hidden_size),
            init,
            rng,
            device,
            dtype,
        )?;
        let dropout = Dropout::new(config.dropout_p)?;
        Ok(Self {
            config,
            linear1,
            dropout,
            linear2,
        })
    }

    pub fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    /// Expansion and contraction projections, in that order.
    pub fn linears(&self) -> [&Linear; 2] {
        [&self.linear1, &self.linear2]
    }

    pub fn vars(&self) -> Vec<Var> {
        let mut vars = self.linear1.vars();
        vars.extend(self.linear2.vars());
        vars
    }

    pub fn forward(
        &self,
        hidden: &Tensor,
        policy: &PrecisionPolicy,
        ctx: &mut ForwardContext,
    ) -> Result<Tensor> {
        let expanded = self.linear1.forward(hidden, policy)?;
        let activated = self.config.activation.forward(&expanded, policy)?;
        let dropped = self.dropout.forward(&activated, ctx)?;
        self.linear2.forward(&dropped, policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn preserves_layout_and_sizes_intermediate() -> Result<()> {
        let device = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(5);
        let config = FeedForwardConfig::with_expansion_ratio(16, 2.5, ActivationKind::Gelu);
        assert_eq!(config.intermediate_size, 40);
        let mlp = FeedForward::with_init(
            config,
            &TruncatedNormal::new(0.02),
            &mut rng,
            &device,
            DType::F32,
        )?;
        let input = Tensor::randn(0f32, 1.0, (2, 3, 16), &device)?;
        let out = mlp.forward(&input, &PrecisionPolicy::default(), &mut ForwardContext::eval())?;
        assert_eq!(out.dims(), &[2, 3, 16]);
        assert_eq!(mlp.vars().len(), 4);
        Ok(())
    }

    #[test]
    fn zero_intermediate_is_rejected() {
        let mut rng = StdRng::seed_from_u64(0);
        let config = FeedForwardConfig::with_expansion_ratio(4, 0.1, ActivationKind::Gelu);
        let result = FeedForward::with_init(
            config,
            &TruncatedNormal::new(0.02),
            &mut rng,
            &Device::Cpu,
            DType::F32,
        );
        assert!(result.is_err());
    }
}
