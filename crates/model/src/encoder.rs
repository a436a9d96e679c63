use std::fmt;

use attention::{AttentionConfig, RiemannianAttention};
use candle_core::{DType, Device, Error, Result, Tensor, Var};
use layers::{
    checks,
    dtypes::PrecisionPolicy,
    init::{LayerRole, TruncatedNormal},
    mlp::{FeedForward, FeedForwardConfig},
    norm::{LayerNorm, NormConfig},
    DropPath, Dropout, ForwardContext,
};
use rand::Rng;

/// Encoder layer: pre-normed attention residual, post-norm, then a
/// feed-forward residual.
///
/// ```text
/// x   = attn(pre_norm(src))
/// src = norm1(src + drop_path(x))
/// src = src + drop_path(dropout2(linear2(dropout1(gelu(linear1(src))))))
/// ```
pub struct RiemannianEncoderLayer {
    hidden_dim: usize,
    policy: PrecisionPolicy,
    pre_norm: LayerNorm,
    self_attn: RiemannianAttention,
    norm1: LayerNorm,
    feed_forward: FeedForward,
    dropout2: Dropout,
    drop_path: DropPath,
}

impl fmt::Debug for RiemannianEncoderLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RiemannianEncoderLayer")
            .field("hidden_dim", &self.hidden_dim)
            .field("heads", &self.self_attn.config().num_heads)
            .field("dim_feedforward", &self.feed_forward.config().intermediate_size)
            .field("drop_path", &self.drop_path.probability())
            .finish()
    }
}

impl RiemannianEncoderLayer {
    #[allow(clippy::too_many_arguments)]
    pub fn new<R: Rng + ?Sized>(
        hidden_dim: usize,
        attention: AttentionConfig,
        feed_forward: FeedForwardConfig,
        drop_path_rate: f32,
        init: &TruncatedNormal,
        rng: &mut R,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let norm_config = NormConfig::new(hidden_dim);
        let pre_norm = LayerNorm::identity(norm_config.clone(), dtype, device)?;
        let self_attn = RiemannianAttention::new(hidden_dim, attention, init, rng, device, dtype)
            .map_err(|e| Error::Msg(e.to_string()))?;
        let dropout_p = feed_forward.dropout_p;
        let feed_forward = FeedForward::with_init(feed_forward, init, rng, device, dtype)?;
        let norm1 = LayerNorm::identity(norm_config, dtype, device)?;

        Ok(Self {
            hidden_dim,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
            pre_norm,
            self_attn,
            norm1,
            feed_forward,
            dropout2: Dropout::new(dropout_p)?,
            drop_path: DropPath::new(drop_path_rate)?,
        })
    }

    pub fn attention(&self) -> &RiemannianAttention {
        &self.self_attn
    }

    pub fn drop_path(&self) -> &DropPath {
        &self.drop_path
    }

    /// Layers subject to weight initialisation, in construction order.
    pub fn layer_roles(&self) -> Vec<LayerRole<'_>> {
        let [qkv, proj] = self.self_attn.linears();
        let [linear1, linear2] = self.feed_forward.linears();
        vec![
            LayerRole::Normalization(&self.pre_norm),
            LayerRole::Linear(qkv),
            LayerRole::Linear(proj),
            LayerRole::Linear(linear1),
            LayerRole::Normalization(&self.norm1),
            LayerRole::Linear(linear2),
        ]
    }

    pub fn vars(&self) -> Vec<Var> {
        let mut vars = self.pre_norm.vars();
        vars.extend(self.self_attn.vars());
        vars.extend(self.norm1.vars());
        vars.extend(self.feed_forward.vars());
        vars
    }

    /// Returns the updated sequence and this layer's attention weights.
    pub fn forward(&self, src: &Tensor, ctx: &mut ForwardContext) -> Result<(Tensor, Tensor)> {
        checks::expect_batch_seq_hidden("encoder.input", src, self.hidden_dim)?;

        let normed = self.pre_norm.forward(src, &self.policy)?;
        let (attended, weights) = self
            .self_attn
            .forward(&normed, ctx)
            .map_err(|e| Error::Msg(e.to_string()))?;
        let src = (src + self.drop_path.forward(&attended, ctx)?)?;
        let src = self.norm1.forward(&src, &self.policy)?;

        let ff = self.feed_forward.forward(&src, &self.policy, ctx)?;
        let ff = self.dropout2.forward(&ff, ctx)?;
        let src = (&src + self.drop_path.forward(&ff, ctx)?)?;
        Ok((src, weights))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use layers::activations::ActivationKind;
    use rand::{rngs::StdRng, SeedableRng};

    fn layer(drop_path_rate: f32, seed: u64) -> Result<RiemannianEncoderLayer> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut ff = FeedForwardConfig::with_expansion_ratio(16, 2.0, ActivationKind::Gelu);
        ff.dropout_p = 0.1;
        RiemannianEncoderLayer::new(
            16,
            AttentionConfig {
                num_heads: 4,
                ..AttentionConfig::default()
            },
            ff,
            drop_path_rate,
            &TruncatedNormal::new(0.02),
            &mut rng,
            &Device::Cpu,
            DType::F32,
        )
    }

    #[test]
    fn returns_sequence_and_weights() -> Result<()> {
        let layer = layer(0.1, 0)?;
        let x = Tensor::randn(0f32, 1.0, (2, 6, 16), &Device::Cpu)?;
        let (out, weights) = layer.forward(&x, &mut ForwardContext::eval())?;
        assert_eq!(out.dims(), &[2, 6, 16]);
        assert_eq!(weights.dims(), &[2, 4, 6, 6]);
        assert_eq!(layer.layer_roles().len(), 6);
        // 2 norms x 2, qkv + proj weights and biases, scale, 2 ff linears x 2
        assert_eq!(layer.vars().len(), 4 + 5 + 4);
        Ok(())
    }

    #[test]
    fn eval_forward_is_repeatable() -> Result<()> {
        let layer = layer(0.5, 1)?;
        let x = Tensor::randn(0f32, 1.0, (1, 4, 16), &Device::Cpu)?;
        let (a, _) = layer.forward(&x, &mut ForwardContext::eval())?;
        let (b, _) = layer.forward(&x, &mut ForwardContext::eval())?;
        assert_eq!(a.sub(&b)?.abs()?.sum_all()?.to_scalar::<f32>()?, 0.0);

        let (c, _) = layer.forward(&x, &mut ForwardContext::train(9))?;
        let (d, _) = layer.forward(&x, &mut ForwardContext::train(9))?;
        assert_eq!(c.sub(&d)?.abs()?.sum_all()?.to_scalar::<f32>()?, 0.0);
        assert!(a.sub(&c)?.abs()?.sum_all()?.to_scalar::<f32>()? > 0.0);
        Ok(())
    }

    #[test]
    fn rejects_wrong_width() -> Result<()> {
        let layer = layer(0.0, 2)?;
        let x = Tensor::zeros((1, 4, 8), DType::F32, &Device::Cpu)?;
        assert!(layer.forward(&x, &mut ForwardContext::eval()).is_err());
        Ok(())
    }
}
