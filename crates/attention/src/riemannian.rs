//! Multi-head self-attention scored by a covariance distance.
//!
//! The module mirrors a standard attention block: a joint QKV projection,
//! head split, softmax over the key axis, dropout, value aggregation, head
//! merge and an output projection. Only the score differs: instead of
//! `q·kᵀ / sqrt(d)` it is the configured [`DistanceConfig`] of the query and
//! key covariances.

use std::sync::OnceLock;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::ops::softmax_last_dim;
use layers::{
    checks,
    init::TruncatedNormal,
    linear::{Linear, LinearConfig},
    Dropout, ForwardContext, PrecisionPolicy,
};
use rand::Rng;

use crate::{
    core::{AttentionConfig, AttentionError, ScorePolarity},
    distance::DistanceConfig,
};

/// Turns a distance matrix into attention weights over its last axis.
pub fn attention_weights(
    distances: &Tensor,
    polarity: ScorePolarity,
) -> Result<Tensor, AttentionError> {
    let logits = match polarity {
        ScorePolarity::Distance => distances.clone(),
        ScorePolarity::NegatedDistance => distances.neg()?,
    };
    Ok(softmax_last_dim(&logits.contiguous()?)?)
}

/// Self-attention whose scores are covariance distances.
#[derive(Debug)]
pub struct RiemannianAttention {
    config: AttentionConfig,
    dim: usize,
    head_dim: usize,
    policy: PrecisionPolicy,
    qkv: Linear,
    proj: Linear,
    scale: Var,
    attn_drop: Dropout,
    proj_drop: Dropout,
    first_call: OnceLock<()>,
}

impl RiemannianAttention {
    /// Builds the module for a model of width `dim`.
    pub fn new<R: Rng + ?Sized>(
        dim: usize,
        config: AttentionConfig,
        init: &TruncatedNormal,
        rng: &mut R,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, AttentionError> {
        config.validate(dim)?;
        let head_dim = dim / config.num_heads;

        let qkv = Linear::with_init(
            LinearConfig::new(dim, 3 * dim).with_bias(config.qkv_bias),
            init,
            rng,
            device,
            dtype,
        )?;
        let proj = Linear::with_init(LinearConfig::new(dim, dim), init, rng, device, dtype)?;
        let scale = Tensor::new((head_dim as f32).powf(-0.5), device)?.to_dtype(dtype)?;

        Ok(Self {
            dim,
            head_dim,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
            qkv,
            proj,
            scale: Var::from_tensor(&scale)?,
            attn_drop: Dropout::new(config.attention_dropout)?,
            proj_drop: Dropout::new(config.projection_dropout)?,
            config,
            first_call: OnceLock::new(),
        })
    }

    pub fn config(&self) -> &AttentionConfig {
        &self.config
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Learnable score scale, initialised to `head_dim^-0.5`.
    ///
    /// Only consulted when [`AttentionConfig::apply_scale`] is set.
    pub fn scale(&self) -> &Var {
        &self.scale
    }

    /// QKV and output projections, in that order.
    pub fn linears(&self) -> [&Linear; 2] {
        [&self.qkv, &self.proj]
    }

    pub fn vars(&self) -> Vec<Var> {
        let mut vars = self.qkv.vars();
        vars.extend(self.proj.vars());
        vars.push(self.scale.clone());
        vars
    }

    fn distance(&self) -> &DistanceConfig {
        &self.config.distance
    }

    fn split_heads(&self, tensor: &Tensor) -> Result<Tensor, AttentionError> {
        let (batch, seq, _) = tensor.dims3()?;
        Ok(tensor
            .reshape((batch, seq, self.config.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    /// Attends over `x` shaped `(batch, tokens, dim)`.
    ///
    /// Returns the projected output `(batch, tokens, dim)` and the softmax
    /// weights `(batch, heads, tokens, tokens)` taken before dropout.
    pub fn forward(
        &self,
        x: &Tensor,
        ctx: &mut ForwardContext,
    ) -> Result<(Tensor, Tensor), AttentionError> {
        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::riemannian init heads={} head_dim={} distance={:?} use_covariance={} use_log={} apply_scale={} polarity={:?}",
                self.config.num_heads,
                self.head_dim,
                self.distance().kind,
                self.distance().use_covariance,
                self.distance().use_log,
                self.config.apply_scale,
                self.config.polarity
            );
        }

        checks::expect_batch_seq_hidden("attention.input", x, self.dim)
            .map_err(|e| AttentionError::shape(e.to_string()))?;
        let (batch, seq, _) = x.dims3()?;

        let qkv = self.qkv.forward(x, &self.policy)?;
        let q = self.split_heads(&qkv.narrow(2, 0, self.dim)?)?;
        let k = self.split_heads(&qkv.narrow(2, self.dim, self.dim)?)?;
        let v = self.split_heads(&qkv.narrow(2, 2 * self.dim, self.dim)?)?;

        let q = self.policy.cast_for_reduction(&q)?;
        let k = self.policy.cast_for_reduction(&k)?;
        let mut scores = self.distance().compute(&q, &k)?;

        let expected = [batch, self.config.num_heads, seq, seq];
        if scores.dims() != expected {
            return Err(AttentionError::shape(format!(
                "{:?} distance produced scores {:?}, expected {:?}",
                self.distance().kind,
                scores.dims(),
                expected
            )));
        }

        if self.config.apply_scale {
            let scale = self.scale.as_tensor().to_dtype(scores.dtype())?;
            scores = scores.broadcast_mul(&scale)?;
        }
        let weights = attention_weights(&scores, self.config.polarity)?;

        let dropped = self.attn_drop.forward(&weights, ctx)?;
        let v = self.policy.cast_for_matmul(&v)?;
        let out = dropped.to_dtype(v.dtype())?.matmul(&v)?;
        let merged = out.transpose(1, 2)?.reshape((batch, seq, self.dim))?;
        let merged = self.policy.cast_to_storage(&merged)?;

        let projected = self.proj.forward(&merged, &self.policy)?;
        let output = self.proj_drop.forward(&projected, ctx)?;
        Ok((output, weights))
    }
}
