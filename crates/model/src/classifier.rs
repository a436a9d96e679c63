use attention::{AttentionConfig, DistanceKind};
use candle_core::{bail, DType, Device, Error, Result, Tensor, Var};
use candle_nn::ops::softmax;
use embedding::{PositionalEmbedding, PositionalScheme};
use layers::{
    activations::ActivationKind,
    checks,
    dtypes::PrecisionPolicy,
    init::{LayerRole, WeightInit},
    linear::{Linear, LinearConfig},
    mlp::FeedForwardConfig,
    norm::{LayerNorm, NormConfig},
    DropPath, Dropout, ForwardContext,
};
use rand::Rng;

use crate::{config::ClassifierConfig, encoder::RiemannianEncoderLayer};

/// How the encoder output is reduced to one vector per sample.
#[derive(Debug)]
enum Pooling {
    /// Softmax-weighted sum of tokens scored by a `dim -> 1` projection.
    Sequence(Linear),
    /// Output at a learned class token prepended to the sequence.
    ClassToken(Var),
}

/// Transformer classifier whose attention scores are covariance distances.
#[derive(Debug)]
pub struct RiemannianClassifier {
    config: ClassifierConfig,
    policy: PrecisionPolicy,
    pooling: Pooling,
    positional: PositionalEmbedding,
    dropout: Dropout,
    blocks: Vec<RiemannianEncoderLayer>,
    norm: LayerNorm,
    fc: Linear,
}

impl RiemannianClassifier {
    /// Builds and initialises the classifier.
    ///
    /// Fails when `config` does not validate, in particular when no
    /// `sequence_length` is given.
    pub fn new<R: Rng + ?Sized>(
        config: ClassifierConfig,
        device: &Device,
        dtype: DType,
        rng: &mut R,
    ) -> Result<Self> {
        config.validate()?;
        let dim = config.embedding_dim;
        let encoder_length = config
            .encoder_length()
            .ok_or_else(|| Error::Msg("sequence_length must be set".into()))?;
        let init = WeightInit::default();

        let pooling = if config.seq_pool {
            Pooling::Sequence(Linear::with_init(
                LinearConfig::new(dim, 1),
                &init.linear_weight,
                rng,
                device,
                dtype,
            )?)
        } else {
            let class_emb = Var::from_tensor(&Tensor::zeros((1, 1, dim), dtype, device)?)?;
            Pooling::ClassToken(class_emb)
        };

        let positional = PositionalEmbedding::new(
            config.positional_embedding,
            Some(encoder_length),
            dim,
            rng,
            device,
            dtype,
        )?;

        let attention = config.attention_config();
        let mut feed_forward =
            FeedForwardConfig::with_expansion_ratio(dim, config.mlp_ratio, ActivationKind::Gelu);
        feed_forward.dropout_p = config.dropout;

        let rates = DropPath::schedule(config.stochastic_depth, config.num_layers);
        let blocks = rates
            .into_iter()
            .map(|rate| {
                RiemannianEncoderLayer::new(
                    dim,
                    attention.clone(),
                    feed_forward.clone(),
                    rate,
                    &init.linear_weight,
                    rng,
                    device,
                    dtype,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let norm = LayerNorm::identity(NormConfig::new(dim), dtype, device)?;
        let fc = Linear::with_init(
            LinearConfig::new(dim, config.num_classes),
            &init.linear_weight,
            rng,
            device,
            dtype,
        )?;

        let model = Self {
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
            pooling,
            positional,
            dropout: Dropout::new(config.dropout)?,
            blocks,
            norm,
            fc,
            config,
        };
        model.init_weights(&init, rng)?;
        log_construction(&model.config, &attention, model.parameters().len());
        Ok(model)
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    pub fn blocks(&self) -> &[RiemannianEncoderLayer] {
        &self.blocks
    }

    pub fn positional_embedding(&self) -> &PositionalEmbedding {
        &self.positional
    }

    /// The class token, present when sequence pooling is off.
    pub fn class_token(&self) -> Option<&Var> {
        match &self.pooling {
            Pooling::ClassToken(token) => Some(token),
            Pooling::Sequence(_) => None,
        }
    }

    /// Every layer subject to [`WeightInit`], in module order.
    pub fn layer_roles(&self) -> Vec<LayerRole<'_>> {
        let mut roles = Vec::new();
        if let Pooling::Sequence(pool) = &self.pooling {
            roles.push(LayerRole::Linear(pool));
        }
        for block in &self.blocks {
            roles.extend(block.layer_roles());
        }
        roles.push(LayerRole::Normalization(&self.norm));
        roles.push(LayerRole::Linear(&self.fc));
        roles
    }

    /// Re-initialises linear and normalisation layers.
    ///
    /// Positional tables and the class token are left as they are.
    pub fn init_weights<R: Rng + ?Sized>(&self, init: &WeightInit, rng: &mut R) -> Result<()> {
        init.apply_all(self.layer_roles(), rng)
    }

    /// All learnable parameters, for an external optimizer.
    pub fn parameters(&self) -> Vec<Var> {
        let mut vars = Vec::new();
        match &self.pooling {
            Pooling::ClassToken(token) => vars.push(token.clone()),
            Pooling::Sequence(pool) => vars.extend(pool.vars()),
        }
        vars.extend(self.positional.vars());
        for block in &self.blocks {
            vars.extend(block.vars());
        }
        vars.extend(self.norm.vars());
        vars.extend(self.fc.vars());
        vars
    }

    /// Classifies `x` shaped `(batch, tokens, embedding_dim)` into
    /// `(batch, num_classes)` logits.
    pub fn forward(&self, x: &Tensor, ctx: &mut ForwardContext) -> Result<Tensor> {
        self.forward_with_attention(x, ctx).map(|(logits, _)| logits)
    }

    /// Like [`forward`](Self::forward), also returning the last layer's
    /// attention weights `(batch, heads, n, n)`.
    pub fn forward_with_attention(
        &self,
        x: &Tensor,
        ctx: &mut ForwardContext,
    ) -> Result<(Tensor, Tensor)> {
        checks::expect_batch_seq_hidden("classifier.input", x, self.config.embedding_dim)?;
        let mut hidden = self.pad_to_sequence_length(x)?;

        if let Pooling::ClassToken(token) = &self.pooling {
            let (batch, _, dim) = hidden.dims3()?;
            let token = token
                .as_tensor()
                .to_dtype(hidden.dtype())?
                .broadcast_as((batch, 1, dim))?;
            hidden = Tensor::cat(&[&token, &hidden], 1)?;
        }

        hidden = self.positional.forward(&hidden)?;
        hidden = self.dropout.forward(&hidden, ctx)?;

        let mut last_weights = None;
        for block in &self.blocks {
            let (next, weights) = block.forward(&hidden, ctx)?;
            hidden = next;
            last_weights = Some(weights);
        }
        let Some(weights) = last_weights else {
            bail!("classifier has no encoder layers");
        };

        let hidden = self.norm.forward(&hidden, &self.policy)?;
        let pooled = match &self.pooling {
            Pooling::Sequence(pool) => {
                let scores = pool.forward(&hidden, &self.policy)?;
                let scores = self.policy.cast_for_reduction(&scores)?;
                let token_weights = softmax(&scores, 1)?.to_dtype(hidden.dtype())?;
                token_weights
                    .transpose(1, 2)?
                    .contiguous()?
                    .matmul(&hidden.contiguous()?)?
                    .squeeze(1)?
            }
            Pooling::ClassToken(_) => hidden.narrow(1, 0, 1)?.squeeze(1)?,
        };

        let logits = self.fc.forward(&pooled, &self.policy)?;
        Ok((logits, weights))
    }

    /// Zero-pads the token axis up to `sequence_length` when there is no
    /// positional table to fix the length.
    fn pad_to_sequence_length(&self, x: &Tensor) -> Result<Tensor> {
        let Some(target) = self.config.sequence_length else {
            return Ok(x.clone());
        };
        let tokens = x.dim(1)?;
        if self.positional.scheme() == PositionalScheme::None && tokens < target {
            log::trace!("padding input from {tokens} to {target} tokens");
            x.pad_with_zeros(1, 0, target - tokens)
        } else {
            Ok(x.clone())
        }
    }
}

fn log_construction(config: &ClassifierConfig, attention: &AttentionConfig, parameters: usize) {
    let distance = &attention.distance;
    log::info!(
        "riemannian classifier: layers={} dim={} heads={} ff={} classes={} seq_len={:?} positional={} seq_pool={} distance={:?} covariance={} log={} params={}",
        config.num_layers,
        config.embedding_dim,
        config.num_heads,
        config.dim_feedforward(),
        config.num_classes,
        config.sequence_length,
        config.positional_embedding,
        config.seq_pool,
        distance.kind,
        distance.use_covariance || distance.kind == DistanceKind::CovFrobenius,
        distance.use_log,
        parameters
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn config() -> ClassifierConfig {
        ClassifierConfig {
            embedding_dim: 16,
            num_layers: 3,
            num_heads: 2,
            num_classes: 5,
            sequence_length: Some(6),
            ..ClassifierConfig::default()
        }
    }

    fn build(config: ClassifierConfig) -> Result<RiemannianClassifier> {
        let mut rng = StdRng::seed_from_u64(0);
        RiemannianClassifier::new(config, &Device::Cpu, DType::F32, &mut rng)
    }

    #[test]
    fn drop_path_rates_ramp_linearly() -> Result<()> {
        let model = build(config())?;
        let rates: Vec<f32> = model
            .blocks()
            .iter()
            .map(|block| block.drop_path().probability())
            .collect();
        assert_eq!(rates.len(), 3);
        assert_eq!(rates[0], 0.0);
        assert!((rates[1] - 0.05).abs() < 1e-6);
        assert!((rates[2] - 0.1).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn init_sets_norms_and_biases() -> Result<()> {
        let model = build(config())?;
        for role in model.layer_roles() {
            match role {
                LayerRole::Linear(linear) => {
                    if let Some(bias) = linear.bias() {
                        let sum = bias.as_tensor().abs()?.sum_all()?.to_scalar::<f32>()?;
                        assert_eq!(sum, 0.0);
                    }
                    let max = linear
                        .weight()
                        .as_tensor()
                        .abs()?
                        .flatten_all()?
                        .max(0)?
                        .to_scalar::<f32>()?;
                    assert!(max <= 2.0);
                }
                LayerRole::Normalization(norm) => {
                    let weight = norm.weight().as_tensor().to_vec1::<f32>()?;
                    assert!(weight.iter().all(|w| *w == 1.0));
                }
            }
        }
        Ok(())
    }

    #[test]
    fn class_token_starts_at_zero() -> Result<()> {
        let model = build(ClassifierConfig {
            seq_pool: false,
            ..config()
        })?;
        let token = model.class_token().map(|t| t.as_tensor().clone());
        let Some(token) = token else {
            bail!("class token missing");
        };
        assert_eq!(token.dims(), &[1, 1, 16]);
        assert_eq!(token.abs()?.sum_all()?.to_scalar::<f32>()?, 0.0);
        assert_eq!(model.positional_embedding().sequence_length(), Some(7));
        Ok(())
    }

    #[test]
    fn parameter_count_tracks_pooling() -> Result<()> {
        let pooled = build(config())?.parameters().len();
        let with_token = build(ClassifierConfig {
            seq_pool: false,
            ..config()
        })?
        .parameters()
        .len();
        // pool weight + bias versus a single class token
        assert_eq!(pooled, with_token + 1);
        Ok(())
    }
}
