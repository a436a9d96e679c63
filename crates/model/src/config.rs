use std::{fs, path::Path};

use attention::{AttentionConfig, DistanceConfig, ScorePolarity};
use candle_core::{Error, Result};
use embedding::PositionalScheme;
use serde::{Deserialize, Serialize};

/// Hyperparameters of the Riemannian transformer classifier.
///
/// Every field has a default, so config files only need to name what they
/// change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Pool tokens with a learned softmax weighting instead of a class token.
    pub seq_pool: bool,
    pub embedding_dim: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub mlp_ratio: f32,
    pub num_classes: usize,
    pub dropout: f32,
    pub attention_dropout: f32,
    /// Drop-path rate of the last encoder layer; earlier layers ramp up to it.
    pub stochastic_depth: f32,
    pub positional_embedding: PositionalScheme,
    /// Token count of the input, excluding any class token.
    pub sequence_length: Option<usize>,
    pub distance: DistanceConfig,
    pub apply_scale: bool,
    pub polarity: ScorePolarity,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            seq_pool: true,
            embedding_dim: 768,
            num_layers: 12,
            num_heads: 12,
            mlp_ratio: 4.0,
            num_classes: 1000,
            dropout: 0.1,
            attention_dropout: 0.1,
            stochastic_depth: 0.1,
            positional_embedding: PositionalScheme::Learnable,
            sequence_length: None,
            distance: DistanceConfig::default(),
            apply_scale: false,
            polarity: ScorePolarity::Distance,
        }
    }
}

impl ClassifierConfig {
    /// Loads a JSON or TOML config, picked by file extension.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|err| Error::Msg(format!("failed to read {}: {err}", path.display())))?;
        let config: ClassifierConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)
                .map_err(|err| Error::Msg(format!("invalid JSON in {}: {err}", path.display())))?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)
                .map_err(|err| Error::Msg(format!("invalid TOML in {}: {err}", path.display())))?,
            Some(other) => {
                return Err(Error::Msg(format!(
                    "unsupported configuration extension '{other}'"
                )));
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Width of the encoder feed-forward layer, `floor(embedding_dim * mlp_ratio)`.
    pub fn dim_feedforward(&self) -> usize {
        (self.embedding_dim as f32 * self.mlp_ratio) as usize
    }

    /// Token count seen by the encoder, counting the class token if present.
    pub fn encoder_length(&self) -> Option<usize> {
        self.sequence_length
            .map(|len| if self.seq_pool { len } else { len + 1 })
    }

    pub fn attention_config(&self) -> AttentionConfig {
        AttentionConfig {
            num_heads: self.num_heads,
            attention_dropout: self.attention_dropout,
            projection_dropout: self.dropout,
            qkv_bias: true,
            distance: self.distance,
            apply_scale: self.apply_scale,
            polarity: self.polarity,
        }
    }

    /// Validate structural invariants, reporting every violation at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.embedding_dim == 0 {
            errors.push("embedding_dim must be greater than zero".to_string());
        }
        if self.num_layers == 0 {
            errors.push("num_layers must be greater than zero".to_string());
        }
        if self.num_heads == 0 {
            errors.push("num_heads must be greater than zero".to_string());
        } else if self.embedding_dim % self.num_heads != 0 {
            errors.push(format!(
                "embedding_dim ({}) must be divisible by num_heads ({})",
                self.embedding_dim, self.num_heads
            ));
        }
        if self.num_classes == 0 {
            errors.push("num_classes must be greater than zero".to_string());
        }
        if !(self.mlp_ratio.is_finite() && self.mlp_ratio > 0.0) {
            errors.push("mlp_ratio must be positive".to_string());
        } else if self.dim_feedforward() == 0 {
            errors.push("embedding_dim * mlp_ratio must be at least 1".to_string());
        }
        for (name, p) in [
            ("dropout", self.dropout),
            ("attention_dropout", self.attention_dropout),
            ("stochastic_depth", self.stochastic_depth),
        ] {
            if !(0.0..1.0).contains(&p) {
                errors.push(format!("{name} must be in [0, 1), got {p}"));
            }
        }

        match (self.sequence_length, self.positional_embedding) {
            (Some(0), _) => errors.push("sequence_length must be greater than zero".to_string()),
            (Some(_), _) => {}
            (None, PositionalScheme::None) => errors.push(
                "sequence_length is required when positional embedding is none; inputs are zero-padded to it"
                    .to_string(),
            ),
            (None, scheme) => errors.push(format!(
                "Positional embedding is set to {scheme} and the sequence length was not specified."
            )),
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Msg(format!(
                "invalid classifier config: {}",
                errors.join("; ")
            )))
        }
    }
}
