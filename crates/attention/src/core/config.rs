//! Configuration options for [`RiemannianAttention`](crate::RiemannianAttention).

use serde::{Deserialize, Serialize};

use crate::{core::AttentionError, distance::DistanceConfig};

/// How distances are turned into softmax logits.
///
/// Distances are fed to the softmax as-is by default, so a *larger* distance
/// yields a *larger* attention weight. `NegatedDistance` flips the sign so
/// that closer keys receive more weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScorePolarity {
    #[default]
    Distance,
    NegatedDistance,
}

/// Configuration driving attention behaviour.
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionConfig {
    /// Number of heads the channel dimension is split into.
    pub num_heads: usize,
    /// Dropout applied to the attention weights during training.
    pub attention_dropout: f32,
    /// Dropout applied after the output projection during training.
    pub projection_dropout: f32,
    /// Whether the joint query/key/value projection carries a bias.
    pub qkv_bias: bool,
    /// Distance used in place of the dot-product score.
    pub distance: DistanceConfig,
    /// Multiply scores by the learnable `head_dim^-0.5` scale.
    ///
    /// Off by default: the scale parameter exists but does not touch the score.
    pub apply_scale: bool,
    pub polarity: ScorePolarity,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            num_heads: 8,
            attention_dropout: 0.1,
            projection_dropout: 0.1,
            qkv_bias: true,
            distance: DistanceConfig::default(),
            apply_scale: false,
            polarity: ScorePolarity::default(),
        }
    }
}

impl AttentionConfig {
    /// Checks the configuration against the model width `dim`.
    pub fn validate(&self, dim: usize) -> Result<(), AttentionError> {
        if dim == 0 {
            return Err(AttentionError::Config("dim must be greater than zero".into()));
        }
        if self.num_heads == 0 {
            return Err(AttentionError::Config(
                "num_heads must be greater than zero".into(),
            ));
        }
        if dim % self.num_heads != 0 {
            return Err(AttentionError::Config(format!(
                "dim ({dim}) must be divisible by num_heads ({})",
                self.num_heads
            )));
        }
        for (name, p) in [
            ("attention_dropout", self.attention_dropout),
            ("projection_dropout", self.projection_dropout),
        ] {
            if !(0.0..1.0).contains(&p) {
                return Err(AttentionError::Config(format!(
                    "{name} must be in [0, 1), got {p}"
                )));
            }
        }
        Ok(())
    }
}
