//! Positional embeddings added to the token sequence before the encoder.

pub mod sine;

use std::{fmt, str::FromStr};

use candle_core::{bail, DType, Device, Result, Tensor, Var};
use layers::{checks, init::TruncatedNormal};
use rand::Rng;
use serde::{Deserialize, Serialize};

pub use sine::sinusoidal_embedding;

/// Standard deviation of the learnable table's truncated-normal init.
pub const LEARNABLE_INIT_STD: f64 = 0.2;

/// Which positional embedding the model carries.
///
/// Parsing is lenient: any name other than `learnable` or `none` selects
/// `sine`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PositionalScheme {
    #[default]
    Learnable,
    Sine,
    None,
}

impl PositionalScheme {
    pub fn as_str(self) -> &'static str {
        match self {
            PositionalScheme::Learnable => "learnable",
            PositionalScheme::Sine => "sine",
            PositionalScheme::None => "none",
        }
    }
}

impl fmt::Display for PositionalScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PositionalScheme {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "learnable" => PositionalScheme::Learnable,
            "none" => PositionalScheme::None,
            "sine" => PositionalScheme::Sine,
            other => {
                log::warn!("unknown positional embedding {other:?}, using sine");
                PositionalScheme::Sine
            }
        })
    }
}

impl From<String> for PositionalScheme {
    fn from(value: String) -> Self {
        match value.parse() {
            Ok(scheme) => scheme,
            Err(never) => match never {},
        }
    }
}

impl From<PositionalScheme> for String {
    fn from(value: PositionalScheme) -> Self {
        value.as_str().to_owned()
    }
}

/// A positional table of shape `(1, sequence_length, dim)`, or nothing.
#[derive(Debug, Clone)]
pub enum PositionalEmbedding {
    Learnable(Var),
    Sine(Tensor),
    None,
}

impl PositionalEmbedding {
    /// Builds the table for `scheme`.
    ///
    /// `Learnable` and `Sine` need a sequence length; `None` ignores it.
    pub fn new<R: Rng + ?Sized>(
        scheme: PositionalScheme,
        sequence_length: Option<usize>,
        dim: usize,
        rng: &mut R,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let length = match (scheme, sequence_length) {
            (PositionalScheme::None, _) => return Ok(PositionalEmbedding::None),
            (_, Some(length)) => length,
            (_, None) => bail!(
                "Positional embedding is set to {scheme} and the sequence length was not specified."
            ),
        };
        if length == 0 || dim == 0 {
            bail!("positional embedding requires non-zero sequence length and dim, got ({length}, {dim})");
        }

        match scheme {
            PositionalScheme::Learnable => {
                let table = TruncatedNormal::new(LEARNABLE_INIT_STD).tensor(
                    (1, length, dim),
                    rng,
                    device,
                    dtype,
                )?;
                Ok(PositionalEmbedding::Learnable(Var::from_tensor(&table)?))
            }
            PositionalScheme::Sine => Ok(PositionalEmbedding::Sine(sinusoidal_embedding(
                length, dim, device, dtype,
            )?)),
            PositionalScheme::None => Ok(PositionalEmbedding::None),
        }
    }

    pub fn scheme(&self) -> PositionalScheme {
        match self {
            PositionalEmbedding::Learnable(_) => PositionalScheme::Learnable,
            PositionalEmbedding::Sine(_) => PositionalScheme::Sine,
            PositionalEmbedding::None => PositionalScheme::None,
        }
    }

    /// The table, if any.
    pub fn table(&self) -> Option<&Tensor> {
        match self {
            PositionalEmbedding::Learnable(var) => Some(var.as_tensor()),
            PositionalEmbedding::Sine(table) => Some(table),
            PositionalEmbedding::None => None,
        }
    }

    /// Token count the table covers.
    pub fn sequence_length(&self) -> Option<usize> {
        self.table().map(|t| t.dims()[1])
    }

    /// Learnable parameters; empty unless the table is learnable.
    pub fn vars(&self) -> Vec<Var> {
        match self {
            PositionalEmbedding::Learnable(var) => vec![var.clone()],
            _ => Vec::new(),
        }
    }

    /// Adds the table to `hidden` shaped `(batch, sequence_length, dim)`.
    pub fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        let Some(table) = self.table() else {
            return Ok(hidden.clone());
        };
        let (_, length, dim) = table.dims3()?;
        checks::expect_batch_seq_hidden("positional.input", hidden, dim)?;
        let tokens = hidden.dims()[1];
        if tokens != length {
            bail!("positional embedding covers {length} tokens but input has {tokens}");
        }
        hidden.broadcast_add(&table.to_dtype(hidden.dtype())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn unknown_names_fall_back_to_sine() {
        assert_eq!("learnable".parse::<PositionalScheme>(), Ok(PositionalScheme::Learnable));
        assert_eq!("None".parse::<PositionalScheme>(), Ok(PositionalScheme::None));
        assert_eq!("sine".parse::<PositionalScheme>(), Ok(PositionalScheme::Sine));
        assert_eq!("rotary".parse::<PositionalScheme>(), Ok(PositionalScheme::Sine));
    }

    #[test]
    fn learnable_table_follows_truncated_normal() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(11);
        let embedding = PositionalEmbedding::new(
            PositionalScheme::Learnable,
            Some(64),
            32,
            &mut rng,
            &Device::Cpu,
            DType::F32,
        )?;
        assert_eq!(embedding.vars().len(), 1);
        let values = embedding
            .table()
            .map(|t| t.flatten_all().and_then(|t| t.to_vec1::<f32>()))
            .transpose()?
            .unwrap_or_default();
        assert_eq!(values.len(), 64 * 32);
        assert!(values.iter().all(|v| v.abs() <= 2.0));
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / values.len() as f32;
        assert!(mean.abs() < 0.02);
        assert!((var.sqrt() as f64 - LEARNABLE_INIT_STD).abs() < 0.02);
        Ok(())
    }

    #[test]
    fn missing_length_is_reported() {
        let mut rng = StdRng::seed_from_u64(0);
        let err = PositionalEmbedding::new(
            PositionalScheme::Sine,
            None,
            8,
            &mut rng,
            &Device::Cpu,
            DType::F32,
        )
        .unwrap_err();
        assert!(err.to_string().contains("sequence length was not specified"));
    }

    #[test]
    fn none_is_identity() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(0);
        let embedding = PositionalEmbedding::new(
            PositionalScheme::None,
            None,
            8,
            &mut rng,
            &Device::Cpu,
            DType::F32,
        )?;
        let x = Tensor::ones((2, 3, 8), DType::F32, &Device::Cpu)?;
        let y = embedding.forward(&x)?;
        assert_eq!(y.sub(&x)?.abs()?.sum_all()?.to_scalar::<f32>()?, 0.0);
        assert!(embedding.vars().is_empty());
        Ok(())
    }

    #[test]
    fn token_count_must_match_table() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(0);
        let embedding = PositionalEmbedding::new(
            PositionalScheme::Sine,
            Some(4),
            8,
            &mut rng,
            &Device::Cpu,
            DType::F32,
        )?;
        let x = Tensor::zeros((1, 5, 8), DType::F32, &Device::Cpu)?;
        assert!(embedding.forward(&x).is_err());
        Ok(())
    }
}
