//! Building blocks for transformer layers.
//!
//! This crate hosts the linear projections, normalisation, feed-forward,
//! dropout and stochastic-depth components assembled from Candle primitives.
//! Every component operates on `(batch, seq, hidden)` tensors unless stated
//! otherwise, and every forward pass that may draw randomness receives an
//! explicit [`ForwardContext`].

pub mod activations;
pub mod checks;
pub mod context;
pub mod drop_path;
pub mod dropout;
pub mod dtypes;
pub mod init;
pub mod linear;
pub mod mlp;
pub mod norm;

pub use context::{ForwardContext, Mode};
pub use drop_path::DropPath;
pub use dropout::Dropout;
pub use dtypes::PrecisionPolicy;
pub use init::{LayerRole, WeightInit};
pub use linear::{Linear, LinearConfig};
pub use mlp::{FeedForward, FeedForwardConfig};
pub use norm::{LayerNorm, NormConfig};
