//! Embedding crate
//!
//! The positional module provides the learnable and sinusoidal position
//! tables added to token sequences ahead of the encoder stack.

pub mod positional;

pub use positional::{sinusoidal_embedding, PositionalEmbedding, PositionalScheme};
