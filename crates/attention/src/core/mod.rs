//! Configuration and error types shared by the distance kernels and the
//! attention module.
//!
//! Distances operate on head-split tensors with layout
//! `[batch, n_heads, seq_len, head_dim]` and produce score matrices shaped
//! `[batch, n_heads, seq_len, seq_len]`.

pub mod config;
pub mod errors;

pub use config::{AttentionConfig, ScorePolarity};
pub use errors::AttentionError;
