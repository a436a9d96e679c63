//! Covariance-distance self-attention for the classifier workspace.
//!
//! Classical attention scores a query/key pair with a scaled dot product. The
//! kernels in this crate replace that similarity with a "distance" between
//! per-head covariance matrices: each head-split tensor shaped
//! `[batch, n_heads, seq_len, head_dim]` is turned into its centred Gram matrix
//! `[batch, n_heads, seq_len, seq_len]`, and the element-wise distance between
//! the query and key matrices is fed to a softmax.
//!
//! Dropout is a train-only concern driven by the
//! [`ForwardContext`](layers::ForwardContext) passed to every forward call.
//! Evaluation never touches the random source.

pub mod core;
pub mod distance;
pub mod riemannian;

pub use crate::core::{AttentionConfig, AttentionError, ScorePolarity};
pub use crate::distance::{
    cov_frobenius_norm, covariance, log_dist, log_dist_repeated, riemannian_dist, DistanceConfig,
    DistanceKind,
};
pub use crate::riemannian::{attention_weights, RiemannianAttention};
