//! Riemannian-attention transformer classifier.
//!
//! [`RiemannianClassifier`] stacks [`RiemannianEncoderLayer`]s whose attention
//! scores come from covariance distances, and pools the result into class
//! logits.

pub mod classifier;
pub mod config;
pub mod encoder;

pub use classifier::RiemannianClassifier;
pub use config::ClassifierConfig;
pub use encoder::RiemannianEncoderLayer;
