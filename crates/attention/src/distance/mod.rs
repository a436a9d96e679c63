//! Distance functions used as attention logits.
//!
//! Every function accepts two head-split tensors `[batch, n_heads, seq_len,
//! head_dim]`. With `use_covariance` both operands are first replaced by their
//! [`covariance`], which turns them into `[batch, n_heads, seq_len, seq_len]`
//! matrices. The variants differ in how the final norm is reduced:
//!
//! | function              | reduction                                         | output             |
//! |-----------------------|---------------------------------------------------|--------------------|
//! | [`log_dist`]          | norm over a fresh trailing axis (element-wise abs) | operand shape      |
//! | [`log_dist_repeated`] | row norm, repeated across the last axis            | `[b, h, t, t]`     |
//! | [`riemannian_dist`]   | row norm of `log(X1⁻¹ X2 + min + 1)`, repeated     | `[b, h, t, t]`     |
//! | [`cov_frobenius_norm`]| norm of `cov(X1) cov(X2)ᵀ` over a singleton axis   | `[b, h, t, t]`     |
//!
//! The two `log_dist*` variants are not interchangeable; attention uses
//! [`log_dist`].

mod covariance;
pub mod linalg;


pub use covariance::covariance;

use candle_core::{DType, Tensor, D};
use serde::{Deserialize, Serialize};

use crate::core::AttentionError;

/// Selects which distance function scores query/key pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceKind {
    /// [`riemannian_dist`]
    Riemannian,
    /// [`log_dist_repeated`]
    LogRepeated,
    /// [`log_dist`]
    #[default]
    Log,
    /// [`cov_frobenius_norm`]; always works on covariances.
    CovFrobenius,
}

/// A distance function together with its flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistanceConfig {
    pub kind: DistanceKind,
    pub use_covariance: bool,
    pub use_log: bool,
}

impl Default for DistanceConfig {
    fn default() -> Self {
        Self {
            kind: DistanceKind::Log,
            use_covariance: true,
            use_log: false,
        }
    }
}

impl DistanceConfig {
    /// Scores `q` against `k` with the configured distance.
    pub fn compute(&self, q: &Tensor, k: &Tensor) -> Result<Tensor, AttentionError> {
        match self.kind {
            DistanceKind::Riemannian => riemannian_dist(q, k, self.use_covariance),
            DistanceKind::LogRepeated => log_dist_repeated(q, k, self.use_covariance, self.use_log),
            DistanceKind::Log => log_dist(q, k, self.use_covariance, self.use_log),
            DistanceKind::CovFrobenius => cov_frobenius_norm(q, k),
        }
    }
}

fn operands(
    x1: &Tensor,
    x2: &Tensor,
    use_covariance: bool,
) -> Result<(Tensor, Tensor), AttentionError> {
    if x1.dims() != x2.dims() {
        return Err(AttentionError::shape(format!(
            "distance operands must share a shape, got {:?} and {:?}",
            x1.dims(),
            x2.dims()
        )));
    }
    if use_covariance {
        Ok((covariance(x1)?, covariance(x2)?))
    } else {
        Ok((x1.clone(), x2.clone()))
    }
}

fn min_value(x: &Tensor) -> Result<f64, AttentionError> {
    Ok(x
        .flatten_all()?
        .min(0)?
        .to_dtype(DType::F64)?
        .to_scalar::<f64>()?)
}

/// `log(x + 1)`, rejecting any element at or below `-1`.
fn log1p_checked(x: &Tensor, context: &'static str) -> Result<Tensor, AttentionError> {
    let min = min_value(x)?;
    if !(min > -1.0) {
        return Err(AttentionError::LogDomain {
            context,
            min,
            bound: -1.0,
        });
    }
    Ok(x.affine(1.0, 1.0)?.log()?)
}

fn difference(
    x1: &Tensor,
    x2: &Tensor,
    use_log: bool,
    context: &'static str,
) -> Result<Tensor, AttentionError> {
    if use_log {
        Ok((log1p_checked(x1, context)? - log1p_checked(x2, context)?)?)
    } else {
        Ok((x1 - x2)?)
    }
}

/// Euclidean norm over the last axis.
fn norm_last(x: &Tensor, keepdim: bool) -> Result<Tensor, AttentionError> {
    let squared = x.sqr()?;
    let summed = if keepdim {
        squared.sum_keepdim(D::Minus1)?
    } else {
        squared.sum(D::Minus1)?
    };
    Ok(summed.sqrt()?)
}

/// Repeats a `[b, h, t, 1]` column across the last axis to `[b, h, t, t]`.
fn repeat_rows(column: &Tensor, context: &str) -> Result<Tensor, AttentionError> {
    let (b, h, t, _) = column.dims4().map_err(|_| {
        AttentionError::shape(format!(
            "{context} expects rank-4 operands, got {:?}",
            column.dims()
        ))
    })?;
    Ok(column.broadcast_as((b, h, t, t))?.contiguous()?)
}

/// Log-matrix distance `‖log(X1⁻¹ X2 + min(X1⁻¹ X2) + 1)‖` per row.
///
/// The row norm is repeated along the last axis, so every entry of a row holds
/// the same score. Fails with [`AttentionError::SingularMatrix`] when `X1` is
/// not invertible.
pub fn riemannian_dist(
    x1: &Tensor,
    x2: &Tensor,
    use_covariance: bool,
) -> Result<Tensor, AttentionError> {
    let (x1, x2) = operands(x1, x2, use_covariance)?;
    log::trace!("riemannian_dist operands {:?}", x1.dims());

    let inverse = linalg::batched_inverse(&x1)?;
    let s = inverse.matmul(&x2.contiguous()?)?;
    let shift = min_value(&s)?;
    let shifted = s.affine(1.0, shift)?;
    let logged = log1p_checked(&shifted, "riemannian_dist")?;
    let dist = norm_last(&logged, true)?;
    repeat_rows(&dist, "riemannian_dist")
}

/// Row norm of the (optionally log-space) difference, repeated across the last
/// axis to a `[b, h, t, t]` matrix.
pub fn log_dist_repeated(
    x1: &Tensor,
    x2: &Tensor,
    use_covariance: bool,
    use_log: bool,
) -> Result<Tensor, AttentionError> {
    let (x1, x2) = operands(x1, x2, use_covariance)?;
    let d = difference(&x1, &x2, use_log, "log_dist_repeated")?;
    let dist = norm_last(&d, true)?;
    repeat_rows(&dist, "log_dist_repeated")
}

/// Norm of the (optionally log-space) difference over a fresh trailing axis.
///
/// The reduction axis has length one, so the result is the element-wise
/// absolute difference and keeps the operand shape.
pub fn log_dist(
    x1: &Tensor,
    x2: &Tensor,
    use_covariance: bool,
    use_log: bool,
) -> Result<Tensor, AttentionError> {
    let (x1, x2) = operands(x1, x2, use_covariance)?;
    log::trace!("log_dist operands {:?}", x1.dims());
    let d = difference(&x1, &x2, use_log, "log_dist")?;
    let dist = norm_last(&d.unsqueeze(d.rank())?, false)?;
    log::trace!("log_dist scores {:?}", dist.dims());
    Ok(dist)
}

/// Magnitude of `cov(X1) @ cov(X2)ᵀ`, normed over a singleton axis.
pub fn cov_frobenius_norm(x1: &Tensor, x2: &Tensor) -> Result<Tensor, AttentionError> {
    let (c1, c2) = operands(x1, x2, true)?;
    let dots = c1.matmul(&c2.t()?.contiguous()?)?;
    let axis = dots.rank().min(2);
    Ok(dots.unsqueeze(axis)?.sqr()?.sum(axis)?.sqrt()?)
}
