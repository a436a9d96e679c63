//! Empirical covariance over the last axis.

use candle_core::{Tensor, D};

use crate::core::AttentionError;

/// Centred Gram matrix of the rows of `x`, scaled to an unbiased estimate.
///
/// For `x` shaped `[..., n, d]` every row is centred on its own mean along the
/// last axis, then `centered @ centeredᵀ / (d - 1)` is returned with shape
/// `[..., n, n]`. When `d == 1` the divisor falls back to `1`; the centred rows
/// are all zero in that case, so the result is a zero matrix.
///
/// Positive semi-definiteness is not checked.
pub fn covariance(x: &Tensor) -> Result<Tensor, AttentionError> {
    if x.rank() < 2 {
        return Err(AttentionError::shape(format!(
            "covariance expects at least [rows, samples], got {:?}",
            x.dims()
        )));
    }
    let samples = x.dim(D::Minus1)?;
    if samples == 0 {
        return Err(AttentionError::shape(
            "covariance requires a non-empty sample axis",
        ));
    }

    let mean = x.mean_keepdim(D::Minus1)?;
    let centered = x.broadcast_sub(&mean)?;
    let gram = centered.matmul(&centered.t()?.contiguous()?)?;
    let divisor = if samples == 1 { 1.0 } else { (samples - 1) as f64 };
    Ok((gram / divisor)?)
}
