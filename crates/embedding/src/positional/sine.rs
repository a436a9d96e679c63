//! Fixed sinusoidal position tables.

use candle_core::{bail, DType, Device, Result, Tensor};

/// Builds the `(1, sequence_length, dim)` sinusoidal table.
///
/// Position `p` and channel `i` hold `p / 10000^(2·⌊i/2⌋/dim)`, passed through
/// `sin` for even `i` and `cos` for odd `i`. Tables are computed in f64,
/// uploaded as f32 and cast to `dtype`.
pub fn sinusoidal_embedding(
    sequence_length: usize,
    dim: usize,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    if sequence_length == 0 || dim == 0 {
        bail!("sinusoidal embedding requires non-zero sequence length and dim, got ({sequence_length}, {dim})");
    }

    let mut data = Vec::with_capacity(sequence_length * dim);
    for pos in 0..sequence_length {
        for i in 0..dim {
            let exponent = (2 * (i / 2)) as f64 / dim as f64;
            let angle = pos as f64 / 10_000f64.powf(exponent);
            let value = if i % 2 == 0 { angle.sin() } else { angle.cos() };
            data.push(value as f32);
        }
    }
    log::debug!("sine table built: seq={sequence_length} dim={dim}");
    Tensor::from_vec(data, (1, sequence_length, dim), device)?.to_dtype(dtype)
}
