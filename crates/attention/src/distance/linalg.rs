//! Host-side batched matrix inversion.
//!
//! Candle exposes no `inverse` kernel, so matrices are copied to the host and
//! inverted with Gauss-Jordan elimination (partial pivoting) in `f64`.

use candle_core::{DType, Tensor};

use crate::core::AttentionError;

/// Relative pivot tolerance for the dtype the matrices were computed in.
fn unit_roundoff(dtype: DType) -> f64 {
    match dtype {
        DType::F64 => f64::EPSILON,
        DType::F32 => f32::EPSILON as f64,
        _ => 1e-3,
    }
}

/// Inverts every `[n, n]` matrix in the trailing two axes of `x`.
///
/// A matrix is treated as singular when a pivot falls below
/// `n * eps(dtype) * max|a_ij|`, i.e. it is not invertible at the precision the
/// input was produced in.
pub fn batched_inverse(x: &Tensor) -> Result<Tensor, AttentionError> {
    let dims = x.dims();
    let (rows, cols) = match dims {
        [.., r, c] => (*r, *c),
        _ => {
            return Err(AttentionError::shape(format!(
                "inverse expects at least [n, n], got {:?}",
                dims
            )))
        }
    };
    if rows != cols || rows == 0 {
        return Err(AttentionError::shape(format!(
            "inverse expects square trailing matrices, got {:?}",
            dims
        )));
    }

    let n = rows;
    let data = x.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
    let eps = unit_roundoff(x.dtype());
    let mut out = Vec::with_capacity(data.len());
    for (index, matrix) in data.chunks(n * n).enumerate() {
        let inverse = invert(matrix, n, eps).ok_or(AttentionError::SingularMatrix {
            context: "riemannian_dist",
            index,
        })?;
        out.extend_from_slice(&inverse);
    }

    Ok(Tensor::from_vec(out, dims, x.device())?.to_dtype(x.dtype())?)
}

fn invert(matrix: &[f64], n: usize, eps: f64) -> Option<Vec<f64>> {
    let scale = matrix.iter().fold(0f64, |acc, v| acc.max(v.abs()));
    if !(scale > 0.0) || !scale.is_finite() {
        return None;
    }
    let tolerance = n as f64 * eps * scale;

    let mut a = matrix.to_vec();
    let mut inv = vec![0f64; n * n];
    for i in 0..n {
        inv[i * n + i] = 1.0;
    }

    for col in 0..n {
        let pivot_row = (col..n).max_by(|&r1, &r2| {
            a[r1 * n + col]
                .abs()
                .total_cmp(&a[r2 * n + col].abs())
        })?;
        let pivot = a[pivot_row * n + col];
        if pivot.abs() <= tolerance {
            return None;
        }
        if pivot_row != col {
            for k in 0..n {
                a.swap(col * n + k, pivot_row * n + k);
                inv.swap(col * n + k, pivot_row * n + k);
            }
        }

        let inv_pivot = 1.0 / pivot;
        for k in 0..n {
            a[col * n + k] *= inv_pivot;
            inv[col * n + k] *= inv_pivot;
        }

        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = a[row * n + col];
            if factor == 0.0 {
                continue;
            }
            for k in 0..n {
                a[row * n + k] -= factor * a[col * n + k];
                inv[row * n + k] -= factor * inv[col * n + k];
            }
        }
    }
    Some(inv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Result};

    #[test]
    fn inverts_known_matrix() -> Result<()> {
        let device = Device::Cpu;
        let a = Tensor::from_vec(vec![4f32, 7.0, 2.0, 6.0], (1, 1, 2, 2), &device)?;
        let inv = batched_inverse(&a).expect("invertible");
        let values = inv.flatten_all()?.to_vec1::<f32>()?;
        let expected = [0.6f32, -0.7, -0.2, 0.4];
        for (got, want) in values.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-6, "{got} vs {want}");
        }
        Ok(())
    }

    #[test]
    fn product_with_inverse_is_identity() -> Result<()> {
        let device = Device::Cpu;
        let a = Tensor::from_vec(
            vec![
                2f32, 1.0, 0.0, 1.0, 3.0, 1.0, 0.0, 1.0, 4.0, // first
                0.0, 1.0, 2.0, 1.0, 0.0, 0.0, 3.0, 1.0, 1.0, // needs pivoting
            ],
            (2, 3, 3),
            &device,
        )?;
        let inv = batched_inverse(&a).expect("invertible");
        let product = a.matmul(&inv)?.to_vec3::<f32>()?;
        for matrix in product {
            for (i, row) in matrix.iter().enumerate() {
                for (j, value) in row.iter().enumerate() {
                    let expected = if i == j { 1.0 } else { 0.0 };
                    assert!((value - expected).abs() < 1e-5);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn singular_matrix_reports_batch_index() -> Result<()> {
        let device = Device::Cpu;
        let a = Tensor::from_vec(
            vec![1f32, 0.0, 0.0, 1.0, 1.0, 2.0, 2.0, 4.0],
            (2, 2, 2),
            &device,
        )?;
        match batched_inverse(&a) {
            Err(AttentionError::SingularMatrix { index, .. }) => assert_eq!(index, 1),
            other => panic!("expected singular matrix error, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn non_square_input_is_rejected() -> Result<()> {
        let a = Tensor::zeros((2, 3), DType::F32, &Device::Cpu)?;
        assert!(matches!(
            batched_inverse(&a),
            Err(AttentionError::InvalidShape { .. })
        ));
        Ok(())
    }
}
