//! Dtype handling for layers whose parameters may be stored in half precision.
//!
//! Half-precision storage is promoted to `f32` for matmuls and activations,
//! while statistics such as norms and covariances use at least `f32`.

use candle_core::{DType, Result, Tensor};

/// Storage, compute and reduction dtypes derived from the parameter dtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    storage: DType,
    compute: DType,
    reduction: DType,
}

impl PrecisionPolicy {
    pub fn from_parameter_dtype(storage: DType) -> Self {
        let compute = match storage {
            DType::F16 | DType::BF16 => DType::F32,
            other => other,
        };
        let reduction = if compute == DType::F64 {
            DType::F64
        } else {
            DType::F32
        };
        Self {
            storage,
            compute,
            reduction,
        }
    }

    /// Dtype that matmuls and activations run in.
    pub fn compute(&self) -> DType {
        self.compute
    }

    pub fn cast_for_matmul(&self, tensor: &Tensor) -> Result<Tensor> {
        cast(tensor, self.compute)
    }

    pub fn cast_for_reduction(&self, tensor: &Tensor) -> Result<Tensor> {
        cast(tensor, self.reduction)
    }

    pub fn cast_to_storage(&self, tensor: &Tensor) -> Result<Tensor> {
        cast(tensor, self.storage)
    }
}

impl Default for PrecisionPolicy {
    fn default() -> Self {
        Self::from_parameter_dtype(DType::F32)
    }
}

fn cast(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}
