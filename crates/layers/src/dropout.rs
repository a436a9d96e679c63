//! Element-wise (inverted) dropout driven by an explicit [`ForwardContext`].

use candle_core::{Result, Tensor};

use crate::{checks, context::ForwardContext};

/// Zeroes each element with probability `p` during training and rescales the
/// survivors by `1 / (1 - p)`. Identity in evaluation mode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dropout {
    probability: f32,
}

impl Dropout {
    pub fn new(probability: f32) -> Result<Self> {
        checks::expect_probability("dropout", probability)?;
        Ok(Self { probability })
    }

    pub fn probability(&self) -> f32 {
        self.probability
    }

    pub fn forward(&self, input: &Tensor, ctx: &mut ForwardContext) -> Result<Tensor> {
        if !ctx.is_training() || self.probability == 0.0 {
            return Ok(input.clone());
        }
        let keep_prob = 1.0 - self.probability;
        let mask = ctx.keep_mask(input.elem_count(), keep_prob);
        let mask = Tensor::from_vec(mask, input.dims(), input.device())?.to_dtype(input.dtype())?;
        (input * mask)? * (1.0 / keep_prob as f64)
    }
}
