//! Stochastic depth: drops an entire residual branch per sample.

use candle_core::{Result, Tensor};

use crate::{checks, context::ForwardContext};

/// Per-sample branch dropout with survivor rescaling.
///
/// The identity when evaluating or when the probability is zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DropPath {
    probability: f32,
}

impl DropPath {
    pub fn new(probability: f32) -> Result<Self> {
        checks::expect_probability("drop_path", probability)?;
        Ok(Self { probability })
    }

    pub fn probability(&self) -> f32 {
        self.probability
    }

    /// Linearly increasing rates `0 ..= max_rate` across `num_layers` layers.
    pub fn schedule(max_rate: f32, num_layers: usize) -> Vec<f32> {
        match num_layers {
            0 => Vec::new(),
            1 => vec![0.0],
            n => (0..n)
                .map(|i| max_rate * i as f32 / (n - 1) as f32)
                .collect(),
        }
    }

    pub fn forward(&self, input: &Tensor, ctx: &mut ForwardContext) -> Result<Tensor> {
        if !ctx.is_training() || self.probability == 0.0 {
            return Ok(input.clone());
        }
        let keep_prob = 1.0 - self.probability;
        let batch = input.dim(0)?;
        let mut mask_shape = vec![1usize; input.rank()];
        mask_shape[0] = batch;
        let mask = ctx.keep_mask(batch, keep_prob);
        let mask = Tensor::from_vec(mask, mask_shape, input.device())?.to_dtype(input.dtype())?;
        input.broadcast_mul(&mask)? * (1.0 / keep_prob as f64)
    }
}
