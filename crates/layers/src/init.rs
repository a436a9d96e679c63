//! Parameter initialisation primitives.
//!
//! Weights are sampled on the host from an explicit random source and copied
//! into the layer's `Var`s. [`WeightInit::apply`] dispatches over the closed
//! set of [`LayerRole`]s instead of inspecting concrete layer types.

use candle_core::{DType, Device, Error, Result, Shape, Tensor};
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::{linear::Linear, norm::LayerNorm};

/// Normal distribution truncated to `[low, high]` via rejection sampling.
///
/// The bounds are absolute values rather than multiples of `std`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TruncatedNormal {
    pub mean: f64,
    pub std: f64,
    pub low: f64,
    pub high: f64,
}

impl TruncatedNormal {
    /// Zero-mean distribution with the conventional `[-2, 2]` cut-off.
    pub fn new(std: f64) -> Self {
        Self {
            mean: 0.0,
            std,
            low: -2.0,
            high: 2.0,
        }
    }

    fn validate(&self) -> Result<()> {
        if !(self.std > 0.0) || !self.std.is_finite() {
            return Err(Error::Msg(format!(
                "truncated normal requires a positive std, got {}",
                self.std
            )));
        }
        if !(self.low < self.high) {
            return Err(Error::Msg(format!(
                "truncated normal requires low < high, got [{}, {}]",
                self.low, self.high
            )));
        }
        if self.mean + 6.0 * self.std < self.low || self.mean - 6.0 * self.std > self.high {
            return Err(Error::Msg(
                "truncated normal bounds lie outside the bulk of the distribution".into(),
            ));
        }
        Ok(())
    }

    /// The untruncated normal the rejection loop draws from.
    fn normal(&self) -> Result<Normal<f64>> {
        self.validate()?;
        Normal::new(self.mean, self.std)
            .map_err(|err| Error::Msg(format!("truncated normal: {err}")))
    }

    fn sample_from<R: Rng + ?Sized>(&self, normal: &Normal<f64>, rng: &mut R) -> f64 {
        loop {
            let value = normal.sample(rng);
            if value >= self.low && value <= self.high {
                return value;
            }
        }
    }

    /// Draws a single value.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<f64> {
        let normal = self.normal()?;
        Ok(self.sample_from(&normal, rng))
    }

    /// Samples a tensor of the requested shape and dtype.
    pub fn tensor<S: Into<Shape>, R: Rng + ?Sized>(
        &self,
        shape: S,
        rng: &mut R,
        device: &Device,
        dtype: DType,
    ) -> Result<Tensor> {
        let normal = self.normal()?;
        let shape = shape.into();
        let data: Vec<f32> = (0..shape.elem_count())
            .map(|_| self.sample_from(&normal, rng) as f32)
            .collect();
        Tensor::from_vec(data, shape, device)?.to_dtype(dtype)
    }
}

/// Closed set of layer roles that carry an initialisation rule.
#[derive(Debug, Clone, Copy)]
pub enum LayerRole<'a> {
    Linear(&'a Linear),
    Normalization(&'a LayerNorm),
}

/// Initialisation policy: truncated-normal linear weights with zero bias,
/// unit-scale and zero-bias normalisation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightInit {
    pub linear_weight: TruncatedNormal,
}

impl Default for WeightInit {
    fn default() -> Self {
        Self {
            linear_weight: TruncatedNormal::new(0.02),
        }
    }
}

impl WeightInit {
    /// Overwrites the parameters of `layer` according to its role.
    pub fn apply<R: Rng + ?Sized>(&self, layer: LayerRole<'_>, rng: &mut R) -> Result<()> {
        match layer {
            LayerRole::Linear(linear) => {
                let weight = linear.weight();
                let sampled =
                    self.linear_weight
                        .tensor(weight.dims(), rng, weight.device(), weight.dtype())?;
                weight.set(&sampled)?;
                if let Some(bias) = linear.bias() {
                    bias.set(&bias.zeros_like()?)?;
                }
            }
            LayerRole::Normalization(norm) => {
                let weight = norm.weight();
                weight.set(&weight.ones_like()?)?;
                let bias = norm.bias();
                bias.set(&bias.zeros_like()?)?;
            }
        }
        Ok(())
    }

    /// Applies the policy to every layer in `layers`, in order.
    pub fn apply_all<'a, R, I>(&self, layers: I, rng: &mut R) -> Result<()>
    where
        R: Rng + ?Sized,
        I: IntoIterator<Item = LayerRole<'a>>,
    {
        let mut count = 0usize;
        for layer in layers {
            self.apply(layer, rng)?;
            count += 1;
        }
        log::debug!("weight init applied to {count} layers");
        Ok(())
    }
}
