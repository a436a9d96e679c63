//! Explicit execution mode and random source for forward passes.
//!
//! Dropout and drop-path never reach for a process-wide generator: they draw
//! from the [`ForwardContext`] handed to `forward`. In [`Mode::Eval`] the
//! random source is never consulted, so evaluation is deterministic.

use rand::{rngs::StdRng, Rng, SeedableRng};

/// Whether stochastic regularisers are active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Dropout and drop-path perturb activations.
    Train,
    /// Every stochastic layer is the identity.
    #[default]
    Eval,
}

/// Mode flag plus the random stream used for dropout and drop-path masks.
#[derive(Debug, Clone)]
pub struct ForwardContext {
    mode: Mode,
    rng: StdRng,
}

impl ForwardContext {
    /// Builds a context from an explicit mode and random source.
    pub fn new(mode: Mode, rng: StdRng) -> Self {
        Self { mode, rng }
    }

    /// Deterministic evaluation context.
    pub fn eval() -> Self {
        Self::new(Mode::Eval, StdRng::seed_from_u64(0))
    }

    /// Training context seeded for reproducible masks.
    pub fn train(seed: u64) -> Self {
        Self::new(Mode::Train, StdRng::seed_from_u64(seed))
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_training(&self) -> bool {
        self.mode == Mode::Train
    }

    /// Switches between training and evaluation without resetting the stream.
    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    /// Draws `count` keep/drop decisions, `1.0` meaning keep.
    pub(crate) fn keep_mask(&mut self, count: usize, keep_prob: f32) -> Vec<f32> {
        (0..count)
            .map(|_| {
                if self.rng.gen::<f32>() < keep_prob {
                    1.0
                } else {
                    0.0
                }
            })
            .collect()
    }
}

impl Default for ForwardContext {
    fn default() -> Self {
        Self::eval()
    }
}
