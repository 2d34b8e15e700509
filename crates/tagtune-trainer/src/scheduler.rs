//! Learning-rate schedule: linear warmup followed by linear decay.

use candle_nn::Optimizer;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearSchedule {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
}

impl LinearSchedule {
    pub fn new(base_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            base_lr,
            warmup_steps: warmup_steps.min(total_steps),
            total_steps,
        }
    }

    /// Schedule over `total_steps` optimizer steps with `warmup_ratio` of
    /// them spent warming up.
    pub fn from_ratio(base_lr: f64, warmup_ratio: f64, total_steps: usize) -> Self {
        let warmup = (warmup_ratio * total_steps as f64).round() as usize;
        Self::new(base_lr, warmup, total_steps)
    }

    /// Learning rate to use for optimizer step `step` (0-based).
    pub fn lr_at(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.base_lr * (step + 1) as f64 / self.warmup_steps as f64;
        }
        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps);
        if decay_steps == 0 {
            return self.base_lr;
        }
        let done = (step - self.warmup_steps).min(decay_steps);
        self.base_lr * (decay_steps - done) as f64 / decay_steps as f64
    }

    /// Set the optimizer's learning rate for `step`.
    pub fn apply<O: Optimizer>(&self, optimizer: &mut O, step: usize) {
        optimizer.set_learning_rate(self.lr_at(step));
    }
}
