//! Tree-structured Parzen Estimator.
//!
//! Finished trials are split by loss into a good and a bad group. Each
//! dimension is then sampled independently: candidates are drawn around good
//! values and the one with the highest density ratio `l(x) / g(x)` wins.

use std::f64::consts::PI;

use oorandom::Rand64;
use tagtune_core::{Distribution, SampledConfig, SearchConfig, SearchSpace};

const N_CANDIDATES: usize = 24;
const BANDWIDTH_FRACTION: f64 = 0.1;

#[derive(Debug, Clone)]
struct Observation {
    sample: SampledConfig,
    /// `None` for failed trials.
    loss: Option<f64>,
}

/// Suggests trial configurations from the results of finished ones.
#[derive(Debug, Clone)]
pub struct TpeSampler {
    space: SearchSpace,
    n_startup_trials: usize,
    gamma: f64,
    rng: Rand64,
    history: Vec<Observation>,
}

impl TpeSampler {
    pub fn new(space: SearchSpace, config: &SearchConfig) -> Self {
        Self {
            space,
            n_startup_trials: config.n_startup_trials,
            gamma: config.gamma.clamp(0.01, 0.99),
            rng: Rand64::new(u128::from(config.seed)),
            history: Vec::new(),
        }
    }

    /// Number of successfully finished trials.
    pub fn n_completed(&self) -> usize {
        self.history.iter().filter(|o| o.loss.is_some()).count()
    }

    pub fn record(&mut self, sample: SampledConfig, loss: f64) {
        let loss = loss.is_finite().then_some(loss);
        self.history.push(Observation { sample, loss });
    }

    /// Remember a failed trial. Failed trials never shape suggestions.
    pub fn record_failed(&mut self, sample: SampledConfig) {
        self.history.push(Observation { sample, loss: None });
    }

    pub fn suggest(&mut self) -> SampledConfig {
        let mut completed: Vec<(&SampledConfig, f64)> = self
            .history
            .iter()
            .filter_map(|o| Some((&o.sample, o.loss?)))
            .collect();

        if completed.len() < self.n_startup_trials.max(2) {
            return self.sample_random();
        }

        completed.sort_by(|a, b| a.1.total_cmp(&b.1));
        let n_good = (completed.len() as f64 * self.gamma).ceil() as usize;
        let n_good = n_good.clamp(1, completed.len() - 1);
        let (good, bad) = completed.split_at(n_good);

        let good: Vec<SampledConfig> = good.iter().map(|(s, _)| (*s).clone()).collect();
        let bad: Vec<SampledConfig> = bad.iter().map(|(s, _)| (*s).clone()).collect();

        let mut sample = SampledConfig::new();
        for dim in self.space.dimensions.clone() {
            let values = |group: &[SampledConfig]| -> Vec<f64> {
                group.iter().filter_map(|s| s.get(&dim.param).copied()).collect()
            };
            let value = self.sample_tpe(&dim.distribution, &values(&good), &values(&bad));
            sample.insert(dim.param, value);
        }
        sample
    }

    fn sample_random(&mut self) -> SampledConfig {
        let dimensions = self.space.dimensions.clone();
        dimensions
            .iter()
            .map(|dim| (dim.param, self.sample_prior(&dim.distribution)))
            .collect()
    }

    fn sample_prior(&mut self, distribution: &Distribution) -> f64 {
        match distribution {
            Distribution::LogUniform { low, high } => {
                let x = low.ln() + self.rng.rand_float() * (high.ln() - low.ln());
                x.exp().clamp(*low, *high)
            }
            Distribution::Uniform { low, high } => low + self.rng.rand_float() * (high - low),
            Distribution::IntUniform { low, high } => {
                let span = (high - low) as u64 + 1;
                (low + self.rng.rand_range(0..span) as i64) as f64
            }
            Distribution::Choice { values } => {
                values[self.rng.rand_range(0..values.len() as u64) as usize]
            }
        }
    }

    fn sample_tpe(&mut self, distribution: &Distribution, good: &[f64], bad: &[f64]) -> f64 {
        match distribution {
            Distribution::LogUniform { low, high } => {
                let to_log = |v: &[f64]| v.iter().map(|x| x.ln()).collect::<Vec<_>>();
                let x = self.best_candidate(&to_log(good), &to_log(bad), low.ln(), high.ln());
                x.exp().clamp(*low, *high)
            }
            Distribution::Uniform { low, high } => self.best_candidate(good, bad, *low, *high),
            Distribution::IntUniform { low, high } => {
                let (low, high) = (*low as f64, *high as f64);
                self.best_candidate(good, bad, low, high).round().clamp(low, high)
            }
            Distribution::Choice { values } => self.sample_choice(values, good, bad),
        }
    }

    /// Draw candidates around good values, keep the best `l(x) / g(x)`.
    fn best_candidate(&mut self, good: &[f64], bad: &[f64], low: f64, high: f64) -> f64 {
        if good.is_empty() {
            return low + self.rng.rand_float() * (high - low);
        }
        let bandwidth = ((high - low) * BANDWIDTH_FRACTION).max(f64::EPSILON);

        let mut best = (f64::NEG_INFINITY, low);
        for _ in 0..N_CANDIDATES {
            let center = good[self.rng.rand_range(0..good.len() as u64) as usize];
            let candidate = (center + self.gaussian() * bandwidth).clamp(low, high);
            let ratio = kde(candidate, good, bandwidth) / (kde(candidate, bad, bandwidth) + 1e-12);
            if ratio > best.0 {
                best = (ratio, candidate);
            }
        }
        best.1
    }

    /// Laplace-smoothed count ratio per choice, then sample by weight.
    fn sample_choice(&mut self, values: &[f64], good: &[f64], bad: &[f64]) -> f64 {
        let count = |group: &[f64], v: f64| {
            group.iter().filter(|&&x| x == v).count() as f64 + 1.0
        };
        let weights: Vec<f64> = values
            .iter()
            .map(|&v| count(good, v) / count(bad, v))
            .collect();
        let total: f64 = weights.iter().sum();

        let mut r = self.rng.rand_float() * total;
        for (value, weight) in values.iter().zip(&weights) {
            if r < *weight {
                return *value;
            }
            r -= weight;
        }
        values[values.len() - 1]
    }

    /// Standard normal draw (Box-Muller).
    fn gaussian(&mut self) -> f64 {
        let u1 = self.rng.rand_float().max(1e-12);
        let u2 = self.rng.rand_float();
        (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
    }
}

/// Gaussian kernel density estimate at `x`; 1 when there is no data.
fn kde(x: f64, values: &[f64], bandwidth: f64) -> f64 {
    if values.is_empty() {
        return 1.0;
    }
    values
        .iter()
        .map(|v| (-(x - v).powi(2) / (2.0 * bandwidth.powi(2))).exp())
        .sum::<f64>()
        / values.len() as f64
}
