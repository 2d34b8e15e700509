//! Asynchronous successive halving.

use std::collections::BTreeMap;

use tracing::debug;

use crate::trainer::Decision;

/// Prunes trials whose loss at a rung falls outside the best
/// `1 / reduction_factor` of the trials that reached that rung before.
#[derive(Debug, Clone)]
pub struct AshaScheduler {
    grace_period: usize,
    reduction_factor: f64,
    /// Losses recorded per rung, keyed by completed epochs.
    rungs: BTreeMap<usize, Vec<f64>>,
}

impl AshaScheduler {
    pub fn new(grace_period: usize, reduction_factor: f64) -> Self {
        Self {
            grace_period: grace_period.max(1),
            reduction_factor: reduction_factor.max(2.0),
            rungs: BTreeMap::new(),
        }
    }

    /// Rung milestones (completed epochs) for a trial of `num_epochs`.
    pub fn milestones(&self, num_epochs: usize) -> Vec<usize> {
        let mut milestones = Vec::new();
        let mut milestone = self.grace_period as f64;
        while (milestone.round() as usize) < num_epochs {
            let m = milestone.round() as usize;
            if milestones.last() != Some(&m) {
                milestones.push(m);
            }
            milestone *= self.reduction_factor;
        }
        milestones
    }

    /// Decide after 0-based `epoch` of a trial running `num_epochs` epochs.
    pub fn on_report(
        &mut self,
        trial_id: usize,
        epoch: usize,
        loss: f64,
        num_epochs: usize,
    ) -> Decision {
        let completed = epoch + 1;
        if !self.milestones(num_epochs).contains(&completed) {
            return Decision::Continue;
        }

        let recorded = self.rungs.entry(completed).or_default();
        let decision = match quantile(recorded, 1.0 / self.reduction_factor) {
            Some(cutoff) if loss > cutoff => Decision::Stop,
            _ => Decision::Continue,
        };
        recorded.push(loss);

        debug!(trial = trial_id, rung = completed, loss, ?decision, "rung reached");
        decision
    }
}

/// Linear-interpolated quantile; `None` for an empty slice.
fn quantile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    let frac = pos - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * frac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_milestones() {
        let asha = AshaScheduler::new(1, 2.0);
        assert_eq!(asha.milestones(10), vec![1, 2, 4, 8]);
        assert_eq!(asha.milestones(1), Vec::<usize>::new());

        let asha = AshaScheduler::new(2, 3.0);
        assert_eq!(asha.milestones(20), vec![2, 6, 18]);
    }

    #[test]
    fn test_first_trial_at_rung_continues() {
        let mut asha = AshaScheduler::new(1, 2.0);
        assert_eq!(asha.on_report(0, 0, 9.0, 4), Decision::Continue);
    }

    #[test]
    fn test_no_pruning_before_grace_period() {
        let mut asha = AshaScheduler::new(2, 2.0);
        asha.on_report(0, 1, 0.1, 8);
        // Epoch 0 is before the first rung whatever the loss.
        assert_eq!(asha.on_report(1, 0, 100.0, 8), Decision::Continue);
        assert_eq!(asha.on_report(1, 1, 100.0, 8), Decision::Stop);
    }

    #[test]
    fn test_keeps_best_fraction() {
        let mut asha = AshaScheduler::new(1, 2.0);
        for (trial, loss) in [1.0, 2.0, 3.0, 4.0].into_iter().enumerate() {
            asha.on_report(trial, 0, loss, 4);
        }
        // Median of recorded losses is 2.5.
        assert_eq!(asha.on_report(10, 0, 2.4, 4), Decision::Continue);
        assert_eq!(asha.on_report(11, 0, 3.5, 4), Decision::Stop);
    }

    #[test]
    fn test_last_epoch_is_not_a_rung() {
        let mut asha = AshaScheduler::new(1, 2.0);
        asha.on_report(0, 1, 0.1, 2);
        assert_eq!(asha.on_report(1, 1, 50.0, 2), Decision::Continue);
    }

    #[test]
    fn test_quantile() {
        assert_eq!(quantile(&[], 0.5), None);
        assert_eq!(quantile(&[3.0], 0.5), Some(3.0));
        assert_eq!(quantile(&[4.0, 1.0, 3.0, 2.0], 0.5), Some(2.5));
        assert_eq!(quantile(&[1.0, 2.0, 3.0], 0.0), Some(1.0));
    }
}
