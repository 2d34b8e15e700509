//! Token-level evaluation metrics.
//!
//! A [`ConfusionMatrix`] is filled batch by batch (and worker by worker);
//! matrices merge by cell-wise addition, so partial results computed in
//! parallel combine in any order. Precision, recall, F1 and accuracy are
//! derived from the final matrix.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

use crate::labels::{BioLabel, IGNORE_INDEX};

const N: usize = BioLabel::NUM_LABELS;

/// Counts indexed by `[true label][predicted label]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    cells: [[u64; N]; N],
}

impl ConfusionMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a matrix from raw counts.
    pub fn from_counts(cells: [[u64; N]; N]) -> Self {
        Self { cells }
    }

    /// Record one (true, predicted) pair.
    pub fn observe(&mut self, truth: BioLabel, predicted: BioLabel) {
        self.cells[truth.id() as usize][predicted.id() as usize] += 1;
    }

    /// Record aligned label/prediction ids, skipping positions labelled
    /// [`IGNORE_INDEX`]. Any other true label must be a [`BioLabel`] id.
    pub fn observe_batch<L, P>(&mut self, labels: L, predictions: P)
    where
        L: IntoIterator<Item = i64>,
        P: IntoIterator<Item = i64>,
    {
        for (truth, predicted) in labels.into_iter().zip(predictions) {
            if truth == IGNORE_INDEX {
                continue;
            }
            debug_assert!(
                BioLabel::from_id(truth).is_some(),
                "true label {truth} is neither a label id nor IGNORE_INDEX"
            );
            if let (Some(t), Some(p)) = (BioLabel::from_id(truth), BioLabel::from_id(predicted)) {
                self.observe(t, p);
            }
        }
    }

    pub fn count(&self, truth: BioLabel, predicted: BioLabel) -> u64 {
        self.cells[truth.id() as usize][predicted.id() as usize]
    }

    pub fn total(&self) -> u64 {
        self.cells.iter().flatten().sum()
    }

    /// Sum of the diagonal.
    pub fn trace(&self) -> u64 {
        (0..N).map(|i| self.cells[i][i]).sum()
    }

    /// Fraction of correct predictions; 0 when nothing was observed.
    pub fn accuracy(&self) -> f64 {
        ratio(self.trace(), self.total())
    }

    /// Add all counts of `other` into `self`.
    pub fn merge(&mut self, other: &ConfusionMatrix) {
        for (row, other_row) in self.cells.iter_mut().zip(&other.cells) {
            for (cell, other_cell) in row.iter_mut().zip(other_row) {
                *cell += other_cell;
            }
        }
    }

    /// Precision, recall and F1 of one class.
    pub fn class_metrics(&self, label: BioLabel) -> ClassMetrics {
        let k = label.id() as usize;
        let tp = self.cells[k][k];
        let predicted: u64 = (0..N).map(|t| self.cells[t][k]).sum();
        let support: u64 = self.cells[k].iter().sum();

        let precision = ratio(tp, predicted);
        let recall = ratio(tp, support);
        let f1 = if precision + recall == 0.0 {
            0.0
        } else {
            2.0 * precision * recall / (precision + recall)
        };

        ClassMetrics {
            label,
            precision,
            recall,
            f1,
            support,
        }
    }

    /// Per-class metrics plus accuracy and macro F1.
    pub fn report(&self) -> ClassificationReport {
        let classes: Vec<ClassMetrics> = BioLabel::all()
            .iter()
            .map(|&label| self.class_metrics(label))
            .collect();
        let macro_f1 = classes.iter().map(|c| c.f1).sum::<f64>() / classes.len() as f64;

        ClassificationReport {
            classes,
            accuracy: self.accuracy(),
            macro_f1,
            total: self.total(),
        }
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

impl AddAssign<&ConfusionMatrix> for ConfusionMatrix {
    fn add_assign(&mut self, rhs: &ConfusionMatrix) {
        self.merge(rhs);
    }
}

impl AddAssign for ConfusionMatrix {
    fn add_assign(&mut self, rhs: ConfusionMatrix) {
        self.merge(&rhs);
    }
}

impl Add for ConfusionMatrix {
    type Output = ConfusionMatrix;

    fn add(mut self, rhs: ConfusionMatrix) -> ConfusionMatrix {
        self.merge(&rhs);
        self
    }
}

impl Sum for ConfusionMatrix {
    fn sum<I: Iterator<Item = ConfusionMatrix>>(iter: I) -> Self {
        iter.fold(ConfusionMatrix::new(), Add::add)
    }
}

impl<'a> Sum<&'a ConfusionMatrix> for ConfusionMatrix {
    fn sum<I: Iterator<Item = &'a ConfusionMatrix>>(iter: I) -> Self {
        iter.fold(ConfusionMatrix::new(), |mut acc, m| {
            acc.merge(m);
            acc
        })
    }
}

/// Metrics of a single label class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub label: BioLabel,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    /// Number of positions whose true label is `label`.
    pub support: u64,
}

/// Summary derived from a confusion matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationReport {
    pub classes: Vec<ClassMetrics>,
    pub accuracy: f64,
    pub macro_f1: f64,
    pub total: u64,
}

impl fmt::Display for ClassificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:>5} {:>9} {:>9} {:>9} {:>9}", "", "precision", "recall", "f1", "support")?;
        for c in &self.classes {
            writeln!(
                f,
                "{:>5} {:>9.4} {:>9.4} {:>9.4} {:>9}",
                c.label.to_string(),
                c.precision,
                c.recall,
                c.f1,
                c.support
            )?;
        }
        write!(
            f,
            "accuracy {:.4}  macro-f1 {:.4}  ({} tokens)",
            self.accuracy, self.macro_f1, self.total
        )
    }
}
