//! # BIO Labels
//!
//! The fixed tag set for token-level sequence labeling. Ids are stable:
//! B=0, I=1, O=2. Positions that must not contribute to the loss or to the
//! metrics carry [`IGNORE_INDEX`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Label id for positions excluded from the loss and from metrics.
pub const IGNORE_INDEX: i64 = -100;

/// BIO tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BioLabel {
    Begin,
    Inside,
    Outside,
}

impl BioLabel {
    /// Total number of distinct labels.
    pub const NUM_LABELS: usize = 3;

    /// All labels in id order.
    pub fn all() -> &'static [BioLabel] {
        &[BioLabel::Begin, BioLabel::Inside, BioLabel::Outside]
    }

    /// Get the label id for tensor operations.
    pub fn id(&self) -> i64 {
        match self {
            BioLabel::Begin => 0,
            BioLabel::Inside => 1,
            BioLabel::Outside => 2,
        }
    }

    /// Get label from id. Returns `None` for [`IGNORE_INDEX`] and anything
    /// else outside the label set.
    pub fn from_id(id: i64) -> Option<Self> {
        match id {
            0 => Some(BioLabel::Begin),
            1 => Some(BioLabel::Inside),
            2 => Some(BioLabel::Outside),
            _ => None,
        }
    }

    /// Label carried by the second and later subwords of a word.
    ///
    /// A begin tag never repeats inside one word, so an entity span keeps
    /// exactly one `B` at subword granularity.
    pub fn continuation(&self) -> BioLabel {
        match self {
            BioLabel::Begin => BioLabel::Inside,
            other => *other,
        }
    }
}

impl fmt::Display for BioLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BioLabel::Begin => write!(f, "B"),
            BioLabel::Inside => write!(f, "I"),
            BioLabel::Outside => write!(f, "O"),
        }
    }
}

impl FromStr for BioLabel {
    type Err = CoreError;

    /// Accepts `B`, `I`, `O` and typed variants such as `B-PER`, which are
    /// collapsed onto the untyped tag.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let prefix = s.split_once('-').map_or(s, |(p, _)| p);
        match prefix {
            "B" => Ok(BioLabel::Begin),
            "I" => Ok(BioLabel::Inside),
            "O" if s == "O" => Ok(BioLabel::Outside),
            _ => Err(CoreError::UnknownLabel(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_id_roundtrip() {
        for label in BioLabel::all() {
            assert_eq!(BioLabel::from_id(label.id()), Some(*label));
        }
        assert_eq!(BioLabel::from_id(IGNORE_INDEX), None);
    }

    #[test]
    fn test_continuation() {
        assert_eq!(BioLabel::Begin.continuation(), BioLabel::Inside);
        assert_eq!(BioLabel::Inside.continuation(), BioLabel::Inside);
        assert_eq!(BioLabel::Outside.continuation(), BioLabel::Outside);
    }

    #[test]
    fn test_parse_labels() {
        assert_eq!("B".parse::<BioLabel>().unwrap(), BioLabel::Begin);
        assert_eq!("I-LOC".parse::<BioLabel>().unwrap(), BioLabel::Inside);
        assert_eq!("O".parse::<BioLabel>().unwrap(), BioLabel::Outside);
        assert!("O-LOC".parse::<BioLabel>().is_err());
        assert!("E".parse::<BioLabel>().is_err());
    }

    #[test]
    fn test_display() {
        let rendered: Vec<String> = BioLabel::all().iter().map(|l| l.to_string()).collect();
        assert_eq!(rendered, ["B", "I", "O"]);
    }
}
