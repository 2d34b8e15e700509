//! # Label Alignment
//!
//! Projects word-level BIO labels onto subword tokens and lays the result
//! out as a fixed-length model input:
//!
//! ```text
//! [begin] s(w0) s(w0) s(w1) ... [end] [pad] [pad] ...
//!   -100   B     I     O    ...  -100  -100  -100
//! ```
//!
//! Content is truncated to `max_length - 2` subwords before the markers are
//! added. Truncation happens at subword granularity: subwords of the word in
//! progress that already fit are kept.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::corpus::Sentence;
use crate::error::{CoreError, Result};
use crate::labels::{BioLabel, IGNORE_INDEX};
use crate::tokenizer::SubwordTokenizer;

/// How subwords after the first one of a word are labeled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinuationPolicy {
    /// Continuations carry [`BioLabel::continuation`] of the word label.
    #[default]
    Propagate,
    /// Continuations carry [`IGNORE_INDEX`]; only the first subword is scored.
    FirstSubwordOnly,
}

/// A fixed-length model input with per-position label ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignedExample {
    pub token_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    pub label_ids: Vec<i64>,
}

impl AlignedExample {
    /// Sequence length (identical for all three sequences).
    pub fn len(&self) -> usize {
        self.token_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.token_ids.is_empty()
    }

    /// Number of content subwords, markers excluded.
    pub fn content_len(&self) -> usize {
        let attended = self.attention_mask.iter().filter(|&&m| m == 1).count();
        attended.saturating_sub(2)
    }
}

/// Converts (words, labels) records into [`AlignedExample`]s.
#[derive(Debug, Clone)]
pub struct LabelAligner<T> {
    tokenizer: T,
    max_length: usize,
    policy: ContinuationPolicy,
}

impl<T: SubwordTokenizer> LabelAligner<T> {
    /// Create an aligner producing sequences of exactly `max_length`.
    pub fn new(tokenizer: T, max_length: usize) -> Result<Self> {
        if max_length < 2 {
            return Err(CoreError::InvalidConfig(format!(
                "max_length must leave room for the two markers, got {max_length}"
            )));
        }
        Ok(Self {
            tokenizer,
            max_length,
            policy: ContinuationPolicy::default(),
        })
    }

    /// Set the continuation labeling policy.
    pub fn with_policy(mut self, policy: ContinuationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn tokenizer(&self) -> &T {
        &self.tokenizer
    }

    /// Align one record. `record` is only used for error reporting.
    pub fn align<S: AsRef<str>>(
        &self,
        record: usize,
        words: &[S],
        labels: &[BioLabel],
    ) -> Result<AlignedExample> {
        if words.len() != labels.len() {
            return Err(CoreError::MisalignedInput {
                record,
                words: words.len(),
                labels: labels.len(),
            });
        }

        let room = self.max_length - 2;
        let mut content_ids: Vec<u32> = Vec::with_capacity(room);
        let mut content_labels: Vec<i64> = Vec::with_capacity(room);

        'words: for (word, label) in words.iter().zip(labels) {
            let normalized = word.as_ref().to_lowercase();
            let pieces = self
                .tokenizer
                .subword_ids(&normalized)
                .map_err(|e| CoreError::Tokenizer(format!("record {record}: {e}")))?;

            for (position, id) in pieces.into_iter().enumerate() {
                if content_ids.len() >= room {
                    debug!(record, room, "truncated record");
                    break 'words;
                }
                content_ids.push(id);
                content_labels.push(self.subword_label(*label, position));
            }
        }

        Ok(self.finalize(content_ids, content_labels))
    }

    /// Align a sentence read from the corpus.
    pub fn align_sentence(&self, sentence: &Sentence) -> Result<AlignedExample> {
        self.align(sentence.index(), sentence.words(), sentence.labels())
    }

    /// Align every sentence, stopping at the first failure.
    pub fn align_all(&self, sentences: &[Sentence]) -> Result<Vec<AlignedExample>> {
        sentences.iter().map(|s| self.align_sentence(s)).collect()
    }

    fn subword_label(&self, label: BioLabel, position: usize) -> i64 {
        match (position, self.policy) {
            (0, _) => label.id(),
            (_, ContinuationPolicy::Propagate) => label.continuation().id(),
            (_, ContinuationPolicy::FirstSubwordOnly) => IGNORE_INDEX,
        }
    }

    fn finalize(&self, content_ids: Vec<u32>, content_labels: Vec<i64>) -> AlignedExample {
        let n = self.max_length;
        let mut token_ids = Vec::with_capacity(n);
        let mut label_ids = Vec::with_capacity(n);

        token_ids.push(self.tokenizer.begin_id());
        label_ids.push(IGNORE_INDEX);
        token_ids.extend(content_ids);
        label_ids.extend(content_labels);
        token_ids.push(self.tokenizer.end_id());
        label_ids.push(IGNORE_INDEX);

        let mut attention_mask = vec![1u32; token_ids.len()];
        attention_mask.resize(n, 0);
        token_ids.resize(n, self.tokenizer.pad_id());
        label_ids.resize(n, IGNORE_INDEX);

        AlignedExample {
            token_ids,
            attention_mask,
            label_ids,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::tests::test_vocab;
    use crate::tokenizer::HfSubwordTokenizer;

    const B: i64 = 0;
    const I: i64 = 1;
    const O: i64 = 2;

    fn aligner(max_length: usize) -> LabelAligner<HfSubwordTokenizer> {
        let tokenizer = HfSubwordTokenizer::from_wordpiece_vocab(test_vocab()).unwrap();
        LabelAligner::new(tokenizer, max_length).unwrap()
    }

    /// Splits every word into one subword per character, drops "~".
    struct CharTokenizer;

    impl SubwordTokenizer for CharTokenizer {
        fn subword_ids(&self, word: &str) -> Result<Vec<u32>> {
            if word == "~" {
                return Ok(Vec::new());
            }
            Ok(word.chars().map(|c| c as u32).collect())
        }
        fn begin_id(&self) -> u32 {
            1
        }
        fn end_id(&self) -> u32 {
            2
        }
        fn pad_id(&self) -> u32 {
            0
        }
    }

    #[test]
    fn test_cats_run() {
        let example = aligner(8)
            .align(0, &["Cats", "run"], &[BioLabel::Begin, BioLabel::Outside])
            .unwrap();

        assert_eq!(example.token_ids, vec![2, 4, 5, 6, 3, 0, 0, 0]);
        assert_eq!(example.attention_mask, vec![1, 1, 1, 1, 1, 0, 0, 0]);
        assert_eq!(
            example.label_ids,
            vec![IGNORE_INDEX, B, I, O, IGNORE_INDEX, IGNORE_INDEX, IGNORE_INDEX, IGNORE_INDEX]
        );
        assert_eq!(example.content_len(), 3);
    }

    #[test]
    fn test_misaligned_input_reports_record() {
        let err = aligner(8)
            .align(12, &["a", "b", "c"], &[BioLabel::Outside, BioLabel::Outside])
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::MisalignedInput {
                record: 12,
                words: 3,
                labels: 2
            }
        ));
    }

    #[test]
    fn test_continuation_labels() {
        let aligner = LabelAligner::new(CharTokenizer, 32).unwrap();
        for (label, expected) in [
            (BioLabel::Begin, vec![B, I, I, I]),
            (BioLabel::Inside, vec![I, I, I, I]),
            (BioLabel::Outside, vec![O, O, O, O]),
        ] {
            let example = aligner.align(0, &["abcd"], &[label]).unwrap();
            assert_eq!(example.label_ids[1..5], expected[..]);
        }
    }

    #[test]
    fn test_first_subword_only_policy() {
        let aligner = LabelAligner::new(CharTokenizer, 16)
            .unwrap()
            .with_policy(ContinuationPolicy::FirstSubwordOnly);
        let example = aligner.align(0, &["abc"], &[BioLabel::Begin]).unwrap();
        assert_eq!(example.label_ids[1..4], [B, IGNORE_INDEX, IGNORE_INDEX]);
    }

    #[test]
    fn test_zero_subword_word_is_skipped() {
        let aligner = LabelAligner::new(CharTokenizer, 16).unwrap();
        let example = aligner
            .align(
                0,
                &["a", "~", "b"],
                &[BioLabel::Begin, BioLabel::Inside, BioLabel::Outside],
            )
            .unwrap();
        assert_eq!(example.content_len(), 2);
        assert_eq!(example.label_ids[1..3], [B, O]);
    }

    #[test]
    fn test_truncation_keeps_partial_word() {
        // Room for 4 subwords: "abc" fits whole, "defg" keeps only "d".
        let aligner = LabelAligner::new(CharTokenizer, 6).unwrap();
        let example = aligner
            .align(0, &["abc", "defg", "h"], &[BioLabel::Outside, BioLabel::Begin, BioLabel::Outside])
            .unwrap();

        assert_eq!(example.len(), 6);
        assert_eq!(example.content_len(), 4);
        assert_eq!(example.token_ids, vec![1, 97, 98, 99, 100, 2]);
        assert_eq!(example.label_ids, vec![IGNORE_INDEX, O, O, O, B, IGNORE_INDEX]);
    }

    #[test]
    fn test_every_output_has_max_length() {
        let aligner = LabelAligner::new(CharTokenizer, 10).unwrap();
        let cases: Vec<Vec<&str>> = vec![
            vec![],
            vec!["a"],
            vec!["abcdefgh"],
            vec!["abcdefghijklmnop", "q"],
            vec!["ab", "cd", "ef", "gh", "ij"],
        ];
        for words in cases {
            let labels = vec![BioLabel::Outside; words.len()];
            let example = aligner.align(0, &words, &labels).unwrap();
            assert_eq!(example.token_ids.len(), 10);
            assert_eq!(example.attention_mask.len(), 10);
            assert_eq!(example.label_ids.len(), 10);
            assert!(example.content_len() <= 8);
        }
    }

    #[test]
    fn test_minimal_max_length() {
        let aligner = LabelAligner::new(CharTokenizer, 2).unwrap();
        let example = aligner.align(0, &["abc"], &[BioLabel::Begin]).unwrap();
        assert_eq!(example.token_ids, vec![1, 2]);
        assert!(LabelAligner::new(CharTokenizer, 1).is_err());
    }
}
