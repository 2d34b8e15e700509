//! Corpus loading for BIO-tagged sentences.
//!
//! One `word label` pair per line, whitespace separated, a blank line ends a
//! sentence. Comment lines (`#`) and `-DOCSTART-` markers are skipped.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::labels::BioLabel;

/// A labeled sentence. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentence {
    index: usize,
    source: Arc<str>,
    words: Vec<String>,
    labels: Vec<BioLabel>,
}

impl Sentence {
    /// Build a sentence, rejecting mismatched word/label counts.
    pub fn new(
        index: usize,
        source: impl Into<Arc<str>>,
        words: Vec<String>,
        labels: Vec<BioLabel>,
    ) -> Result<Self> {
        if words.len() != labels.len() {
            return Err(CoreError::MisalignedInput {
                record: index,
                words: words.len(),
                labels: labels.len(),
            });
        }
        Ok(Self {
            index,
            source: source.into(),
            words,
            labels,
        })
    }

    /// Record index within the loaded corpus.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Name of the corpus file the sentence came from.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn words(&self) -> &[String] {
        &self.words
    }

    pub fn labels(&self) -> &[BioLabel] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

/// Sentences read from one or more sources, plus the per-record errors that
/// were skipped in lenient mode.
#[derive(Debug, Default)]
pub struct Corpus {
    pub sentences: Vec<Sentence>,
    pub errors: Vec<CoreError>,
}

/// Reader for the line-oriented BIO format.
#[derive(Debug, Clone, Default)]
pub struct CorpusReader {
    strict: bool,
}

impl CorpusReader {
    /// Lenient reader: malformed records are reported and skipped.
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort the load on the first malformed record.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Read several corpus files into one corpus. Record indices run across
    /// all sources in the order given.
    pub fn read_files<P: AsRef<Path>>(&self, paths: &[P]) -> Result<Corpus> {
        let mut corpus = Corpus::default();
        for path in paths {
            let path = path.as_ref();
            let file = File::open(path)?;
            let before = corpus.sentences.len();
            self.read_into(
                &path.display().to_string(),
                BufReader::new(file),
                &mut corpus,
            )?;
            info!(
                source = %path.display(),
                sentences = corpus.sentences.len() - before,
                "loaded corpus source"
            );
        }
        Ok(corpus)
    }

    /// Read a corpus held in memory.
    pub fn read_str(&self, source: &str, text: &str) -> Result<Corpus> {
        let mut corpus = Corpus::default();
        self.read_into(source, text.as_bytes(), &mut corpus)?;
        Ok(corpus)
    }

    fn read_into<R: BufRead>(&self, source: &str, reader: R, corpus: &mut Corpus) -> Result<()> {
        let source: Arc<str> = Arc::from(source);
        let mut record = corpus.sentences.len() + corpus.errors.len();
        let mut words = Vec::new();
        let mut labels = Vec::new();
        let mut broken: Option<CoreError> = None;

        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();

            if line.is_empty() {
                if !words.is_empty() || broken.is_some() {
                    self.finish_record(
                        &source,
                        record,
                        std::mem::take(&mut words),
                        std::mem::take(&mut labels),
                        broken.take(),
                        corpus,
                    )?;
                    record += 1;
                }
                continue;
            }

            if line.starts_with('#') || line.starts_with("-DOCSTART-") {
                continue;
            }

            if broken.is_some() {
                continue;
            }

            let mut parts = line.split_whitespace();
            let word = parts.next();
            let label = parts.next_back();
            match (word, label) {
                (Some(word), Some(label)) => match label.parse::<BioLabel>() {
                    Ok(label) => {
                        words.push(word.to_string());
                        labels.push(label);
                    }
                    Err(e) => {
                        broken = Some(CoreError::MalformedRecord {
                            record,
                            line: line_no + 1,
                            reason: e.to_string(),
                        })
                    }
                },
                _ => {
                    broken = Some(CoreError::MalformedRecord {
                        record,
                        line: line_no + 1,
                        reason: format!("expected `word label`, got {line:?}"),
                    })
                }
            }
        }

        // Don't forget the last record
        if !words.is_empty() || broken.is_some() {
            self.finish_record(&source, record, words, labels, broken, corpus)?;
        }

        Ok(())
    }

    fn finish_record(
        &self,
        source: &Arc<str>,
        record: usize,
        words: Vec<String>,
        labels: Vec<BioLabel>,
        broken: Option<CoreError>,
        corpus: &mut Corpus,
    ) -> Result<()> {
        let outcome = match broken {
            Some(err) => Err(err),
            None => Sentence::new(record, Arc::clone(source), words, labels),
        };
        match outcome {
            Ok(sentence) => corpus.sentences.push(sentence),
            Err(err) if self.strict => return Err(err),
            Err(err) => {
                warn!(%source, record, error = %err, "skipping malformed record");
                corpus.errors.push(err);
            }
        }
        Ok(())
    }
}

/// Deterministically split sentences into train and validation sets.
///
/// `validation_ratio` is clamped to `[0, 1]`; the order inside each part
/// follows the shuffled order.
pub fn split_train_validation(
    mut sentences: Vec<Sentence>,
    validation_ratio: f64,
    seed: u64,
) -> (Vec<Sentence>, Vec<Sentence>) {
    let mut rng = oorandom::Rand64::new(u128::from(seed));
    for i in (1..sentences.len()).rev() {
        let j = rng.rand_range(0..(i as u64 + 1)) as usize;
        sentences.swap(i, j);
    }

    let ratio = validation_ratio.clamp(0.0, 1.0);
    let n_val = (sentences.len() as f64 * ratio).round() as usize;
    let train = sentences.split_off(n_val);
    debug!(train = train.len(), validation = sentences.len(), "split corpus");
    (train, sentences)
}
