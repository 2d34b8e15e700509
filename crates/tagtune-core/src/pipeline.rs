//! `parse → align → shard`, each stage a plain function over the output of
//! the previous one.

use tracing::info;

use crate::align::{AlignedExample, LabelAligner};
use crate::config::RunConfig;
use crate::corpus::{split_train_validation, Corpus, CorpusReader, Sentence};
use crate::dataset::ShardedDataset;
use crate::error::{CoreError, Result};
use crate::tokenizer::SubwordTokenizer;

/// Parsed corpus split into train and validation sentences.
#[derive(Debug, Default)]
pub struct ParsedCorpus {
    pub train: Vec<Sentence>,
    pub validation: Vec<Sentence>,
    /// Records skipped by the lenient reader.
    pub skipped: Vec<CoreError>,
}

/// Aligned train and validation examples.
#[derive(Debug, Clone, Default)]
pub struct AlignedCorpus {
    pub train: Vec<AlignedExample>,
    pub validation: Vec<AlignedExample>,
}

/// Train and validation sets, partitioned for the same worker count.
#[derive(Debug, Clone)]
pub struct ShardedCorpus {
    pub train: ShardedDataset,
    pub validation: ShardedDataset,
}

impl ShardedCorpus {
    pub fn num_workers(&self) -> usize {
        self.train.num_workers()
    }
}

/// Parse stage: read the corpus files and hold out validation data.
pub fn parse(config: &RunConfig) -> Result<ParsedCorpus> {
    let reader = CorpusReader::new().strict(config.strict_corpus);
    let Corpus {
        sentences,
        mut errors,
    } = reader.read_files(&config.train_files)?;

    let (train, validation) = if config.validation_files.is_empty() {
        split_train_validation(sentences, config.validation_ratio, config.training.seed)
    } else {
        let held_out = reader.read_files(&config.validation_files)?;
        errors.extend(held_out.errors);
        (sentences, held_out.sentences)
    };

    info!(
        train = train.len(),
        validation = validation.len(),
        skipped = errors.len(),
        "parsed corpus"
    );
    Ok(ParsedCorpus {
        train,
        validation,
        skipped: errors,
    })
}

/// Align stage.
pub fn align<T: SubwordTokenizer>(
    aligner: &LabelAligner<T>,
    parsed: &ParsedCorpus,
) -> Result<AlignedCorpus> {
    let train = aligner.align_all(&parsed.train)?;
    let validation = aligner.align_all(&parsed.validation)?;
    info!(
        max_length = aligner.max_length(),
        train = train.len(),
        validation = validation.len(),
        "aligned corpus"
    );
    Ok(AlignedCorpus { train, validation })
}

/// Shard stage. Every worker must receive at least one train and one
/// validation example.
pub fn shard(aligned: AlignedCorpus, num_workers: usize) -> Result<ShardedCorpus> {
    let train = ShardedDataset::new(aligned.train, num_workers)?;
    let validation = ShardedDataset::new(aligned.validation, num_workers)?;
    train.shards()?;
    validation.shards()?;
    Ok(ShardedCorpus { train, validation })
}

/// All three stages for a run configuration.
pub fn prepare<T: SubwordTokenizer>(config: &RunConfig, tokenizer: T) -> Result<ShardedCorpus> {
    let aligner = LabelAligner::new(tokenizer, config.training.max_length)?
        .with_policy(config.training.continuation_policy);
    let parsed = parse(config)?;
    let aligned = align(&aligner, &parsed)?;
    shard(aligned, config.training.num_workers)
}
