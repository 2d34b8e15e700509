//! # Subword Tokenizer Boundary
//!
//! The pretrained tokenizer is an external collaborator. The aligner only
//! needs the subword ids of a single normalized word and the ids of the
//! begin, end and pad markers.

use std::collections::HashMap;
use std::path::Path;

use tokenizers::models::wordpiece::WordPiece;
use tokenizers::Tokenizer as HfTokenizer;

use crate::error::{CoreError, Result};

/// Subword decomposition service used by the label aligner.
pub trait SubwordTokenizer: Send + Sync {
    /// Subword ids of one already-normalized word. May be empty.
    fn subword_ids(&self, word: &str) -> Result<Vec<u32>>;

    /// Id of the marker placed before the content (`[CLS]`).
    fn begin_id(&self) -> u32;

    /// Id of the marker placed after the content (`[SEP]`).
    fn end_id(&self) -> u32;

    /// Id used to right-pad sequences (`[PAD]`).
    fn pad_id(&self) -> u32;
}

const BEGIN_TOKENS: &[&str] = &["[CLS]", "<s>"];
const END_TOKENS: &[&str] = &["[SEP]", "</s>"];
const PAD_TOKENS: &[&str] = &["[PAD]", "<pad>"];

/// [`SubwordTokenizer`] backed by a Hugging Face `tokenizers` tokenizer.
pub struct HfSubwordTokenizer {
    inner: HfTokenizer,
    begin_id: u32,
    end_id: u32,
    pad_id: u32,
}

impl HfSubwordTokenizer {
    /// Load a `tokenizer.json` file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let inner = HfTokenizer::from_file(path)
            .map_err(|e| CoreError::Tokenizer(format!("{}: {e}", path.display())))?;
        Self::new(inner)
    }

    /// Build a WordPiece tokenizer from an in-memory vocabulary. The
    /// vocabulary must contain `[UNK]` and the special markers.
    pub fn from_wordpiece_vocab(vocab: HashMap<String, u32>) -> Result<Self> {
        let model = WordPiece::builder()
            .vocab(vocab)
            .unk_token("[UNK]".to_string())
            .continuing_subword_prefix("##".to_string())
            .build()
            .map_err(|e| CoreError::Tokenizer(e.to_string()))?;
        Self::new(HfTokenizer::new(model))
    }

    /// Wrap an existing tokenizer, resolving the special marker ids.
    pub fn new(inner: HfTokenizer) -> Result<Self> {
        let lookup = |candidates: &[&str]| {
            candidates
                .iter()
                .find_map(|tok| inner.token_to_id(tok))
                .ok_or_else(|| {
                    CoreError::Tokenizer(format!("vocabulary has none of {candidates:?}"))
                })
        };
        let begin_id = lookup(BEGIN_TOKENS)?;
        let end_id = lookup(END_TOKENS)?;
        let pad_id = lookup(PAD_TOKENS)?;

        Ok(Self {
            inner,
            begin_id,
            end_id,
            pad_id,
        })
    }
}

impl SubwordTokenizer for HfSubwordTokenizer {
    fn subword_ids(&self, word: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(word, false)
            .map_err(|e| CoreError::Tokenizer(format!("encode {word:?}: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn begin_id(&self) -> u32 {
        self.begin_id
    }

    fn end_id(&self) -> u32 {
        self.end_id
    }

    fn pad_id(&self) -> u32 {
        self.pad_id
    }
}
