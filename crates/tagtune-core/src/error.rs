use thiserror::Error;

/// Errors that can occur while preparing tagged data.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A record has a different number of words and labels.
    #[error("record {record}: {words} words but {labels} labels")]
    MisalignedInput {
        /// Index of the offending record in its corpus.
        record: usize,
        words: usize,
        labels: usize,
    },

    /// A corpus line could not be split into a word and a label.
    #[error("record {record}, line {line}: {reason}")]
    MalformedRecord {
        record: usize,
        line: usize,
        reason: String,
    },

    /// A label outside the fixed B/I/O vocabulary.
    #[error("unknown label {0:?}")]
    UnknownLabel(String),

    /// A worker was assigned no examples.
    #[error("shard for worker {worker} is empty")]
    EmptyShard {
        /// Rank of the worker whose shard is empty.
        worker: usize,
    },

    /// A configuration value is out of range or inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The subword tokenizer failed.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Tensor construction failed.
    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Record index carried by per-record input errors.
    pub fn record(&self) -> Option<usize> {
        match self {
            CoreError::MisalignedInput { record, .. } | CoreError::MalformedRecord { record, .. } => {
                Some(*record)
            }
            _ => None,
        }
    }
}

/// Result type alias for tagtune core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = CoreError::MisalignedInput {
            record: 7,
            words: 3,
            labels: 2,
        };
        assert_eq!(err.to_string(), "record 7: 3 words but 2 labels");
        assert_eq!(err.record(), Some(7));

        let err = CoreError::EmptyShard { worker: 3 };
        assert!(err.to_string().contains("worker 3"));
        assert_eq!(err.record(), None);
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CoreError>();
    }
}
