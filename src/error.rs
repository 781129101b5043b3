//! Error types
//!
//! Every fallible operation in the crate returns [`Result`]. The variants fall
//! into three families:
//!
//! - **Format errors**: the checkpoint or merge file is malformed (bad tag,
//!   truncated stream, non-scalar map key, payload/shape mismatch)
//! - **Vocabulary mismatches**: the tokenizer produced a token that the loaded
//!   vocabulary does not contain, which means the merge table and vocabulary
//!   come from different models
//! - **Resource errors**: a file could not be opened or a read failed
//!
//! None of these are retried. They propagate to the caller at the point where
//! they occur: during parsing, during encoding, or when a deferred value is
//! resolved.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Reasons a binary stream or text table could not be interpreted
#[derive(Debug, Error)]
pub enum FormatError {
    /// Tag byte outside the supported subset (includes the reserved `0xc1`)
    #[error("unsupported tag byte 0x{tag:02x} at offset {offset}")]
    UnsupportedTag { tag: u8, offset: u64 },

    /// Stream ended before a required read could be satisfied
    #[error("truncated stream: needed {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        offset: u64,
        needed: u64,
        available: u64,
    },

    /// A map key was an array, map or tensor
    #[error("map key at offset {offset} is not a scalar ({kind})")]
    NonScalarKey { offset: u64, kind: &'static str },

    /// Containers nested deeper than the reader allows
    #[error("nesting deeper than {limit} containers at offset {offset}")]
    TooDeep { limit: usize, offset: u64 },

    /// Tensor payload length disagrees with its declared shape
    #[error("tensor payload is {bytes} bytes but shape {shape:?} needs {expected}")]
    ShapeMismatch {
        shape: Vec<usize>,
        bytes: usize,
        expected: usize,
    },

    /// A merge-rank line that is not exactly two tokens
    #[error("malformed merge rule on line {line}: {content:?}")]
    MergeLine { line: usize, content: String },
}

/// Errors produced by this crate
#[derive(Debug, Error)]
pub enum Error {
    #[error("format error: {0}")]
    Format(#[from] FormatError),

    /// Token produced by the merge loop is missing from the vocabulary
    #[error("token {token:?} is not in the vocabulary (tokenizer/model mismatch)")]
    VocabularyMismatch { token: String },

    /// Opening a file failed
    #[error("cannot open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A sequential or positioned read failed
    #[error("read failed: {0}")]
    Resource(#[from] std::io::Error),

    /// JSON configuration or vocabulary could not be parsed
    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Segmentation pattern failed to compile or to run
    #[error("segmentation pattern: {0}")]
    Pattern(#[from] fancy_regex::Error),

    /// Hyperparameters that cannot describe a GPT-2 model
    #[error("invalid hyperparameters: {0}")]
    HParams(String),

    /// Checkpoint tree does not have the layout the model expects
    #[error("checkpoint entry `{path}`: {reason}")]
    Checkpoint { path: String, reason: String },

    /// Prompt leaves no room in the context window
    #[error("prompt is {len} tokens but the context window is {n_ctx}")]
    PromptTooLong { len: usize, n_ctx: usize },

    /// Forward pass or generation called without any tokens
    #[error("cannot run the model on an empty token sequence")]
    EmptyPrompt,

    /// Token id outside the embedding table
    #[error("token id {id} is outside the vocabulary of {n_vocab}")]
    TokenOutOfRange { id: usize, n_vocab: usize },
}

impl Error {
    pub(crate) fn checkpoint(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Checkpoint {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// True for errors caused by malformed input data
    pub fn is_format(&self) -> bool {
        matches!(self, Error::Format(_))
    }
}
