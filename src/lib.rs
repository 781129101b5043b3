//! gpt2-lazy: GPT-2 Inference over a Lazily Loaded Checkpoint
//!
//! Runs a pretrained GPT-2 without ever holding the whole checkpoint in
//! memory. The checkpoint is a MessagePack document whose tensor payloads are
//! left on disk until a forward pass needs them, and text goes in and out
//! through GPT-2's byte-level BPE tokenizer.
//!
//! # Modules
//!
//! - [`byte_unicode`] - Reversible byte ↔ printable character table
//! - [`vocab`] - Token vocabulary and merge ranks
//! - [`tokenizer`] - Byte-level BPE encode/decode
//! - [`source`] - Byte sources with one cursor and shared positioned reads
//! - [`value`] - Checkpoint value tree with deferred payloads
//! - [`msgpack`] - The lazy checkpoint reader
//! - [`tensor`] - Minimal 2D tensor math
//! - [`model`] - Hyperparameters and the GPT-2 forward pass
//! - [`generate`] - Greedy decoding
//!
//! # Example
//!
//! ```rust,no_run
//! use gpt2_lazy::{generate, BPETokenizer, ModelFiles, GPT2};
//! use std::ops::ControlFlow;
//!
//! let files = ModelFiles::new("models", "124M");
//! let tokenizer = BPETokenizer::from_files(&files.encoder, &files.merges)?;
//! let model = GPT2::load(&files)?;
//!
//! let prompt = tokenizer.encode("Alan Turing theorized that computers would one day")?;
//! generate(&model, &prompt, 8, |id| {
//!     print!("{}", tokenizer.decode(&[id]));
//!     ControlFlow::Continue(())
//! })?;
//! # Ok::<(), gpt2_lazy::Error>(())
//! ```

pub mod byte_unicode;
pub mod error;
pub mod generate;
pub mod model;
pub mod msgpack;
pub mod source;
pub mod tensor;
pub mod tokenizer;
pub mod value;
pub mod vocab;

// Re-export main types for convenience
pub use byte_unicode::ByteUnicodeMapping;
pub use error::{Error, FormatError, Result};
pub use generate::{generate, room_left};
pub use model::{HParams, ModelFiles, GPT2};
pub use msgpack::{read_checkpoint, LazyReader, LAZY_THRESHOLD, MAX_DEPTH};
pub use source::{ByteSource, ReadAt};
pub use tensor::Tensor;
pub use tokenizer::{BPETokenizer, TokenizerStats};
pub use value::{Entry, LazyBlob, LazyTensor, Map, TensorData, Thunk, Value};
pub use vocab::{MergeRanks, Vocabulary};
