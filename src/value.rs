//! Checkpoint Value Tree
//!
//! The lazy reader turns a checkpoint into a tree of [`Value`]s. Small items
//! (numbers, strings, short byte strings) are read immediately. Large byte
//! payloads are not: the reader records where they live and hands back a
//! [`Thunk`] that reads them when asked.
//!
//! ## Deferred Values
//!
//! ```text
//! Thunk::Blob    → LazyBlob   { handle, offset, len }      → Value::Bin
//! Thunk::Tensor  → LazyTensor { shape, data: LazyBlob|inline } → Value::Tensor
//! ```
//!
//! Resolving a thunk always performs a fresh positioned read. Nothing is
//! cached, so resolving the same thunk twice costs two reads and yields two
//! equal values. This keeps memory bounded by what the caller holds on to.
//!
//! ## Maps
//!
//! Map entries are either [`Entry::Resolved`] or [`Entry::Deferred`].
//! [`Map::get`] hides the difference: a deferred entry is resolved on every
//! access and handed back the same way as a resolved one.

use crate::error::{FormatError, Result};
use crate::source::{read_range, ReadAt};
use crate::tensor::Tensor;
use byteorder::{ByteOrder, LittleEndian};
use indexmap::IndexMap;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

/// A byte payload that has not been read yet
#[derive(Clone)]
pub struct LazyBlob {
    handle: Arc<dyn ReadAt>,
    offset: u64,
    len: usize,
}

impl LazyBlob {
    pub(crate) fn new(handle: Arc<dyn ReadAt>, offset: u64, len: usize) -> Self {
        Self {
            handle,
            offset,
            len,
        }
    }

    /// Read the payload from the shared handle
    ///
    /// Does not move any reader cursor. Every call re-reads.
    pub fn resolve(&self) -> Result<Vec<u8>> {
        read_range(self.handle.as_ref(), self.offset, self.len)
    }

    /// Absolute offset of the payload
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for LazyBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyBlob")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

/// Where a tensor's bytes come from
#[derive(Clone, Debug)]
pub enum TensorData {
    /// Payload short enough to have been read during parsing
    Inline(Vec<u8>),
    /// Payload still on the byte source
    Deferred(LazyBlob),
}

/// A float32 tensor described in the checkpoint, not yet materialized
#[derive(Clone, Debug)]
pub struct LazyTensor {
    shape: Vec<usize>,
    data: TensorData,
}

impl LazyTensor {
    pub fn new(shape: Vec<usize>, data: TensorData) -> Self {
        Self { shape, data }
    }

    /// Declared shape
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of elements the shape declares
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Payload size in bytes, without reading it
    pub fn byte_len(&self) -> usize {
        match &self.data {
            TensorData::Inline(bytes) => bytes.len(),
            TensorData::Deferred(blob) => blob.len(),
        }
    }

    /// Read the payload and reinterpret it as little-endian f32
    ///
    /// # Returns
    ///
    /// A tensor with the declared shape, or
    /// [`FormatError::ShapeMismatch`] if the payload size disagrees with it
    pub fn resolve(&self) -> Result<Tensor> {
        let bytes: Cow<'_, [u8]> = match &self.data {
            TensorData::Inline(bytes) => Cow::Borrowed(bytes),
            TensorData::Deferred(blob) => Cow::Owned(blob.resolve()?),
        };

        let expected = self
            .shape
            .iter()
            .try_fold(4usize, |acc, &dim| acc.checked_mul(dim));
        if expected != Some(bytes.len()) {
            return Err(FormatError::ShapeMismatch {
                shape: self.shape.clone(),
                bytes: bytes.len(),
                expected: expected.unwrap_or(usize::MAX),
            }
            .into());
        }

        let mut data = vec![0.0f32; bytes.len() / 4];
        LittleEndian::read_f32_into(&bytes, &mut data);
        Ok(Tensor::new(data, self.shape.clone()))
    }
}

/// A deferred computation that produces a [`Value`]
#[derive(Clone, Debug)]
pub enum Thunk {
    Blob(LazyBlob),
    Tensor(LazyTensor),
}

impl Thunk {
    /// Perform the deferred read
    ///
    /// Blobs resolve to [`Value::Bin`], tensors to [`Value::Tensor`].
    pub fn resolve(&self) -> Result<Value> {
        match self {
            Thunk::Blob(blob) => Ok(Value::Bin(blob.resolve()?)),
            Thunk::Tensor(tensor) => Ok(Value::Tensor(tensor.resolve()?)),
        }
    }
}

/// One node of the checkpoint tree
#[derive(Clone, Debug)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    /// Unsigned values above `i64::MAX`
    UInt(u64),
    Float(f64),
    Str(String),
    Bin(Vec<u8>),
    Array(Vec<Value>),
    Map(Map),
    /// A materialized tensor (only produced by resolving a tensor thunk)
    Tensor(Tensor),
    Deferred(Thunk),
}

impl Value {
    /// Short name of the variant, for error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) | Value::UInt(_) => "integer",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bin(_) => "binary",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Tensor(_) => "tensor",
            Value::Deferred(Thunk::Blob(_)) => "deferred binary",
            Value::Deferred(Thunk::Tensor(_)) => "deferred tensor",
        }
    }

    /// Resolve a deferred value; other values are borrowed as they are
    pub fn resolved(&self) -> Result<Cow<'_, Value>> {
        match self {
            Value::Deferred(thunk) => Ok(Cow::Owned(thunk.resolve()?)),
            other => Ok(Cow::Borrowed(other)),
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Value::Deferred(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::UInt(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Int(i) => u64::try_from(*i).ok(),
            Value::UInt(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_usize(&self) -> Option<usize> {
        self.as_u64().and_then(|u| usize::try_from(u).ok())
    }

    /// Numeric value as f64 (integers are converted)
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            Value::UInt(u) => Some(*u as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bin(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Value::Tensor(t) => Some(t),
            _ => None,
        }
    }

    /// The tensor thunk, if this is an unresolved tensor
    pub fn as_lazy_tensor(&self) -> Option<&LazyTensor> {
        match self {
            Value::Deferred(Thunk::Tensor(t)) => Some(t),
            _ => None,
        }
    }
}

/// A map value that may or may not have been read yet
#[derive(Clone, Debug)]
pub enum Entry {
    Resolved(Value),
    Deferred(Thunk),
}

impl Entry {
    /// The entry's value, reading it first if it is deferred
    pub fn resolve(&self) -> Result<Cow<'_, Value>> {
        match self {
            Entry::Resolved(value) => Ok(Cow::Borrowed(value)),
            Entry::Deferred(thunk) => Ok(Cow::Owned(thunk.resolve()?)),
        }
    }

    /// The value if it is already resolved
    pub fn as_resolved(&self) -> Option<&Value> {
        match self {
            Entry::Resolved(value) => Some(value),
            Entry::Deferred(_) => None,
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Entry::Deferred(_))
    }
}

impl From<Value> for Entry {
    fn from(value: Value) -> Self {
        match value {
            Value::Deferred(thunk) => Entry::Deferred(thunk),
            other => Entry::Resolved(other),
        }
    }
}

/// String-keyed map in insertion order
///
/// Inserting an existing key replaces its entry in place.
#[derive(Clone, Debug, Default)]
pub struct Map {
    entries: IndexMap<String, Entry>,
}

impl Map {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: IndexMap::with_capacity(capacity),
        }
    }

    /// Insert an entry; a deferred value becomes a deferred entry
    pub fn insert(&mut self, key: String, value: impl Into<Entry>) {
        self.entries.insert(key, value.into());
    }

    /// Value under `key`, resolving it if it is deferred
    ///
    /// # Example
    ///
    /// ```rust
    /// # use gpt2_lazy::{Map, Value};
    /// let mut map = Map::new();
    /// map.insert("n_head".to_string(), Value::Int(12));
    /// let value = map.get("n_head")?.unwrap();
    /// assert_eq!(value.as_i64(), Some(12));
    /// # Ok::<(), gpt2_lazy::Error>(())
    /// ```
    pub fn get(&self, key: &str) -> Result<Option<Cow<'_, Value>>> {
        self.entry(key).map(Entry::resolve).transpose()
    }

    /// Raw entry under `key`, without resolving
    pub fn entry(&self, key: &str) -> Option<&Entry> {
        self.entries.get(key)
    }

    /// Remove and return the entry under `key`
    pub fn remove(&mut self, key: &str) -> Option<Entry> {
        self.entries.shift_remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entry(key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Entry)> {
        self.entries.iter().map(|(k, e)| (k.as_str(), e))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
