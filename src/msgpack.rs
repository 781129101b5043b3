//! Lazy MessagePack Checkpoint Reader
//!
//! GPT-2 checkpoints are stored as a single MessagePack document: a tree of
//! maps and arrays whose leaves are hyperparameters and tensor descriptors.
//! The tensor payloads add up to hundreds of megabytes, so the reader does not
//! load them. It walks the structure once and leaves every large byte string
//! on disk behind a deferred value.
//!
//! ## Supported Tags
//!
//! Only the subset of MessagePack that checkpoints use is understood:
//!
//! ```text
//! 0x00..=0x7f  positive fixint         0xc4/c5/c6  bin 8/16/32
//! 0x80..=0x8f  fixmap                  0xca/cb     float 32/64
//! 0x90..=0x9f  fixarray                0xcc..=cf   uint 8/16/32/64
//! 0xa0..=0xbf  fixstr                  0xd0..=d3   int 8/16/32/64
//! 0xe0..=0xff  negative fixint         0xd9/da/db  str 8/16/32
//! 0xc0 nil, 0xc2 false, 0xc3 true      0xdc/dd     array 16/32
//!                                      0xde/df     map 16/32
//! ```
//!
//! Anything else, including the reserved `0xc1` and the ext family, is a
//! format error. Negative fixints decode as `-(tag & 0x1f)`, the checkpoint
//! writer's convention.
//!
//! ## Deferral
//!
//! - A byte string shorter than [`LAZY_THRESHOLD`] is read in place.
//! - A longer one is skipped: the reader records its absolute offset and
//!   length and moves on. The result is a [`Thunk::Blob`].
//! - A map shaped like `{nd: true, type: "<f4", shape: [...], data: <bin>}`
//!   is not returned as a map at all. It becomes a single [`Thunk::Tensor`]
//!   that reads `data` and reinterprets it as float32 with the given shape.
//!
//! ## Example
//!
//! ```rust,no_run
//! use gpt2_lazy::read_checkpoint;
//!
//! let tree = read_checkpoint("models/124M/124M.msgpack")?;
//! let root = tree.as_map().expect("checkpoint root is a map");
//! // Only now is the token embedding read from disk
//! let wte = root.get("wte")?.expect("wte present");
//! println!("wte shape: {:?}", wte.as_tensor().map(|t| &t.shape));
//! # Ok::<(), gpt2_lazy::Error>(())
//! ```

use crate::error::{FormatError, Result};
use crate::source::ByteSource;
use crate::value::{Entry, LazyBlob, LazyTensor, Map, TensorData, Thunk, Value};
use byteorder::{BigEndian, ByteOrder};
use std::path::Path;

/// Byte strings at least this long are deferred
pub const LAZY_THRESHOLD: usize = 64;

/// Maximum container nesting
pub const MAX_DEPTH: usize = 256;

/// Cap on up-front allocation for a container header's declared length
const MAX_PREALLOC: usize = 4096;

/// Streaming reader that defers large payloads
pub struct LazyReader {
    source: ByteSource,
    depth: usize,
    deferred: usize,
    deferred_bytes: u64,
}

impl LazyReader {
    /// Create a reader positioned at the source's cursor
    pub fn new(source: ByteSource) -> Self {
        Self {
            source,
            depth: 0,
            deferred: 0,
            deferred_bytes: 0,
        }
    }

    /// Open a checkpoint file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(ByteSource::open(path)?))
    }

    /// Parse one complete value at the cursor
    ///
    /// # Returns
    ///
    /// The value tree with large payloads deferred, or the first format or
    /// resource error encountered. Nothing partial is returned on error.
    pub fn parse(&mut self) -> Result<Value> {
        self.depth = 0;
        self.parse_value()
    }

    /// Number of deferred payloads created so far
    pub fn deferred_count(&self) -> usize {
        self.deferred
    }

    /// Total bytes left on the source behind deferred payloads
    pub fn deferred_bytes(&self) -> u64 {
        self.deferred_bytes
    }

    /// Cursor position of the underlying source
    pub fn position(&self) -> u64 {
        self.source.position()
    }

    /// Finish reading and report how many bytes follow the root value
    ///
    /// Trailing bytes are not an error; they are logged at debug level.
    pub fn finish(self) -> u64 {
        let trailing = self.source.remaining();
        if trailing > 0 {
            log::debug!(
                "{} trailing bytes after root value at offset {}",
                trailing,
                self.source.position()
            );
        }
        trailing
    }

    fn parse_value(&mut self) -> Result<Value> {
        let offset = self.source.position();
        let tag = self.read_u8()?;

        match tag {
            0x00..=0x7f => Ok(Value::Int(tag as i64)),
            0x80..=0x8f => self.parse_map((tag & 0x0f) as usize),
            0x90..=0x9f => self.parse_array((tag & 0x0f) as usize),
            0xa0..=0xbf => self.parse_str((tag & 0x1f) as usize),
            0xe0..=0xff => Ok(Value::Int(-((tag & 0x1f) as i64))),

            0xc0 => Ok(Value::Nil),
            0xc2 => Ok(Value::Bool(false)),
            0xc3 => Ok(Value::Bool(true)),

            0xc4 => {
                let len = self.read_u8()? as usize;
                self.parse_bin(len)
            }
            0xc5 => {
                let len = self.read_u16()? as usize;
                self.parse_bin(len)
            }
            0xc6 => {
                let len = self.read_u32()? as usize;
                self.parse_bin(len)
            }

            0xca => Ok(Value::Float(BigEndian::read_f32(&self.source.read_array::<4>()?) as f64)),
            0xcb => Ok(Value::Float(BigEndian::read_f64(&self.source.read_array::<8>()?))),

            0xcc => Ok(Value::Int(self.read_u8()? as i64)),
            0xcd => Ok(Value::Int(self.read_u16()? as i64)),
            0xce => Ok(Value::Int(self.read_u32()? as i64)),
            0xcf => {
                let value = BigEndian::read_u64(&self.source.read_array::<8>()?);
                Ok(match i64::try_from(value) {
                    Ok(signed) => Value::Int(signed),
                    Err(_) => Value::UInt(value),
                })
            }
            0xd0 => Ok(Value::Int(self.read_u8()? as i8 as i64)),
            0xd1 => Ok(Value::Int(BigEndian::read_i16(&self.source.read_array::<2>()?) as i64)),
            0xd2 => Ok(Value::Int(BigEndian::read_i32(&self.source.read_array::<4>()?) as i64)),
            0xd3 => Ok(Value::Int(BigEndian::read_i64(&self.source.read_array::<8>()?))),

            0xd9 => {
                let len = self.read_u8()? as usize;
                self.parse_str(len)
            }
            0xda => {
                let len = self.read_u16()? as usize;
                self.parse_str(len)
            }
            0xdb => {
                let len = self.read_u32()? as usize;
                self.parse_str(len)
            }
            0xdc => {
                let len = self.read_u16()? as usize;
                self.parse_array(len)
            }
            0xdd => {
                let len = self.read_u32()? as usize;
                self.parse_array(len)
            }
            0xde => {
                let len = self.read_u16()? as usize;
                self.parse_map(len)
            }
            0xdf => {
                let len = self.read_u32()? as usize;
                self.parse_map(len)
            }

            _ => Err(FormatError::UnsupportedTag { tag, offset }.into()),
        }
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.source.read_array::<1>()?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        Ok(BigEndian::read_u16(&self.source.read_array::<2>()?))
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(BigEndian::read_u32(&self.source.read_array::<4>()?))
    }

    fn parse_str(&mut self, len: usize) -> Result<Value> {
        let bytes = self.source.read(len)?;
        Ok(Value::Str(String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Read a short byte string now, or defer a long one
    fn parse_bin(&mut self, len: usize) -> Result<Value> {
        if len < LAZY_THRESHOLD {
            return Ok(Value::Bin(self.source.read(len)?));
        }

        let offset = self.source.position();
        self.source.skip(len as u64)?;
        self.deferred += 1;
        self.deferred_bytes += len as u64;

        Ok(Value::Deferred(Thunk::Blob(LazyBlob::new(
            self.source.handle(),
            offset,
            len,
        ))))
    }

    fn descend(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(FormatError::TooDeep {
                limit: MAX_DEPTH,
                offset: self.source.position(),
            }
            .into());
        }
        Ok(())
    }

    fn parse_array(&mut self, len: usize) -> Result<Value> {
        self.descend()?;
        let mut items = Vec::with_capacity(len.min(MAX_PREALLOC));
        for _ in 0..len {
            items.push(self.parse_value()?);
        }
        self.depth -= 1;
        Ok(Value::Array(items))
    }

    fn parse_map(&mut self, len: usize) -> Result<Value> {
        self.descend()?;
        let mut map = Map::with_capacity(len.min(MAX_PREALLOC));
        for _ in 0..len {
            let key_offset = self.source.position();
            let key = self.parse_value()?;
            let key = map_key(key, key_offset)?;
            let value = self.parse_value()?;
            map.insert(key, value);
        }
        self.depth -= 1;

        match into_tensor_descriptor(map) {
            Ok(tensor) => Ok(Value::Deferred(Thunk::Tensor(tensor))),
            Err(map) => Ok(Value::Map(map)),
        }
    }
}

/// Convert a parsed key to the map's string key
///
/// Deferred keys are resolved first. Containers and tensors are rejected.
fn map_key(key: Value, offset: u64) -> Result<String> {
    let key = match key {
        Value::Deferred(thunk) => thunk.resolve()?,
        other => other,
    };

    match key {
        Value::Str(s) => Ok(s),
        Value::Int(i) => Ok(i.to_string()),
        Value::UInt(u) => Ok(u.to_string()),
        Value::Float(f) => Ok(f.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Nil => Ok("null".to_string()),
        Value::Bin(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        other => Err(FormatError::NonScalarKey {
            offset,
            kind: other.kind(),
        }
        .into()),
    }
}

/// Turn a tensor-descriptor map into a lazy tensor, or hand the map back
///
/// The map qualifies when `nd` is `true`, `type` is `"<f4"`, `shape` is an
/// array of non-negative integers and `data` is a byte string. Other keys
/// are ignored.
fn into_tensor_descriptor(mut map: Map) -> std::result::Result<LazyTensor, Map> {
    let field = |key: &str| map.entry(key).and_then(Entry::as_resolved);

    let is_nd = matches!(field("nd"), Some(Value::Bool(true)));
    let is_f4 = matches!(field("type"), Some(Value::Str(t)) if t == "<f4");
    let shape: Option<Vec<usize>> = match field("shape") {
        Some(Value::Array(dims)) => dims.iter().map(Value::as_usize).collect(),
        _ => None,
    };
    let has_data = matches!(
        map.entry("data"),
        Some(Entry::Resolved(Value::Bin(_))) | Some(Entry::Deferred(Thunk::Blob(_)))
    );

    let shape = match shape {
        Some(shape) if is_nd && is_f4 && has_data => shape,
        _ => return Err(map),
    };

    let data = match map.remove("data") {
        Some(Entry::Resolved(Value::Bin(bytes))) => TensorData::Inline(bytes),
        Some(Entry::Deferred(Thunk::Blob(blob))) => TensorData::Deferred(blob),
        _ => return Err(map),
    };

    Ok(LazyTensor::new(shape, data))
}

/// Parse a checkpoint file into a value tree
///
/// Opens the file, parses the root value and logs how much was deferred. The
/// file handle stays open for as long as any deferred value in the tree is
/// alive.
///
/// # Arguments
///
/// * `path` - Path to the `.msgpack` checkpoint
pub fn read_checkpoint<P: AsRef<Path>>(path: P) -> Result<Value> {
    let path = path.as_ref();
    let mut reader = LazyReader::open(path)?;
    let tree = reader.parse()?;

    log::info!(
        "parsed {}: {} deferred payloads ({:.1} MiB left on disk)",
        path.display(),
        reader.deferred_count(),
        reader.deferred_bytes() as f64 / (1024.0 * 1024.0)
    );
    reader.finish();

    Ok(tree)
}
