//! Random-Access Byte Sources
//!
//! The checkpoint reader walks the file front to back with a single cursor,
//! but the large payloads it skips over are read later, out of order, by
//! deferred values. Those later reads must not disturb the cursor, so the two
//! kinds of access are kept apart:
//!
//! - [`ReadAt`]: positioned reads against a shared handle. Takes `&self`, never
//!   touches any cursor, safe to call from several threads at once.
//! - [`ByteSource`]: the one owned cursor, used for structural parsing.
//!   Takes `&mut self`, so the borrow checker rules out interleaved parsing.
//!
//! ```text
//!            Arc<dyn ReadAt>
//!           ╱       │       ╲
//!   ByteSource   LazyBlob   LazyBlob ...
//!   (cursor)   (offset,len) (offset,len)
//! ```
//!
//! A deferred value keeps its own `Arc` to the handle, so the file stays open
//! as long as anything may still read from it.

use crate::error::{Error, FormatError, Result};
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;

/// A resource that supports reads at absolute offsets
pub trait ReadAt: Send + Sync {
    /// Fill `buf` with the bytes starting at `offset`
    ///
    /// Fails with [`io::ErrorKind::UnexpectedEof`] if the resource ends first.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Total length in bytes
    fn len(&self) -> io::Result<u64>;

    fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl ReadAt for File {
    #[cfg(unix)]
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        std::os::unix::fs::FileExt::read_exact_at(self, buf, offset)
    }

    #[cfg(windows)]
    fn read_exact_at(&self, offset: u64, mut buf: &mut [u8]) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        let mut offset = offset;
        while !buf.is_empty() {
            match self.seek_read(buf, offset) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }
}

impl ReadAt for Vec<u8> {
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let start = usize::try_from(offset).map_err(|_| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        let end = start
            .checked_add(buf.len())
            .filter(|&end| end <= self.as_slice().len())
            .ok_or(io::ErrorKind::UnexpectedEof)?;
        buf.copy_from_slice(&self[start..end]);
        Ok(())
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.as_slice().len() as u64)
    }
}

/// Read exactly `len` bytes at `offset` from a shared handle
///
/// Reads past the end are reported as [`FormatError::Truncated`]; any other
/// failure is a resource error.
pub(crate) fn read_range(handle: &dyn ReadAt, offset: u64, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    match handle.read_exact_at(offset, &mut buf) {
        Ok(()) => Ok(buf),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            let total = handle.len()?;
            Err(FormatError::Truncated {
                offset,
                needed: len as u64,
                available: total.saturating_sub(offset),
            }
            .into())
        }
        Err(e) => Err(Error::Resource(e)),
    }
}

/// A shared byte resource plus one forward-moving cursor
pub struct ByteSource {
    handle: Arc<dyn ReadAt>,
    cursor: u64,
    len: u64,
}

impl ByteSource {
    /// Wrap a shared handle, with the cursor at offset 0
    pub fn new(handle: Arc<dyn ReadAt>) -> Result<Self> {
        let len = handle.len()?;
        Ok(Self {
            handle,
            cursor: 0,
            len,
        })
    }

    /// Open a file as a byte source
    ///
    /// # Arguments
    ///
    /// * `path` - File to open read-only
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| Error::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Self::new(Arc::new(file))
    }

    /// In-memory byte source
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let len = bytes.len() as u64;
        Self {
            handle: Arc::new(bytes),
            cursor: 0,
            len,
        }
    }

    /// Read `n` bytes at the cursor and advance past them
    pub fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        self.ensure_available(n as u64)?;
        let bytes = read_range(self.handle.as_ref(), self.cursor, n)?;
        self.cursor += n as u64;
        Ok(bytes)
    }

    /// Read a fixed-size array at the cursor
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.ensure_available(N as u64)?;
        let mut buf = [0u8; N];
        match self.handle.read_exact_at(self.cursor, &mut buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(self.truncated(N as u64));
            }
            Err(e) => return Err(Error::Resource(e)),
        }
        self.cursor += N as u64;
        Ok(buf)
    }

    /// Advance the cursor by `n` bytes without reading them
    ///
    /// Skipping past the end of the source is a truncation error.
    pub fn skip(&mut self, n: u64) -> Result<()> {
        self.ensure_available(n)?;
        self.cursor += n;
        Ok(())
    }

    /// Absolute cursor position
    pub fn position(&self) -> u64 {
        self.cursor
    }

    /// Bytes left after the cursor
    pub fn remaining(&self) -> u64 {
        self.len.saturating_sub(self.cursor)
    }

    /// Total length of the underlying resource
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Shared handle for positioned reads
    pub fn handle(&self) -> Arc<dyn ReadAt> {
        Arc::clone(&self.handle)
    }

    fn ensure_available(&self, n: u64) -> Result<()> {
        if n > self.remaining() {
            return Err(self.truncated(n));
        }
        Ok(())
    }

    fn truncated(&self, needed: u64) -> Error {
        FormatError::Truncated {
            offset: self.cursor,
            needed,
            available: self.remaining(),
        }
        .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_reads_advance_cursor() {
        let mut source = ByteSource::from_bytes(vec![1, 2, 3, 4, 5]);
        assert_eq!(source.read(2).unwrap(), vec![1, 2]);
        assert_eq!(source.position(), 2);
        assert_eq!(source.read_array::<1>().unwrap(), [3]);
        assert_eq!(source.remaining(), 2);
    }

    #[test]
    fn test_skip_then_read() {
        let mut source = ByteSource::from_bytes(vec![1, 2, 3, 4, 5]);
        source.skip(3).unwrap();
        assert_eq!(source.read(2).unwrap(), vec![4, 5]);
        assert_eq!(source.remaining(), 0);
    }

    #[test]
    fn test_read_past_end_is_truncation() {
        let mut source = ByteSource::from_bytes(vec![1, 2, 3]);
        source.skip(2).unwrap();
        let err = source.read(4).unwrap_err();
        match err {
            Error::Format(FormatError::Truncated {
                offset,
                needed,
                available,
            }) => {
                assert_eq!((offset, needed, available), (2, 4, 1));
            }
            other => panic!("unexpected error: {other}"),
        }
        // failed read leaves the cursor alone
        assert_eq!(source.position(), 2);
    }

    #[test]
    fn test_skip_past_end_is_truncation() {
        let mut source = ByteSource::from_bytes(vec![0; 8]);
        assert!(source.skip(9).unwrap_err().is_format());
    }

    #[test]
    fn test_positioned_reads_leave_cursor_alone() {
        let mut source = ByteSource::from_bytes((0..10).collect());
        source.skip(4).unwrap();

        let handle = source.handle();
        assert_eq!(read_range(handle.as_ref(), 7, 3).unwrap(), vec![7, 8, 9]);
        assert_eq!(read_range(handle.as_ref(), 0, 2).unwrap(), vec![0, 1]);
        assert_eq!(source.position(), 4);
    }

    #[test]
    fn test_file_source() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"checkpoint").unwrap();
        file.flush().unwrap();

        let mut source = ByteSource::open(file.path()).unwrap();
        assert_eq!(source.len(), 10);
        assert_eq!(source.read(5).unwrap(), b"check".to_vec());
        let handle = source.handle();
        assert_eq!(read_range(handle.as_ref(), 5, 5).unwrap(), b"point".to_vec());
        assert!(read_range(handle.as_ref(), 8, 5).unwrap_err().is_format());
    }

    #[test]
    fn test_handle_length() {
        let empty: Vec<u8> = Vec::new();
        assert!(ReadAt::is_empty(&empty).unwrap());

        let handle: Arc<dyn ReadAt> = Arc::new(vec![1u8, 2, 3]);
        assert_eq!(handle.len().unwrap(), 3);
        assert!(!handle.is_empty().unwrap());
    }

    #[test]
    fn test_open_missing_file() {
        let err = ByteSource::open("/no/such/checkpoint.msgpack").err().unwrap();
        assert!(matches!(err, Error::Open { .. }));
    }
}
