//! Backing buffer shared between an artifact, the loaded module and every
//! zero-copy view derived from it.
//!
//! A [`BackingBuffer`] is an `Arc` around immutable storage. Cloning it extends
//! the lifetime of the bytes; the memory is released when the last clone (the
//! module, a tensor view, the loader) drops. Storage is either an owned boxed
//! slice or, with the `mmap` feature, a read-only memory map.

use std::{
    fmt,
    fs,
    io::{self, Read},
    ops::{Deref, Range},
    path::Path,
    sync::Arc,
};

enum Storage {
    Owned(Box<[u8]>),
    #[cfg(feature = "mmap")]
    Mapped(memmap2::Mmap),
}

impl Storage {
    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Owned(b) => b,
            #[cfg(feature = "mmap")]
            Self::Mapped(m) => m,
        }
    }
}

/// Immutable, reference-counted block of bytes.
#[derive(Clone)]
pub struct BackingBuffer {
    inner: Arc<Storage>,
}

impl BackingBuffer {
    /// Take ownership of an in-memory vector.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self { inner: Arc::new(Storage::Owned(bytes.into_boxed_slice())) }
    }

    /// Copy a slice into a fresh buffer.
    pub fn copy_from_slice(bytes: &[u8]) -> Self { Self::from_vec(bytes.to_vec()) }

    /// Read exactly `size` bytes from `reader`.
    ///
    /// A short read is an [`io::ErrorKind::UnexpectedEof`] error: a partially
    /// populated buffer is never handed out.
    pub fn from_reader_exact<R: Read>(mut reader: R, size: usize) -> io::Result<Self> {
        let mut bytes = vec![0u8; size];
        reader.read_exact(&mut bytes)?;
        Ok(Self::from_vec(bytes))
    }

    /// Read a whole stream until EOF.
    pub fn from_reader<R: Read>(mut reader: R) -> io::Result<Self> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        Ok(Self::from_vec(bytes))
    }

    /// Read a whole file; the declared size (metadata) must be fully read.
    pub fn read_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = fs::File::open(path)?;
        let size = usize::try_from(file.metadata()?.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "file too large for this platform"))?;
        Self::from_reader_exact(file, size)
    }

    /// Map a file read-only. The mapping lives as long as the last clone.
    ///
    /// The caller must not truncate or rewrite the file while it is mapped.
    #[cfg(feature = "mmap")]
    #[allow(unsafe_code)]
    pub fn map_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = fs::File::open(path)?;
        // SAFETY: read-only mapping; concurrent modification of the file is
        // excluded by the documented contract above.
        let map = unsafe { memmap2::Mmap::map(&file)? };
        Ok(Self { inner: Arc::new(Storage::Mapped(map)) })
    }

    /// Total size in bytes.
    pub fn len(&self) -> usize { self.as_slice().len() }

    /// True if the buffer holds no byte.
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Borrow the whole buffer.
    pub fn as_slice(&self) -> &[u8] { self.inner.as_slice() }

    /// Number of live handles (buffer clones and views).
    pub fn strong_count(&self) -> usize { Arc::strong_count(&self.inner) }

    /// True if both handles share the same storage.
    pub fn ptr_eq(&self, other: &Self) -> bool { Arc::ptr_eq(&self.inner, &other.inner) }

    /// Stable identity of the storage, used to detect aliasing views.
    pub fn storage_id(&self) -> usize { Arc::as_ptr(&self.inner).cast::<u8>() as usize }

    /// Zero-copy view over `range`; `None` if the range is out of bounds.
    pub fn view(&self, range: Range<usize>) -> Option<BufferView> {
        if range.start > range.end || range.end > self.len() {
            return None;
        }
        Some(BufferView { buf: self.clone(), range })
    }

    /// View over the whole buffer.
    pub fn full_view(&self) -> BufferView {
        BufferView { buf: self.clone(), range: 0..self.len() }
    }
}

impl Deref for BackingBuffer {
    type Target = [u8];
    fn deref(&self) -> &[u8] { self.as_slice() }
}

impl AsRef<[u8]> for BackingBuffer {
    fn as_ref(&self) -> &[u8] { self.as_slice() }
}

impl fmt::Debug for BackingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackingBuffer")
            .field("len", &self.len())
            .field("refs", &self.strong_count())
            .finish()
    }
}

impl From<Vec<u8>> for BackingBuffer {
    fn from(v: Vec<u8>) -> Self { Self::from_vec(v) }
}

/// Range of a [`BackingBuffer`]; keeps the whole buffer alive.
#[derive(Clone)]
pub struct BufferView {
    buf: BackingBuffer,
    range: Range<usize>,
}

impl BufferView {
    /// View owning a fresh buffer (for values built in memory).
    pub fn from_vec(bytes: Vec<u8>) -> Self { BackingBuffer::from_vec(bytes).full_view() }

    /// Underlying buffer.
    pub fn buffer(&self) -> &BackingBuffer { &self.buf }

    /// Byte range inside the underlying buffer.
    pub fn range(&self) -> Range<usize> { self.range.clone() }

    /// Length of the view.
    pub fn len(&self) -> usize { self.range.len() }

    /// True if the view is empty.
    pub fn is_empty(&self) -> bool { self.range.is_empty() }

    /// Borrow the viewed bytes.
    pub fn as_slice(&self) -> &[u8] { &self.buf.as_slice()[self.range.clone()] }

    /// Sub-view relative to this view; `None` if out of bounds.
    pub fn slice(&self, range: Range<usize>) -> Option<Self> {
        if range.start > range.end || range.end > self.len() {
            return None;
        }
        let start = self.range.start + range.start;
        Some(Self { buf: self.buf.clone(), range: start..start + range.len() })
    }

    /// True if both views cover the same bytes of the same storage.
    pub fn aliases(&self, other: &Self) -> bool { self.buf.ptr_eq(&other.buf) && self.range == other.range }
}

impl Deref for BufferView {
    type Target = [u8];
    fn deref(&self) -> &[u8] { self.as_slice() }
}

impl AsRef<[u8]> for BufferView {
    fn as_ref(&self) -> &[u8] { self.as_slice() }
}

impl PartialEq for BufferView {
    fn eq(&self, other: &Self) -> bool { self.as_slice() == other.as_slice() }
}

impl Eq for BufferView {}

impl fmt::Debug for BufferView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BufferView({}..{} of {})", self.range.start, self.range.end, self.buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn views_extend_buffer_lifetime() {
        let buf = BackingBuffer::from_vec(vec![1, 2, 3, 4, 5]);
        let view = buf.view(1..4).unwrap();
        assert_eq!(buf.strong_count(), 2);
        drop(buf);
        assert_eq!(&*view, &[2, 3, 4]);
        assert_eq!(view.buffer().strong_count(), 1);
    }

    #[test]
    fn out_of_range_views_are_rejected() {
        let buf = BackingBuffer::from_vec(vec![0; 4]);
        assert!(buf.view(2..5).is_none());
        let v = buf.view(1..3).unwrap();
        assert!(v.slice(1..3).is_none());
        assert_eq!(v.slice(1..2).unwrap().range(), 2..3);
    }

    #[test]
    fn short_read_is_an_io_error() {
        let err = BackingBuffer::from_reader_exact(Cursor::new(vec![0u8; 3]), 8).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn read_file_takes_whole_content() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("blob.bin");
        fs::write(&path, b"abcdef")?;
        let buf = BackingBuffer::read_file(&path)?;
        assert_eq!(buf.as_slice(), b"abcdef");
        Ok(())
    }

    #[cfg(feature = "mmap")]
    #[test]
    fn mapped_file_serves_views_like_an_owned_buffer() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("blob.bin");
        fs::write(&path, b"abcdef")?;
        let mapped = BackingBuffer::map_file(&path)?;
        assert_eq!(mapped.as_slice(), BackingBuffer::read_file(&path)?.as_slice());
        let view = mapped.view(2..5).unwrap();
        drop(mapped);
        assert_eq!(&*view, b"cde");
        Ok(())
    }

    #[test]
    fn aliasing_requires_same_storage_and_range() {
        let a = BackingBuffer::from_vec(vec![9; 8]);
        let b = BackingBuffer::from_vec(vec![9; 8]);
        assert!(a.full_view().aliases(&a.full_view()));
        assert!(!a.full_view().aliases(&b.full_view()));
        assert_eq!(a.full_view(), b.full_view());
    }
}
