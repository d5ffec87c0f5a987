use std::cell::RefCell;
use std::io::SeekFrom;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::buffer::Buffer;
use crate::extent::{rebase_extents, Extent};
use crate::sparse_buffer::SparseMemoryBuffer;
use crate::util::{checked_end, checked_range, clamped_len};
use crate::{DiskError, Result};

const ZERO_CHUNK: usize = 64 * 1024;

/// Which transfers a stream permits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

impl AccessMode {
    pub fn can_read(self) -> bool {
        matches!(self, AccessMode::Read | AccessMode::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        matches!(self, AccessMode::Write | AccessMode::ReadWrite)
    }
}

/// Whether closing a wrapper also closes the stream it wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ownership {
    Owns,
    DoesNotOwn,
}

/// A positionable byte stream that can report which ranges hold stored data.
///
/// `read` returns fewer bytes than requested only at the end of the stream. Writes
/// either complete in full or fail.
pub trait SparseStream {
    fn can_read(&self) -> bool;
    fn can_write(&self) -> bool;

    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn position(&self) -> u64;

    /// Moves the cursor. Positions past the end are allowed; negative targets are not.
    fn seek(&mut self, pos: SeekFrom) -> Result<u64>;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn write(&mut self, buf: &[u8]) -> Result<()>;

    fn set_len(&mut self, len: u64) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    /// Stored ranges intersecting `[start, start + count)`, in stream coordinates.
    fn extents_in_range(&mut self, start: u64, count: u64) -> Result<Vec<Extent>>;

    fn extents(&mut self) -> Result<Vec<Extent>> {
        let len = self.len();
        self.extents_in_range(0, len)
    }

    /// Writes `count` zero bytes at the cursor.
    fn clear(&mut self, count: u64) -> Result<()> {
        let zeros = vec![0u8; ZERO_CHUNK.min(count as usize)];
        let mut done = 0u64;
        while done < count {
            let chunk = (count - done).min(zeros.len() as u64) as usize;
            self.write(&zeros[..chunk])?;
            done += chunk as u64;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    /// Reads as many bytes as are available at `pos`, up to `buf.len()`.
    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        self.seek(SeekFrom::Start(pos))?;
        let mut done = 0;
        while done < buf.len() {
            let n = self.read(&mut buf[done..])?;
            if n == 0 {
                break;
            }
            done += n;
        }
        Ok(done)
    }

    fn read_exact_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
        let n = self.read_at(pos, buf)?;
        if n != buf.len() {
            return Err(DiskError::OutOfRange {
                offset: pos,
                len: buf.len() as u64,
                capacity: self.len(),
            });
        }
        Ok(())
    }

    fn write_at(&mut self, pos: u64, buf: &[u8]) -> Result<()> {
        self.seek(SeekFrom::Start(pos))?;
        self.write(buf)
    }
}

pub type BoxedStream = Box<dyn SparseStream>;

macro_rules! forward_sparse_stream {
    () => {
        fn can_read(&self) -> bool {
            (**self).can_read()
        }

        fn can_write(&self) -> bool {
            (**self).can_write()
        }

        fn len(&self) -> u64 {
            (**self).len()
        }

        fn position(&self) -> u64 {
            (**self).position()
        }

        fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
            (**self).seek(pos)
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            (**self).read(buf)
        }

        fn write(&mut self, buf: &[u8]) -> Result<()> {
            (**self).write(buf)
        }

        fn set_len(&mut self, len: u64) -> Result<()> {
            (**self).set_len(len)
        }

        fn flush(&mut self) -> Result<()> {
            (**self).flush()
        }

        fn extents_in_range(&mut self, start: u64, count: u64) -> Result<Vec<Extent>> {
            (**self).extents_in_range(start, count)
        }

        fn clear(&mut self, count: u64) -> Result<()> {
            (**self).clear(count)
        }

        fn close(&mut self) -> Result<()> {
            (**self).close()
        }
    };
}

impl<T: SparseStream + ?Sized> SparseStream for &mut T {
    forward_sparse_stream!();
}

impl<T: SparseStream + ?Sized> SparseStream for Box<T> {
    forward_sparse_stream!();
}

/// Resolves a seek request against the current position and stream length.
pub(crate) fn resolve_seek(position: u64, len: u64, pos: SeekFrom) -> Result<u64> {
    let target: i128 = match pos {
        SeekFrom::Start(off) => off as i128,
        SeekFrom::Current(delta) => position as i128 + delta as i128,
        SeekFrom::End(delta) => len as i128 + delta as i128,
    };
    if target < 0 {
        return Err(DiskError::InvalidSeek { position: target });
    }
    u64::try_from(target).map_err(|_| DiskError::OffsetOverflow)
}

/// A cursor plus access mode over a [`Buffer`].
pub struct BufferStream<B> {
    buffer: B,
    position: u64,
    access: AccessMode,
}

impl BufferStream<SparseMemoryBuffer> {
    /// An empty, growable, read-write in-memory stream.
    pub fn memory() -> Self {
        Self {
            buffer: SparseMemoryBuffer::new(),
            position: 0,
            access: AccessMode::ReadWrite,
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Self::new(SparseMemoryBuffer::from_bytes(data)?, AccessMode::ReadWrite)
    }
}

impl<B: Buffer> BufferStream<B> {
    pub fn new(buffer: B, access: AccessMode) -> Result<Self> {
        if access.can_read() && !buffer.can_read() {
            return Err(DiskError::InvalidConfig("buffer is not readable"));
        }
        if access.can_write() && !buffer.can_write() {
            return Err(DiskError::InvalidConfig("buffer is not writable"));
        }
        Ok(Self {
            buffer,
            position: 0,
            access,
        })
    }

    pub fn access(&self) -> AccessMode {
        self.access
    }

    pub fn buffer(&self) -> &B {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut B {
        &mut self.buffer
    }

    pub fn into_buffer(self) -> B {
        self.buffer
    }
}

impl<B: Buffer> SparseStream for BufferStream<B> {
    fn can_read(&self) -> bool {
        self.access.can_read()
    }

    fn can_write(&self) -> bool {
        self.access.can_write()
    }

    fn len(&self) -> u64 {
        self.buffer.capacity()
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.position = resolve_seek(self.position, self.len(), pos)?;
        Ok(self.position)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.access.can_read() {
            return Err(DiskError::AccessDenied("stream is write-only"));
        }
        let n = self.buffer.read(self.position, buf)?;
        self.position += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        if !self.access.can_write() {
            return Err(DiskError::AccessDenied("stream is read-only"));
        }
        let end = checked_end(self.position, buf.len() as u64)?;
        self.buffer.write(self.position, buf)?;
        self.position = end;
        Ok(())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        if !self.access.can_write() {
            return Err(DiskError::AccessDenied("stream is read-only"));
        }
        self.buffer.set_capacity(len)
    }

    fn flush(&mut self) -> Result<()> {
        self.buffer.flush()
    }

    fn extents_in_range(&mut self, start: u64, count: u64) -> Result<Vec<Extent>> {
        self.buffer.extents_in_range(start, count)
    }

    fn clear(&mut self, count: u64) -> Result<()> {
        if !self.access.can_write() {
            return Err(DiskError::AccessDenied("stream is read-only"));
        }
        let end = checked_end(self.position, count)?;
        self.buffer.clear(self.position, count)?;
        self.position = end;
        Ok(())
    }
}

/// A fixed-length window `[first, first + length)` of a parent stream.
pub struct SubStream<S> {
    parent: S,
    ownership: Ownership,
    first: u64,
    length: u64,
    position: u64,
}

impl<S: SparseStream> SubStream<S> {
    pub fn new(parent: S, ownership: Ownership, first: u64, length: u64) -> Result<Self> {
        let end = first
            .checked_add(length)
            .ok_or(DiskError::InvalidConfig("sub-stream range overflows"))?;
        if end > parent.len() {
            return Err(DiskError::InvalidConfig(
                "sub-stream extends beyond parent length",
            ));
        }
        Ok(Self {
            parent,
            ownership,
            first,
            length,
            position: 0,
        })
    }

    pub fn first(&self) -> u64 {
        self.first
    }

    pub fn parent_mut(&mut self) -> &mut S {
        &mut self.parent
    }

    pub fn into_parent(self) -> S {
        self.parent
    }
}

impl<S: SparseStream> SparseStream for SubStream<S> {
    fn can_read(&self) -> bool {
        self.parent.can_read()
    }

    fn can_write(&self) -> bool {
        self.parent.can_write()
    }

    fn len(&self) -> u64 {
        self.length
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.position = resolve_seek(self.position, self.length, pos)?;
        Ok(self.position)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let len = clamped_len(self.position, buf.len(), self.length);
        if len == 0 {
            return Ok(0);
        }
        let n = self
            .parent
            .read_at(self.first + self.position, &mut buf[..len])?;
        self.position += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        checked_range(self.position, buf.len() as u64, self.length)?;
        self.parent.write_at(self.first + self.position, buf)?;
        self.position += buf.len() as u64;
        Ok(())
    }

    fn set_len(&mut self, _len: u64) -> Result<()> {
        Err(DiskError::Unsupported("sub-stream length is fixed"))
    }

    fn flush(&mut self) -> Result<()> {
        self.parent.flush()
    }

    fn extents_in_range(&mut self, start: u64, count: u64) -> Result<Vec<Extent>> {
        if start >= self.length {
            return Ok(Vec::new());
        }
        let count = count.min(self.length - start);
        let parent_extents = self.parent.extents_in_range(self.first + start, count)?;
        Ok(rebase_extents(&parent_extents, self.first, self.length))
    }

    fn close(&mut self) -> Result<()> {
        match self.ownership {
            Ownership::Owns => self.parent.close(),
            Ownership::DoesNotOwn => Ok(()),
        }
    }
}

/// A handle onto one underlying stream; every handle keeps its own cursor.
///
/// The handle made by [`SharedStream::new`] owns the stream and closes it. Handles from
/// [`SharedStream::share`] borrow it: closing one only ends that handle's use, and using
/// a borrowed handle after the owner closed the stream is an error of the inner stream.
pub struct SharedStream {
    inner: Rc<RefCell<BoxedStream>>,
    position: u64,
    ownership: Ownership,
}

impl SharedStream {
    pub fn new(stream: impl SparseStream + 'static) -> Self {
        Self::with_ownership(Box::new(stream), Ownership::Owns)
    }

    pub fn with_ownership(stream: BoxedStream, ownership: Ownership) -> Self {
        Self {
            inner: Rc::new(RefCell::new(stream)),
            position: 0,
            ownership,
        }
    }

    /// A borrowing handle onto the same stream, positioned at 0.
    pub fn share(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
            position: 0,
            ownership: Ownership::DoesNotOwn,
        }
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }
}

impl SparseStream for SharedStream {
    fn can_read(&self) -> bool {
        self.inner.borrow().can_read()
    }

    fn can_write(&self) -> bool {
        self.inner.borrow().can_write()
    }

    fn len(&self) -> u64 {
        self.inner.borrow().len()
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.position = resolve_seek(self.position, self.len(), pos)?;
        Ok(self.position)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut inner = self.inner.borrow_mut();
        inner.seek(SeekFrom::Start(self.position))?;
        let n = inner.read(buf)?;
        self.position += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.seek(SeekFrom::Start(self.position))?;
        inner.write(buf)?;
        self.position += buf.len() as u64;
        Ok(())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.inner.borrow_mut().set_len(len)
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.borrow_mut().flush()
    }

    fn extents_in_range(&mut self, start: u64, count: u64) -> Result<Vec<Extent>> {
        self.inner.borrow_mut().extents_in_range(start, count)
    }

    fn clear(&mut self, count: u64) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.seek(SeekFrom::Start(self.position))?;
        inner.clear(count)?;
        self.position += count;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        match self.ownership {
            Ownership::Owns => self.inner.borrow_mut().close(),
            Ownership::DoesNotOwn => Ok(()),
        }
    }
}

/// Wraps a stream with an ownership flag and an optional read-only guard.
///
/// After `close` every operation fails with [`DiskError::Closed`]; the wrapped stream is
/// only closed if the handle owns it.
pub struct StreamHandle<S> {
    inner: S,
    ownership: Ownership,
    read_only: bool,
    closed: bool,
}

impl<S: SparseStream> StreamHandle<S> {
    pub fn new(inner: S, ownership: Ownership) -> Self {
        Self {
            inner,
            ownership,
            read_only: false,
            closed: false,
        }
    }

    pub fn read_only(inner: S, ownership: Ownership) -> Self {
        Self {
            read_only: true,
            ..Self::new(inner, ownership)
        }
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(DiskError::Closed);
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        self.check_open()?;
        if self.read_only {
            return Err(DiskError::AccessDenied("stream is opened read-only"));
        }
        Ok(())
    }
}

impl<S: SparseStream> SparseStream for StreamHandle<S> {
    fn can_read(&self) -> bool {
        !self.closed && self.inner.can_read()
    }

    fn can_write(&self) -> bool {
        !self.closed && !self.read_only && self.inner.can_write()
    }

    fn len(&self) -> u64 {
        self.inner.len()
    }

    fn position(&self) -> u64 {
        self.inner.position()
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.check_open()?;
        self.inner.seek(pos)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check_open()?;
        self.inner.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.check_writable()?;
        self.inner.write(buf)
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.check_writable()?;
        self.inner.set_len(len)
    }

    fn flush(&mut self) -> Result<()> {
        self.check_open()?;
        if self.read_only {
            return Ok(());
        }
        self.inner.flush()
    }

    fn extents_in_range(&mut self, start: u64, count: u64) -> Result<Vec<Extent>> {
        self.check_open()?;
        self.inner.extents_in_range(start, count)
    }

    fn clear(&mut self, count: u64) -> Result<()> {
        self.check_writable()?;
        self.inner.clear(count)
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.ownership {
            Ownership::Owns => self.inner.close(),
            Ownership::DoesNotOwn => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SubBuffer;

    #[test]
    fn seek_rejects_negative_targets() {
        let mut s = BufferStream::from_bytes(&[0u8; 16]).unwrap();
        assert_eq!(s.seek(SeekFrom::End(-4)).unwrap(), 12);
        assert_eq!(s.seek(SeekFrom::Current(-2)).unwrap(), 10);
        assert_eq!(
            s.seek(SeekFrom::Current(-11)).unwrap_err(),
            DiskError::InvalidSeek { position: -1 }
        );
        // A failed seek leaves the cursor alone.
        assert_eq!(s.position(), 10);
    }

    #[test]
    fn access_mode_is_enforced() {
        let mut ro = BufferStream::new(SparseMemoryBuffer::new(), AccessMode::Read).unwrap();
        assert!(matches!(
            ro.write(b"x").unwrap_err(),
            DiskError::AccessDenied(_)
        ));

        let mut wo = BufferStream::new(SparseMemoryBuffer::new(), AccessMode::Write).unwrap();
        wo.write(b"abc").unwrap();
        let mut buf = [0u8; 3];
        assert!(matches!(
            wo.read(&mut buf).unwrap_err(),
            DiskError::AccessDenied(_)
        ));
    }

    #[test]
    fn read_at_end_returns_zero() {
        let mut s = BufferStream::from_bytes(b"abcdef").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(s.read_at(4, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
        assert_eq!(s.read_at(6, &mut buf).unwrap(), 0);
        assert_eq!(s.read_at(100, &mut buf).unwrap(), 0);
    }

    #[test]
    fn read_exact_at_reports_short_reads() {
        let mut s = BufferStream::from_bytes(b"abcdef").unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(
            s.read_exact_at(4, &mut buf).unwrap_err(),
            DiskError::OutOfRange { .. }
        ));
    }

    #[test]
    fn stream_over_fixed_buffer_cannot_grow() {
        let mut parent = SparseMemoryBuffer::new();
        parent.set_capacity(64).unwrap();
        let sub = SubBuffer::new(&mut parent, 16, 16).unwrap();
        let mut s = BufferStream::new(sub, AccessMode::ReadWrite).unwrap();
        s.seek(SeekFrom::Start(12)).unwrap();
        assert!(matches!(
            s.write(&[1u8; 8]).unwrap_err(),
            DiskError::OutOfRange { .. }
        ));
    }

    #[test]
    fn sub_stream_translates_and_bounds() {
        let mut base = BufferStream::memory();
        base.set_len(1024).unwrap();

        let mut sub = SubStream::new(&mut base, Ownership::DoesNotOwn, 512, 256).unwrap();
        sub.write(b"boot").unwrap();
        assert_eq!(sub.position(), 4);
        sub.seek(SeekFrom::Start(254)).unwrap();
        assert!(matches!(
            sub.write(b"xyz").unwrap_err(),
            DiskError::OutOfRange { .. }
        ));
        assert!(matches!(
            sub.set_len(10).unwrap_err(),
            DiskError::Unsupported(_)
        ));

        let mut buf = [0u8; 4];
        base.read_at(512, &mut buf).unwrap();
        assert_eq!(&buf, b"boot");
    }

    #[test]
    fn sub_stream_rejects_window_past_parent() {
        let base = BufferStream::from_bytes(&[0u8; 100]).unwrap();
        assert!(matches!(
            SubStream::new(base, Ownership::Owns, 90, 20).err().unwrap(),
            DiskError::InvalidConfig(_)
        ));
    }

    #[test]
    fn sub_stream_extents_are_rebased() {
        let mut base = BufferStream::new(
            SparseMemoryBuffer::with_chunk_size(32),
            AccessMode::ReadWrite,
        )
        .unwrap();
        base.set_len(256).unwrap();
        base.write_at(70, &[1u8; 4]).unwrap(); // chunk [64, 96)

        let mut sub = SubStream::new(&mut base, Ownership::DoesNotOwn, 80, 100).unwrap();
        assert_eq!(sub.extents().unwrap(), vec![Extent::new(0, 16)]);
    }

    #[test]
    fn shared_handles_keep_independent_cursors() {
        let mut a = SharedStream::new(BufferStream::from_bytes(b"0123456789").unwrap());
        let mut b = a.share();
        assert_eq!(a.ownership(), Ownership::Owns);
        assert_eq!(b.ownership(), Ownership::DoesNotOwn);

        let mut buf = [0u8; 3];
        a.read(&mut buf).unwrap();
        assert_eq!(&buf, b"012");
        b.seek(SeekFrom::Start(5)).unwrap();
        b.read(&mut buf).unwrap();
        assert_eq!(&buf, b"567");
        a.read(&mut buf).unwrap();
        assert_eq!(&buf, b"345");

        b.write_at(0, b"X").unwrap();
        a.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"X12");
    }

    #[test]
    fn only_the_owning_shared_handle_closes() {
        let inner = StreamHandle::new(BufferStream::from_bytes(b"abc").unwrap(), Ownership::Owns);
        let mut owner = SharedStream::new(inner);
        let mut borrowed = owner.share();
        let mut buf = [0u8; 3];

        borrowed.close().unwrap();
        owner.read_exact_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"abc");

        let mut late = owner.share();
        owner.close().unwrap();
        assert_eq!(late.read_at(0, &mut buf).unwrap_err(), DiskError::Closed);
    }

    #[test]
    fn stream_handle_guards_writes_and_close() {
        let mut h =
            StreamHandle::read_only(BufferStream::from_bytes(b"abc").unwrap(), Ownership::Owns);
        assert!(!h.can_write());
        assert!(matches!(
            h.write_at(0, b"z").unwrap_err(),
            DiskError::AccessDenied(_)
        ));

        h.close().unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(h.read(&mut buf).unwrap_err(), DiskError::Closed);
    }
}
