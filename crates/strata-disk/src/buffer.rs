use crate::extent::Extent;
use crate::util::{checked_range, clamped_len};
use crate::{DiskError, Result};

const ZERO_CHUNK: usize = 64 * 1024;

/// Addressable byte-range storage that knows which ranges are actually stored.
///
/// Reads are clamped at `capacity()`; writes past the end either grow the buffer
/// (resizable implementations) or fail with [`DiskError::OutOfRange`].
pub trait Buffer {
    fn can_read(&self) -> bool;
    fn can_write(&self) -> bool;
    fn capacity(&self) -> u64;

    /// Reads up to `buf.len()` bytes at `pos`, returning the number of bytes read.
    fn read(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize>;

    fn write(&mut self, pos: u64, buf: &[u8]) -> Result<()>;

    /// Logically writes `count` zero bytes at `pos`.
    ///
    /// Implementations may deallocate storage instead, as long as subsequent reads
    /// observe zeros.
    fn clear(&mut self, pos: u64, count: u64) -> Result<()> {
        let zeros = vec![0u8; ZERO_CHUNK.min(count as usize)];
        let mut done = 0u64;
        while done < count {
            let chunk = (count - done).min(zeros.len() as u64) as usize;
            self.write(pos + done, &zeros[..chunk])?;
            done += chunk as u64;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()>;

    fn set_capacity(&mut self, capacity: u64) -> Result<()>;

    /// Stored ranges intersecting `[start, start + count)`.
    fn extents_in_range(&mut self, start: u64, count: u64) -> Result<Vec<Extent>>;

    fn extents(&mut self) -> Result<Vec<Extent>> {
        let capacity = self.capacity();
        self.extents_in_range(0, capacity)
    }
}

impl<B: Buffer + ?Sized> Buffer for &mut B {
    fn can_read(&self) -> bool {
        (**self).can_read()
    }

    fn can_write(&self) -> bool {
        (**self).can_write()
    }

    fn capacity(&self) -> u64 {
        (**self).capacity()
    }

    fn read(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        (**self).read(pos, buf)
    }

    fn write(&mut self, pos: u64, buf: &[u8]) -> Result<()> {
        (**self).write(pos, buf)
    }

    fn clear(&mut self, pos: u64, count: u64) -> Result<()> {
        (**self).clear(pos, count)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }

    fn set_capacity(&mut self, capacity: u64) -> Result<()> {
        (**self).set_capacity(capacity)
    }

    fn extents_in_range(&mut self, start: u64, count: u64) -> Result<Vec<Extent>> {
        (**self).extents_in_range(start, count)
    }
}

impl<B: Buffer + ?Sized> Buffer for Box<B> {
    fn can_read(&self) -> bool {
        (**self).can_read()
    }

    fn can_write(&self) -> bool {
        (**self).can_write()
    }

    fn capacity(&self) -> u64 {
        (**self).capacity()
    }

    fn read(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        (**self).read(pos, buf)
    }

    fn write(&mut self, pos: u64, buf: &[u8]) -> Result<()> {
        (**self).write(pos, buf)
    }

    fn clear(&mut self, pos: u64, count: u64) -> Result<()> {
        (**self).clear(pos, count)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }

    fn set_capacity(&mut self, capacity: u64) -> Result<()> {
        (**self).set_capacity(capacity)
    }

    fn extents_in_range(&mut self, start: u64, count: u64) -> Result<Vec<Extent>> {
        (**self).extents_in_range(start, count)
    }
}

/// A fixed-size window `[first, first + length)` of a parent buffer, rebased to zero.
pub struct SubBuffer<B> {
    parent: B,
    first: u64,
    length: u64,
}

impl<B: Buffer> SubBuffer<B> {
    pub fn new(parent: B, first: u64, length: u64) -> Result<Self> {
        let end = first
            .checked_add(length)
            .ok_or(DiskError::InvalidConfig("sub-buffer range overflows"))?;
        if end > parent.capacity() {
            return Err(DiskError::InvalidConfig(
                "sub-buffer extends beyond parent capacity",
            ));
        }
        Ok(Self {
            parent,
            first,
            length,
        })
    }

    pub fn first(&self) -> u64 {
        self.first
    }

    pub fn parent(&self) -> &B {
        &self.parent
    }

    pub fn into_parent(self) -> B {
        self.parent
    }
}

impl<B: Buffer> Buffer for SubBuffer<B> {
    fn can_read(&self) -> bool {
        self.parent.can_read()
    }

    fn can_write(&self) -> bool {
        self.parent.can_write()
    }

    fn capacity(&self) -> u64 {
        self.length
    }

    fn read(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let len = clamped_len(pos, buf.len(), self.length);
        if len == 0 {
            return Ok(0);
        }
        self.parent.read(self.first + pos, &mut buf[..len])
    }

    fn write(&mut self, pos: u64, buf: &[u8]) -> Result<()> {
        checked_range(pos, buf.len() as u64, self.length)?;
        self.parent.write(self.first + pos, buf)
    }

    fn clear(&mut self, pos: u64, count: u64) -> Result<()> {
        checked_range(pos, count, self.length)?;
        self.parent.clear(self.first + pos, count)
    }

    fn flush(&mut self) -> Result<()> {
        self.parent.flush()
    }

    fn set_capacity(&mut self, _capacity: u64) -> Result<()> {
        Err(DiskError::Unsupported("sub-buffer capacity is fixed"))
    }

    fn extents_in_range(&mut self, start: u64, count: u64) -> Result<Vec<Extent>> {
        if start >= self.length {
            return Ok(Vec::new());
        }
        let count = count.min(self.length - start);
        let extents = self.parent.extents_in_range(self.first + start, count)?;
        Ok(extents
            .into_iter()
            .map(|e| Extent::new(e.start - self.first, e.length))
            .collect())
    }
}
