use std::collections::BTreeMap;

use crate::buffer::Buffer;
use crate::extent::{union_in_range, Extent};
use crate::util::{checked_end, clamped_len};
use crate::Result;

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// In-memory buffer that only stores the chunks that have been written.
///
/// Capacity grows on writes past the end. Clearing a range drops every chunk that lies
/// entirely inside it; partially covered chunks are zeroed in place.
pub struct SparseMemoryBuffer {
    chunk_size: usize,
    capacity: u64,
    chunks: BTreeMap<u64, Box<[u8]>>,
}

impl Default for SparseMemoryBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl SparseMemoryBuffer {
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            capacity: 0,
            chunks: BTreeMap::new(),
        }
    }

    /// Builds a buffer whose content is `data`.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut buf = Self::new();
        buf.write(0, data)?;
        Ok(buf)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of chunks currently materialised.
    pub fn allocated_chunks(&self) -> usize {
        self.chunks.len()
    }

    fn chunk_bounds(&self, pos: u64) -> (u64, usize) {
        let cs = self.chunk_size as u64;
        (pos / cs, (pos % cs) as usize)
    }

    fn chunk_mut(&mut self, idx: u64) -> &mut [u8] {
        let chunk_size = self.chunk_size;
        self.chunks
            .entry(idx)
            .or_insert_with(|| vec![0u8; chunk_size].into_boxed_slice())
    }
}

impl Buffer for SparseMemoryBuffer {
    fn can_read(&self) -> bool {
        true
    }

    fn can_write(&self) -> bool {
        true
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn read(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let len = clamped_len(pos, buf.len(), self.capacity);
        let mut done = 0usize;
        while done < len {
            let (idx, within) = self.chunk_bounds(pos + done as u64);
            let chunk_len = (self.chunk_size - within).min(len - done);
            let dst = &mut buf[done..done + chunk_len];
            match self.chunks.get(&idx) {
                Some(chunk) => dst.copy_from_slice(&chunk[within..within + chunk_len]),
                None => dst.fill(0),
            }
            done += chunk_len;
        }
        Ok(len)
    }

    fn write(&mut self, pos: u64, buf: &[u8]) -> Result<()> {
        let end = checked_end(pos, buf.len() as u64)?;
        let mut done = 0usize;
        while done < buf.len() {
            let (idx, within) = self.chunk_bounds(pos + done as u64);
            let chunk_len = (self.chunk_size - within).min(buf.len() - done);
            self.chunk_mut(idx)[within..within + chunk_len]
                .copy_from_slice(&buf[done..done + chunk_len]);
            done += chunk_len;
        }
        self.capacity = self.capacity.max(end);
        Ok(())
    }

    fn clear(&mut self, pos: u64, count: u64) -> Result<()> {
        let end = checked_end(pos, count)?;
        let cs = self.chunk_size as u64;
        let mut cur = pos;
        while cur < end {
            let idx = cur / cs;
            let within = cur % cs;
            let chunk_end = (idx + 1) * cs;
            let piece_end = chunk_end.min(end);
            if within == 0 && piece_end == chunk_end {
                self.chunks.remove(&idx);
            } else if let Some(chunk) = self.chunks.get_mut(&idx) {
                chunk[within as usize..(piece_end - idx * cs) as usize].fill(0);
            }
            cur = piece_end;
        }
        self.capacity = self.capacity.max(end);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn set_capacity(&mut self, capacity: u64) -> Result<()> {
        if capacity < self.capacity {
            let cs = self.chunk_size as u64;
            let first_dropped = capacity.div_ceil(cs);
            self.chunks.split_off(&first_dropped);
            // Bytes past the new end of the last chunk must read back as zero if the
            // buffer grows again.
            let within = (capacity % cs) as usize;
            if within != 0 {
                if let Some(chunk) = self.chunks.get_mut(&(capacity / cs)) {
                    chunk[within..].fill(0);
                }
            }
        }
        self.capacity = capacity;
        Ok(())
    }

    fn extents_in_range(&mut self, start: u64, count: u64) -> Result<Vec<Extent>> {
        let cs = self.chunk_size as u64;
        let chunks = self
            .chunks
            .keys()
            .map(|idx| idx * cs)
            .take_while(|chunk_start| *chunk_start < self.capacity)
            .map(|chunk_start| Extent::new(chunk_start, cs.min(self.capacity - chunk_start)));
        Ok(union_in_range(chunks, start, count))
    }
}
