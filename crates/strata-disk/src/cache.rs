use std::io::SeekFrom;
use std::num::NonZeroUsize;

use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::extent::Extent;
use crate::stream::{resolve_seek, SparseStream};
use crate::util::checked_end;
use crate::{DiskError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockCacheConfig {
    pub block_size: usize,
    pub max_cached_blocks: usize,
}

impl Default for BlockCacheConfig {
    fn default() -> Self {
        Self {
            block_size: 64 * 1024,
            max_cached_blocks: 64,
        }
    }
}

impl BlockCacheConfig {
    pub fn validate(&self) -> Result<NonZeroUsize> {
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(DiskError::InvalidConfig(
                "block_size must be a non-zero power of two",
            ));
        }
        NonZeroUsize::new(self.max_cached_blocks)
            .ok_or(DiskError::InvalidConfig("max_cached_blocks must be > 0"))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// An LRU read cache of fixed-size blocks in front of a [`SparseStream`].
///
/// Writes go straight through to the inner stream and patch any cached copy of the
/// touched blocks, so the inner stream is always up to date.
pub struct BlockCacheStream<S> {
    inner: S,
    block_size: usize,
    max_cached_blocks: NonZeroUsize,
    cache: LruCache<u64, Vec<u8>>,
    stats: BlockCacheStats,
    position: u64,
}

impl<S: SparseStream> BlockCacheStream<S> {
    pub fn new(inner: S, config: BlockCacheConfig) -> Result<Self> {
        let max_cached_blocks = config.validate()?;
        Ok(Self {
            inner,
            block_size: config.block_size,
            max_cached_blocks,
            cache: LruCache::new(max_cached_blocks),
            stats: BlockCacheStats::default(),
            position: 0,
        })
    }

    pub fn stats(&self) -> BlockCacheStats {
        self.stats
    }

    pub fn cached_blocks(&self) -> usize {
        self.cache.len()
    }

    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn load_block(&mut self, block_idx: u64) -> Result<()> {
        if self.cache.get(&block_idx).is_some() {
            self.stats.hits += 1;
            return Ok(());
        }
        self.stats.misses += 1;

        let mut data = vec![0u8; self.block_size];
        let start = block_idx
            .checked_mul(self.block_size as u64)
            .ok_or(DiskError::OffsetOverflow)?;
        self.inner.read_at(start, &mut data)?;

        if self.cache.len() >= self.max_cached_blocks.get() && self.cache.pop_lru().is_some() {
            self.stats.evictions += 1;
        }
        self.cache.put(block_idx, data);
        Ok(())
    }

    fn invalidate(&mut self, start: u64, count: u64) {
        if count == 0 {
            return;
        }
        let bs = self.block_size as u64;
        let first = start / bs;
        let last = (start + count - 1) / bs;
        let keys: Vec<u64> = self
            .cache
            .iter()
            .map(|(k, _)| *k)
            .filter(|k| *k >= first && *k <= last)
            .collect();
        for key in keys {
            self.cache.pop(&key);
        }
    }
}

impl<S: SparseStream> SparseStream for BlockCacheStream<S> {
    fn can_read(&self) -> bool {
        self.inner.can_read()
    }

    fn can_write(&self) -> bool {
        self.inner.can_write()
    }

    fn len(&self) -> u64 {
        self.inner.len()
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.position = resolve_seek(self.position, self.len(), pos)?;
        Ok(self.position)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.inner.can_read() {
            return Err(DiskError::AccessDenied("stream is write-only"));
        }
        let len = self.len();
        if self.position >= len {
            return Ok(0);
        }
        let total = (len - self.position).min(buf.len() as u64) as usize;

        let mut pos = 0usize;
        while pos < total {
            let abs = self.position + pos as u64;
            let block_idx = abs / self.block_size as u64;
            let within = (abs % self.block_size as u64) as usize;
            let chunk_len = (self.block_size - within).min(total - pos);

            self.load_block(block_idx)?;
            let block = self.cache.get(&block_idx).ok_or(DiskError::Io(
                "cache missing block after load_block".into(),
            ))?;
            buf[pos..pos + chunk_len].copy_from_slice(&block[within..within + chunk_len]);
            pos += chunk_len;
        }

        self.position += total as u64;
        Ok(total)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        let start = self.position;
        let end = checked_end(start, buf.len() as u64)?;
        self.inner.write_at(start, buf)?;

        let bs = self.block_size as u64;
        let mut pos = 0usize;
        while pos < buf.len() {
            let abs = start + pos as u64;
            let block_idx = abs / bs;
            let within = (abs % bs) as usize;
            let chunk_len = (self.block_size - within).min(buf.len() - pos);
            // `peek_mut` keeps write-through patches from affecting recency.
            if let Some(block) = self.cache.peek_mut(&block_idx) {
                block[within..within + chunk_len].copy_from_slice(&buf[pos..pos + chunk_len]);
            }
            pos += chunk_len;
        }

        self.position = end;
        Ok(())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        let old = self.inner.len();
        self.inner.set_len(len)?;
        if len < old {
            self.invalidate(len, old - len);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }

    fn extents_in_range(&mut self, start: u64, count: u64) -> Result<Vec<Extent>> {
        self.inner.extents_in_range(start, count)
    }

    fn clear(&mut self, count: u64) -> Result<()> {
        let start = self.position;
        self.inner.seek(SeekFrom::Start(start))?;
        self.inner.clear(count)?;
        self.invalidate(start, count);
        self.position = checked_end(start, count)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.cache.clear();
        self.inner.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::BufferStream;

    fn config(block_size: usize, max_cached_blocks: usize) -> BlockCacheConfig {
        BlockCacheConfig {
            block_size,
            max_cached_blocks,
        }
    }

    #[test]
    fn rejects_invalid_config() {
        let inner = BufferStream::memory();
        assert!(matches!(
            BlockCacheStream::new(inner, config(0, 4)).err().unwrap(),
            DiskError::InvalidConfig(_)
        ));
        let inner = BufferStream::memory();
        assert!(matches!(
            BlockCacheStream::new(inner, config(512, 0)).err().unwrap(),
            DiskError::InvalidConfig(_)
        ));
    }

    #[test]
    fn repeated_reads_hit_the_cache() {
        let inner = BufferStream::from_bytes(&[3u8; 4096]).unwrap();
        let mut cached = BlockCacheStream::new(inner, config(1024, 2)).unwrap();

        let mut buf = [0u8; 100];
        cached.read_at(10, &mut buf).unwrap();
        cached.read_at(200, &mut buf).unwrap();
        assert_eq!(
            cached.stats(),
            BlockCacheStats {
                hits: 1,
                misses: 1,
                evictions: 0
            }
        );

        cached.read_at(1024, &mut buf).unwrap();
        cached.read_at(2048, &mut buf).unwrap();
        assert_eq!(cached.stats().evictions, 1);
        assert_eq!(cached.cached_blocks(), 2);
    }

    #[test]
    fn writes_reach_inner_stream_and_cached_blocks() {
        let inner = BufferStream::from_bytes(&[0u8; 2048]).unwrap();
        let mut cached = BlockCacheStream::new(inner, config(1024, 4)).unwrap();

        let mut buf = [0u8; 8];
        cached.read_at(1000, &mut buf).unwrap(); // caches block 0
        cached.write_at(1020, b"spanning").unwrap();

        cached.read_at(1020, &mut buf).unwrap();
        assert_eq!(&buf, b"spanning");

        let mut inner = cached.into_inner();
        inner.read_at(1020, &mut buf).unwrap();
        assert_eq!(&buf, b"spanning");
    }

    #[test]
    fn reads_stop_at_end_of_inner_stream() {
        let inner = BufferStream::from_bytes(&[1u8; 1500]).unwrap();
        let mut cached = BlockCacheStream::new(inner, config(1024, 4)).unwrap();

        let mut buf = [0u8; 1000];
        assert_eq!(cached.read_at(1000, &mut buf).unwrap(), 500);
        assert_eq!(cached.read_at(1500, &mut buf).unwrap(), 0);
    }
}
