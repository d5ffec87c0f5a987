//! Native block-allocated image format (`STRATAVD`).
//!
//! Layout:
//! - 512-byte little-endian header at offset 0 (CRC-32 protected)
//! - optional parent locators (NUL separated UTF-8) right after the header
//! - block table: one `u64` physical offset per block, `0` meaning unallocated
//! - data blocks, appended at the end of the file as they are allocated
//!
//! A differencing image stores only the blocks written since it was created; every
//! other block is read from its parent.

use std::io::SeekFrom;

use serde::{Deserialize, Serialize};

use crate::extent::{union_in_range, Extent};
use crate::geometry::Geometry;
use crate::layer::{backing_stream, DiskFormat, VirtualDiskLayer};
use crate::stream::{resolve_seek, AccessMode, BoxedStream, Ownership, SharedStream, SparseStream};
use crate::util::{align_up_u64, checked_range, le_u32, le_u64, put_u32, put_u64};
use crate::{DiskError, Result};

pub const SPARSE_MAGIC: [u8; 8] = *b"STRATAVD";
pub const SPARSE_VERSION: u32 = 1;
pub const SPARSE_HEADER_SIZE: u64 = 512;
pub const DEFAULT_BLOCK_SIZE: u32 = 64 * 1024;

const FLAG_DIFFERENCING: u32 = 1;
const CRC_OFFSET: usize = 92;
const ALIGNMENT: u64 = 512;
const MAX_TABLE_ENTRIES: u64 = 1 << 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SparseLayerConfig {
    pub disk_size_bytes: u64,
    pub block_size_bytes: u32,
    /// Geometry to record in the header; derived from the capacity when absent.
    pub geometry: Option<Geometry>,
}

impl SparseLayerConfig {
    pub fn new(disk_size_bytes: u64) -> Self {
        Self {
            disk_size_bytes,
            block_size_bytes: DEFAULT_BLOCK_SIZE,
            geometry: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_block_size(self.block_size_bytes)
            .map_err(|_| DiskError::InvalidConfig("block size must be a power of two >= 512"))?;
        if self.disk_size_bytes == 0 {
            return Err(DiskError::InvalidConfig("disk size must be > 0"));
        }
        if self.disk_size_bytes % ALIGNMENT != 0 {
            return Err(DiskError::InvalidConfig(
                "disk size must be a multiple of 512 bytes",
            ));
        }
        if self.disk_size_bytes.div_ceil(self.block_size_bytes as u64) > MAX_TABLE_ENTRIES {
            return Err(DiskError::InvalidConfig("too many blocks for block size"));
        }
        Ok(())
    }
}

fn validate_block_size(block_size: u32) -> Result<()> {
    if block_size < ALIGNMENT as u32 || !block_size.is_power_of_two() {
        return Err(DiskError::CorruptStructure("invalid block size"));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseHeader {
    pub flags: u32,
    pub block_size: u32,
    pub disk_size: u64,
    pub table_offset: u64,
    pub table_entries: u64,
    pub geometry: Geometry,
    pub locator_offset: u64,
    pub locator_len: u32,
    pub parent_disk_size: u64,
    pub first_data_offset: u64,
}

impl SparseHeader {
    fn new(config: &SparseLayerConfig, locators: &[u8], parent_disk_size: u64) -> Result<Self> {
        let table_entries = config
            .disk_size_bytes
            .div_ceil(config.block_size_bytes as u64);
        let locator_offset = SPARSE_HEADER_SIZE;
        let locator_len = u32::try_from(locators.len())
            .map_err(|_| DiskError::InvalidConfig("locators too long"))?;
        let table_offset = align_up_u64(locator_offset + locator_len as u64, ALIGNMENT)?;
        let first_data_offset = align_up_u64(table_offset + table_entries * 8, ALIGNMENT)?;
        Ok(Self {
            flags: if parent_disk_size != 0 {
                FLAG_DIFFERENCING
            } else {
                0
            },
            block_size: config.block_size_bytes,
            disk_size: config.disk_size_bytes,
            table_offset,
            table_entries,
            geometry: config
                .geometry
                .unwrap_or_else(|| Geometry::from_capacity(config.disk_size_bytes)),
            locator_offset,
            locator_len,
            parent_disk_size,
            first_data_offset,
        })
    }

    pub fn is_differencing(&self) -> bool {
        self.flags & FLAG_DIFFERENCING != 0
    }

    pub fn block_size_u64(&self) -> u64 {
        self.block_size as u64
    }

    pub fn encode(&self) -> [u8; SPARSE_HEADER_SIZE as usize] {
        let mut buf = [0u8; SPARSE_HEADER_SIZE as usize];
        buf[0..8].copy_from_slice(&SPARSE_MAGIC);
        put_u32(&mut buf, 8, SPARSE_VERSION);
        put_u32(&mut buf, 12, SPARSE_HEADER_SIZE as u32);
        put_u32(&mut buf, 16, self.flags);
        put_u32(&mut buf, 20, self.block_size);
        put_u64(&mut buf, 24, self.disk_size);
        put_u64(&mut buf, 32, self.table_offset);
        put_u64(&mut buf, 40, self.table_entries);
        put_u32(&mut buf, 48, self.geometry.cylinders);
        put_u32(&mut buf, 52, self.geometry.heads_per_cylinder);
        put_u32(&mut buf, 56, self.geometry.sectors_per_track);
        put_u32(&mut buf, 60, self.geometry.bytes_per_sector);
        put_u64(&mut buf, 64, self.locator_offset);
        put_u32(&mut buf, 72, self.locator_len);
        put_u64(&mut buf, 76, self.parent_disk_size);
        put_u64(&mut buf, 84, self.first_data_offset);
        let crc = crc32fast::hash(&buf);
        put_u32(&mut buf, CRC_OFFSET, crc);
        buf
    }

    pub fn decode(buf: &[u8; SPARSE_HEADER_SIZE as usize]) -> Result<Self> {
        if buf[0..8] != SPARSE_MAGIC {
            return Err(DiskError::CorruptStructure("bad sparse image magic"));
        }
        if le_u32(&buf[8..12]) != SPARSE_VERSION {
            return Err(DiskError::CorruptStructure("unsupported sparse image version"));
        }
        if le_u32(&buf[12..16]) as u64 != SPARSE_HEADER_SIZE {
            return Err(DiskError::CorruptStructure("unexpected sparse header size"));
        }

        let stored_crc = le_u32(&buf[CRC_OFFSET..CRC_OFFSET + 4]);
        let mut scratch = *buf;
        put_u32(&mut scratch, CRC_OFFSET, 0);
        if crc32fast::hash(&scratch) != stored_crc {
            return Err(DiskError::CorruptStructure("sparse header checksum mismatch"));
        }

        let header = Self {
            flags: le_u32(&buf[16..20]),
            block_size: le_u32(&buf[20..24]),
            disk_size: le_u64(&buf[24..32]),
            table_offset: le_u64(&buf[32..40]),
            table_entries: le_u64(&buf[40..48]),
            geometry: Geometry::with_sector_size(
                le_u32(&buf[48..52]),
                le_u32(&buf[52..56]),
                le_u32(&buf[56..60]),
                le_u32(&buf[60..64]),
            ),
            locator_offset: le_u64(&buf[64..72]),
            locator_len: le_u32(&buf[72..76]),
            parent_disk_size: le_u64(&buf[76..84]),
            first_data_offset: le_u64(&buf[84..92]),
        };

        validate_block_size(header.block_size)?;
        if header.table_entries != header.disk_size.div_ceil(header.block_size_u64())
            || header.table_entries > MAX_TABLE_ENTRIES
        {
            return Err(DiskError::CorruptStructure("block table size mismatch"));
        }
        let table_end = header
            .table_entries
            .checked_mul(8)
            .and_then(|bytes| header.table_offset.checked_add(bytes))
            .ok_or(DiskError::CorruptStructure("block table out of range"))?;
        if header.table_offset < SPARSE_HEADER_SIZE || header.first_data_offset < table_end {
            return Err(DiskError::CorruptStructure("block table overlaps header or data"));
        }
        let locator_end = header
            .locator_offset
            .checked_add(header.locator_len as u64)
            .ok_or(DiskError::CorruptStructure("parent locators out of range"))?;
        if header.locator_offset < SPARSE_HEADER_SIZE || locator_end > header.table_offset {
            return Err(DiskError::CorruptStructure(
                "parent locators overlap header or block table",
            ));
        }
        if header.is_differencing() && header.parent_disk_size != header.disk_size {
            return Err(DiskError::CorruptStructure(
                "differencing image size differs from parent",
            ));
        }
        Ok(header)
    }

    /// Rejects a header whose metadata extends past the end of an image of `image_len`
    /// bytes.
    pub fn check_fits(&self, image_len: u64) -> Result<()> {
        if self.first_data_offset > image_len {
            return Err(DiskError::CorruptStructure(
                "sparse image is shorter than its metadata",
            ));
        }
        Ok(())
    }
}

fn encode_locators(locations: &[String]) -> Vec<u8> {
    locations.join("\0").into_bytes()
}

fn decode_locators(bytes: &[u8]) -> Result<Vec<String>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| DiskError::CorruptStructure("parent locator is not UTF-8"))?;
    Ok(text
        .split('\0')
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect())
}

/// A `STRATAVD` image used as a disk layer.
pub struct SparseLayer {
    header: SparseHeader,
    parent_locations: Vec<String>,
    stream: SharedStream,
    read_only: bool,
}

impl SparseLayer {
    pub fn open(stream: BoxedStream, ownership: Ownership, access: AccessMode) -> Result<Self> {
        if access.can_write() && !stream.can_write() {
            return Err(DiskError::AccessDenied("backing stream is not writable"));
        }
        let mut stream = backing_stream(stream, ownership, access);

        let mut raw = [0u8; SPARSE_HEADER_SIZE as usize];
        stream.read_exact_at(0, &mut raw)?;
        let header = SparseHeader::decode(&raw)?;
        header.check_fits(stream.len())?;

        let mut locator_bytes = vec![0u8; header.locator_len as usize];
        stream.read_exact_at(header.locator_offset, &mut locator_bytes)?;
        let parent_locations = decode_locators(&locator_bytes)?;
        if header.is_differencing() && parent_locations.is_empty() {
            return Err(DiskError::CorruptStructure(
                "differencing image has no parent locator",
            ));
        }

        Ok(Self {
            header,
            parent_locations,
            stream,
            read_only: !access.can_write(),
        })
    }

    /// Writes a fresh, fully unallocated base image to `stream`.
    pub fn initialize(
        stream: BoxedStream,
        ownership: Ownership,
        config: SparseLayerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let header = SparseHeader::new(&config, &[], 0)?;
        Self::write_new(stream, ownership, header, Vec::new())
    }

    /// Writes a fresh differencing image whose parent has `parent_capacity` bytes.
    pub fn initialize_differencing(
        stream: BoxedStream,
        ownership: Ownership,
        parent_capacity: u64,
        parent_geometry: Geometry,
        block_size_bytes: u32,
        parent_locations: Vec<String>,
    ) -> Result<Self> {
        if parent_locations.is_empty() || parent_locations.iter().any(|l| l.contains('\0')) {
            return Err(DiskError::InvalidConfig(
                "parent locators must be non-empty and NUL free",
            ));
        }
        let config = SparseLayerConfig {
            disk_size_bytes: parent_capacity,
            block_size_bytes,
            geometry: Some(parent_geometry),
        };
        config.validate()?;
        let locators = encode_locators(&parent_locations);
        let header = SparseHeader::new(&config, &locators, parent_capacity)?;
        Self::write_new(stream, ownership, header, parent_locations)
    }

    fn write_new(
        mut stream: BoxedStream,
        ownership: Ownership,
        header: SparseHeader,
        parent_locations: Vec<String>,
    ) -> Result<Self> {
        stream.set_len(0)?;
        stream.write_at(0, &header.encode())?;
        stream.write_at(
            header.locator_offset,
            &encode_locators(&parent_locations),
        )?;
        // Zero-filled table: every block starts unallocated.
        stream.set_len(header.first_data_offset)?;
        stream.flush()?;

        tracing::debug!(
            disk_size = header.disk_size,
            block_size = header.block_size,
            differencing = header.is_differencing(),
            "initialized sparse image"
        );

        Ok(Self {
            header,
            parent_locations,
            stream: backing_stream(stream, ownership, AccessMode::ReadWrite),
            read_only: false,
        })
    }

    pub fn header(&self) -> &SparseHeader {
        &self.header
    }

    fn load_table(&mut self) -> Result<Vec<u64>> {
        let mut raw = vec![0u8; (self.header.table_entries * 8) as usize];
        self.stream.read_exact_at(self.header.table_offset, &mut raw)?;
        let table: Vec<u64> = raw.chunks_exact(8).map(le_u64).collect();

        let bs = self.header.block_size_u64();
        for &phys in table.iter().filter(|p| **p != 0) {
            if phys < self.header.first_data_offset || phys % ALIGNMENT != 0 {
                return Err(DiskError::CorruptStructure("block table entry out of place"));
            }
            if phys.checked_add(bs).map_or(true, |end| end > self.stream.len()) {
                return Err(DiskError::CorruptStructure("block table entry past end of image"));
            }
        }
        Ok(table)
    }
}

impl VirtualDiskLayer for SparseLayer {
    fn format(&self) -> DiskFormat {
        DiskFormat::Sparse
    }

    fn capacity(&self) -> u64 {
        self.header.disk_size
    }

    fn geometry(&self) -> Option<Geometry> {
        Some(self.header.geometry)
    }

    fn is_sparse(&self) -> bool {
        true
    }

    fn needs_parent(&self) -> bool {
        self.header.is_differencing()
    }

    fn parent_locations(&self) -> Vec<String> {
        self.parent_locations.clone()
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn open_content(&mut self, parent: Option<BoxedStream>) -> Result<BoxedStream> {
        let parent = match (self.needs_parent(), parent) {
            (true, None) => {
                return Err(DiskError::InvalidConfig(
                    "differencing layer needs a parent stream",
                ))
            }
            (false, Some(_)) => {
                return Err(DiskError::InvalidConfig("base layer cannot take a parent"))
            }
            (_, parent) => parent,
        };
        if let Some(p) = &parent {
            if p.len() != self.header.disk_size {
                return Err(DiskError::CorruptStructure(
                    "differencing image size differs from parent",
                ));
            }
        }

        let table = self.load_table()?;
        let next_free = align_up_u64(
            self.stream.len().max(self.header.first_data_offset),
            ALIGNMENT,
        )?;
        Ok(Box::new(SparseLayerStream {
            file: self.stream.share(),
            header: self.header.clone(),
            table,
            parent,
            next_free,
            position: 0,
            read_only: self.read_only,
        }))
    }

    fn close(&mut self) -> Result<()> {
        self.stream.close()
    }
}

/// Content stream of a [`SparseLayer`], optionally layered over its parent's content.
pub struct SparseLayerStream {
    file: SharedStream,
    header: SparseHeader,
    table: Vec<u64>,
    parent: Option<BoxedStream>,
    next_free: u64,
    position: u64,
    read_only: bool,
}

impl SparseLayerStream {
    pub fn is_block_allocated(&self, block_idx: u64) -> bool {
        self.table
            .get(block_idx as usize)
            .is_some_and(|phys| *phys != 0)
    }

    pub fn allocated_blocks(&self) -> usize {
        self.table.iter().filter(|p| **p != 0).count()
    }

    fn block_len(&self, block_idx: u64) -> u64 {
        let start = block_idx * self.header.block_size_u64();
        (self.header.disk_size - start).min(self.header.block_size_u64())
    }

    /// Reads from the parent, or zeros for a base image.
    fn read_backing(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match self.parent.as_mut() {
            Some(parent) => parent.read_exact_at(offset, buf),
            None => {
                buf.fill(0);
                Ok(())
            }
        }
    }

    fn allocate_block(&mut self, block_idx: u64) -> Result<u64> {
        let phys = self.next_free;
        let bs = self.header.block_size_u64();
        self.next_free = phys.checked_add(bs).ok_or(DiskError::OffsetOverflow)?;
        self.file.set_len(self.next_free)?;
        self.file.write_at(
            self.header.table_offset + block_idx * 8,
            &phys.to_le_bytes(),
        )?;
        self.table[block_idx as usize] = phys;
        Ok(phys)
    }
}

impl SparseStream for SparseLayerStream {
    fn can_read(&self) -> bool {
        true
    }

    fn can_write(&self) -> bool {
        !self.read_only
    }

    fn len(&self) -> u64 {
        self.header.disk_size
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.position = resolve_seek(self.position, self.header.disk_size, pos)?;
        Ok(self.position)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let len = self.header.disk_size;
        if self.position >= len {
            return Ok(0);
        }
        let total = (len - self.position).min(buf.len() as u64) as usize;

        let bs = self.header.block_size_u64();
        let mut pos = 0usize;
        while pos < total {
            let abs = self.position + pos as u64;
            let block_idx = abs / bs;
            let within = abs % bs;
            let chunk_len = ((bs - within) as usize).min(total - pos);
            let dst = &mut buf[pos..pos + chunk_len];

            let phys = self.table[block_idx as usize];
            if phys != 0 {
                self.file.read_exact_at(phys + within, dst)?;
            } else {
                self.read_backing(abs, dst)?;
            }
            pos += chunk_len;
        }

        self.position += total as u64;
        Ok(total)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(DiskError::AccessDenied("layer is opened read-only"));
        }
        checked_range(self.position, buf.len() as u64, self.header.disk_size)?;

        let bs = self.header.block_size_u64();
        let mut pos = 0usize;
        while pos < buf.len() {
            let abs = self.position + pos as u64;
            let block_idx = abs / bs;
            let within = abs % bs;
            let chunk_len = ((bs - within) as usize).min(buf.len() - pos);
            let src = &buf[pos..pos + chunk_len];

            let phys = self.table[block_idx as usize];
            if phys != 0 {
                self.file.write_at(phys + within, src)?;
                pos += chunk_len;
                continue;
            }

            // New block: seed it from the parent so bytes outside this write keep the
            // parent's content.
            let block_len = self.block_len(block_idx);
            let mut block = vec![0u8; bs as usize];
            if within != 0 || chunk_len as u64 != block_len {
                self.read_backing(block_idx * bs, &mut block[..block_len as usize])?;
            }
            block[within as usize..within as usize + chunk_len].copy_from_slice(src);

            let phys = self.allocate_block(block_idx)?;
            self.file.write_at(phys, &block)?;
            pos += chunk_len;
        }

        self.position += buf.len() as u64;
        Ok(())
    }

    fn set_len(&mut self, _len: u64) -> Result<()> {
        Err(DiskError::Unsupported("sparse layer capacity is fixed"))
    }

    fn flush(&mut self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.file.flush()
    }

    fn extents_in_range(&mut self, start: u64, count: u64) -> Result<Vec<Extent>> {
        let bs = self.header.block_size_u64();
        let mut stored: Vec<Extent> = (0u64..)
            .zip(self.table.iter())
            .filter(|(_, phys)| **phys != 0)
            .map(|(idx, _)| Extent::new(idx * bs, self.block_len(idx)))
            .collect();
        if let Some(parent) = self.parent.as_mut() {
            stored.extend(parent.extents_in_range(start, count)?);
        }
        Ok(union_in_range(stored, start, count))
    }

    fn close(&mut self) -> Result<()> {
        if let Some(parent) = self.parent.as_mut() {
            parent.close()?;
        }
        self.file.close()
    }
}
