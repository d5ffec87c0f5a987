//! BIOS master boot record partition table (four primary entries in sector 0).

use uuid::Uuid;

use crate::geometry::{ChsAddress, Geometry};
use crate::partitions::alloc::{
    alignment_in_sectors, allocate_aligned, find_gap, overlaps_any,
};
use crate::partitions::types::{PartitionInfo, PartitionType, WellKnownPartitionType};
use crate::partitions::{PartitionScheme, PartitionTable};
use crate::stream::SparseStream;
use crate::util::{le_u32, put_u32};
use crate::{DiskError, Result};

pub const SECTOR_SIZE: u64 = 512;
pub const PRIMARY_SLOTS: usize = 4;

const TABLE_OFFSET: usize = 0x1BE;
const ENTRY_SIZE: usize = 16;
const SIGNATURE_OFFSET: usize = 0x1FE;
const DISK_SIGNATURE_OFFSET: usize = 0x1B8;
const STATUS_ACTIVE: u8 = 0x80;
const MAX_CHS_CYLINDER: u32 = 1023;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BiosRecord {
    status: u8,
    start_chs: [u8; 3],
    partition_type: u8,
    end_chs: [u8; 3],
    lba_start: u32,
    lba_count: u32,
}

impl BiosRecord {
    fn parse(raw: &[u8]) -> Self {
        Self {
            status: raw[0],
            start_chs: [raw[1], raw[2], raw[3]],
            partition_type: raw[4],
            end_chs: [raw[5], raw[6], raw[7]],
            lba_start: le_u32(&raw[8..12]),
            lba_count: le_u32(&raw[12..16]),
        }
    }

    fn encode(&self, raw: &mut [u8]) {
        raw[0] = self.status;
        raw[1..4].copy_from_slice(&self.start_chs);
        raw[4] = self.partition_type;
        raw[5..8].copy_from_slice(&self.end_chs);
        put_u32(raw, 8, self.lba_start);
        put_u32(raw, 12, self.lba_count);
    }

    fn is_empty(&self) -> bool {
        self.partition_type == 0 || self.lba_count == 0
    }

    fn first_sector(&self) -> u64 {
        self.lba_start as u64
    }

    fn last_sector(&self) -> u64 {
        self.lba_start as u64 + self.lba_count as u64 - 1
    }

    fn info(&self) -> PartitionInfo {
        PartitionInfo {
            first_sector: self.first_sector(),
            last_sector: self.last_sector(),
            partition_type: PartitionType::Bios(self.partition_type),
            is_active: self.status == STATUS_ACTIVE,
            name: None,
            unique_id: None,
        }
    }

    fn end_head_sector(&self) -> (u32, u32) {
        (self.end_chs[0] as u32, (self.end_chs[1] & 0x3F) as u32)
    }
}

/// Packs a CHS address into the 3-byte MBR form, saturating past cylinder 1023.
fn encode_chs(chs: ChsAddress, geometry: &Geometry) -> [u8; 3] {
    let chs = if chs.cylinder > MAX_CHS_CYLINDER {
        ChsAddress::new(
            MAX_CHS_CYLINDER,
            geometry.heads_per_cylinder.saturating_sub(1),
            geometry.sectors_per_track,
        )
    } else {
        chs
    };
    let head = chs.head.min(0xFF) as u8;
    let sector = (chs.sector.min(0x3F) as u8) | (((chs.cylinder >> 2) & 0xC0) as u8);
    [head, sector, (chs.cylinder & 0xFF) as u8]
}

/// Records in slot order, with the slot index, skipping empty slots.
fn parse_records(sector: &[u8]) -> Vec<(usize, BiosRecord)> {
    (0..PRIMARY_SLOTS)
        .map(|slot| {
            let off = TABLE_OFFSET + slot * ENTRY_SIZE;
            (slot, BiosRecord::parse(&sector[off..off + ENTRY_SIZE]))
        })
        .filter(|(_, r)| !r.is_empty())
        .collect()
}

fn read_sector0<S: SparseStream + ?Sized>(stream: &mut S) -> Result<[u8; SECTOR_SIZE as usize]> {
    let mut sector = [0u8; SECTOR_SIZE as usize];
    stream.read_exact_at(0, &mut sector)?;
    Ok(sector)
}

fn looks_like_mbr(sector: &[u8]) -> bool {
    if sector[SIGNATURE_OFFSET] != 0x55 || sector[SIGNATURE_OFFSET + 1] != 0xAA {
        return false;
    }
    let mut spans: Vec<(u64, u64)> = Vec::new();
    for slot in 0..PRIMARY_SLOTS {
        let off = TABLE_OFFSET + slot * ENTRY_SIZE;
        let record = BiosRecord::parse(&sector[off..off + ENTRY_SIZE]);
        if record.status != 0 && record.status != STATUS_ACTIVE {
            return false;
        }
        if record.is_empty() {
            continue;
        }
        let span = (record.first_sector(), record.last_sector());
        if overlaps_any(&spans, span.0, span.1) {
            return false;
        }
        spans.push(span);
    }
    true
}

/// Whether `stream` starts with a plausible MBR partition table.
pub fn detect<S: SparseStream + ?Sized>(stream: &mut S) -> bool {
    if stream.len() < SECTOR_SIZE {
        return false;
    }
    match read_sector0(stream) {
        Ok(sector) => looks_like_mbr(&sector),
        Err(_) => false,
    }
}

/// Infers the geometry the table was written with from its largest end head/sector.
pub fn detect_geometry<S: SparseStream + ?Sized>(stream: &mut S) -> Option<Geometry> {
    if !detect(stream) {
        return None;
    }
    let sector = read_sector0(stream).ok()?;
    let (max_head, max_sector) = parse_records(&sector)
        .iter()
        .map(|(_, r)| r.end_head_sector())
        .fold((0u32, 0u32), |(h, s), (rh, rs)| (h.max(rh), s.max(rs)));
    if max_sector == 0 {
        return None;
    }
    let heads = max_head + 1;
    let cylinder_bytes = heads as u64 * max_sector as u64 * SECTOR_SIZE;
    let cylinders = stream.len().div_ceil(cylinder_bytes);
    Some(Geometry::new(
        cylinders.min(u32::MAX as u64) as u32,
        heads,
        max_sector,
    ))
}

/// BIOS partition table over a disk's content stream.
///
/// Sector 0 is re-read for every operation and written back (then flushed) before a
/// mutating call returns.
pub struct BiosPartitionTable<S> {
    stream: S,
    geometry: Geometry,
}

impl<S: SparseStream> BiosPartitionTable<S> {
    pub fn open(mut stream: S, geometry: Geometry) -> Result<Self> {
        let sector = read_sector0(&mut stream)?;
        if !looks_like_mbr(&sector) {
            return Err(DiskError::CorruptStructure("no valid BIOS partition table"));
        }
        Ok(Self { stream, geometry })
    }

    /// Writes an empty table (keeping any boot code) and a fresh disk signature.
    pub fn initialize(mut stream: S, geometry: Geometry) -> Result<Self> {
        if stream.len() < SECTOR_SIZE {
            return Err(DiskError::InvalidConfig("disk is smaller than one sector"));
        }
        let mut sector = read_sector0(&mut stream)?;
        sector[TABLE_OFFSET..SIGNATURE_OFFSET].fill(0);
        let signature = Uuid::new_v4().as_u128() as u32;
        put_u32(&mut sector, DISK_SIGNATURE_OFFSET, signature);
        sector[SIGNATURE_OFFSET] = 0x55;
        sector[SIGNATURE_OFFSET + 1] = 0xAA;
        stream.write_at(0, &sector)?;
        stream.flush()?;
        tracing::debug!(%geometry, "initialized BIOS partition table");
        Ok(Self { stream, geometry })
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn into_stream(self) -> S {
        self.stream
    }

    pub fn disk_signature(&mut self) -> Result<u32> {
        let sector = read_sector0(&mut self.stream)?;
        Ok(le_u32(&sector[DISK_SIGNATURE_OFFSET..DISK_SIGNATURE_OFFSET + 4]))
    }

    pub fn set_disk_signature(&mut self, signature: u32) -> Result<()> {
        let mut sector = read_sector0(&mut self.stream)?;
        put_u32(&mut sector, DISK_SIGNATURE_OFFSET, signature);
        self.write_sector0(&sector)
    }

    fn total_sectors(&self) -> u64 {
        (self.stream.len() / SECTOR_SIZE).min(u32::MAX as u64 + 1)
    }

    /// Geometry used for cylinder-granular allocation: the table's heads and sectors
    /// per track, with as many whole cylinders as the stream holds.
    fn allocation_geometry(&self) -> Geometry {
        Geometry::from_capacity_and_layout(
            self.stream.len(),
            self.geometry.heads_per_cylinder,
            self.geometry.sectors_per_track,
            SECTOR_SIZE as u32,
        )
    }

    fn records(&mut self) -> Result<Vec<(usize, BiosRecord)>> {
        let sector = read_sector0(&mut self.stream)?;
        Ok(parse_records(&sector))
    }

    fn used_spans(&mut self) -> Result<Vec<(u64, u64)>> {
        Ok(self
            .records()?
            .iter()
            .map(|(_, r)| (r.first_sector(), r.last_sector()))
            .collect())
    }

    fn write_sector0(&mut self, sector: &[u8]) -> Result<()> {
        self.stream.write_at(0, sector)?;
        self.stream.flush()
    }

    /// Rewrites the directory with `records` packed into the leading slots.
    fn write_records(&mut self, records: &[BiosRecord]) -> Result<()> {
        let mut sector = read_sector0(&mut self.stream)?;
        sector[TABLE_OFFSET..SIGNATURE_OFFSET].fill(0);
        for (slot, record) in records.iter().enumerate() {
            let off = TABLE_OFFSET + slot * ENTRY_SIZE;
            record.encode(&mut sector[off..off + ENTRY_SIZE]);
        }
        self.write_sector0(&sector)
    }

    fn check_index(&mut self, index: usize) -> Result<Vec<(usize, BiosRecord)>> {
        let records = self.records()?;
        if index >= records.len() {
            return Err(DiskError::InvalidIndex {
                index,
                count: records.len(),
            });
        }
        Ok(records)
    }

    /// Creates a primary partition spanning whole cylinders `first..=last`.
    ///
    /// A partition starting at cylinder 0 begins at head 1 so the first track stays free.
    pub fn create_primary_by_cylinder(
        &mut self,
        first_cylinder: u32,
        last_cylinder: u32,
        partition_type: u8,
        active: bool,
    ) -> Result<usize> {
        let g = self.allocation_geometry();
        if first_cylinder > last_cylinder || last_cylinder >= g.cylinders {
            return Err(DiskError::InvalidConfig("cylinder range outside the disk"));
        }
        let first = if first_cylinder == 0 {
            g.to_lba(ChsAddress::new(0, 1, 1))?
        } else {
            g.to_lba(ChsAddress::new(first_cylinder, 0, 1))?
        };
        let last = g.to_lba(ChsAddress::new(
            last_cylinder,
            g.heads_per_cylinder - 1,
            g.sectors_per_track,
        ))?;
        self.create_primary_by_sector(first, last, partition_type, active)
    }

    pub fn create_primary_by_sector(
        &mut self,
        first: u64,
        last: u64,
        partition_type: u8,
        active: bool,
    ) -> Result<usize> {
        if first > last || last >= self.total_sectors() {
            return Err(DiskError::InvalidConfig("sector range outside the disk"));
        }
        if partition_type == 0 {
            return Err(DiskError::InvalidConfig("partition type 0 marks an empty slot"));
        }
        let count = last - first + 1;
        let lba_start = u32::try_from(first)
            .map_err(|_| DiskError::InvalidConfig("partition starts beyond 2 TiB"))?;
        let lba_count = u32::try_from(count)
            .map_err(|_| DiskError::InvalidConfig("partition is larger than 2 TiB"))?;

        let mut records: Vec<BiosRecord> = self.records()?.into_iter().map(|(_, r)| r).collect();
        let spans: Vec<(u64, u64)> = records
            .iter()
            .map(|r| (r.first_sector(), r.last_sector()))
            .collect();
        if overlaps_any(&spans, first, last) {
            return Err(DiskError::InsufficientSpace {
                requested_sectors: count,
            });
        }
        if records.len() >= PRIMARY_SLOTS {
            return Err(DiskError::DirectoryFull {
                slots: PRIMARY_SLOTS,
            });
        }

        if active {
            for r in &mut records {
                r.status = 0;
            }
        }
        records.push(BiosRecord {
            status: if active { STATUS_ACTIVE } else { 0 },
            start_chs: encode_chs(self.geometry.to_chs(first), &self.geometry),
            partition_type,
            end_chs: encode_chs(self.geometry.to_chs(last), &self.geometry),
            lba_start,
            lba_count,
        });
        self.write_records(&records)?;

        tracing::debug!(first, last, partition_type, active, "created BIOS partition");
        Ok(records.len() - 1)
    }
}

impl<S: SparseStream> PartitionTable for BiosPartitionTable<S> {
    fn scheme(&self) -> PartitionScheme {
        PartitionScheme::Bios
    }

    fn disk_guid(&self) -> Option<Uuid> {
        None
    }

    fn partitions(&mut self) -> Result<Vec<PartitionInfo>> {
        Ok(self.records()?.iter().map(|(_, r)| r.info()).collect())
    }

    fn create(&mut self, kind: WellKnownPartitionType, active: bool) -> Result<usize> {
        let g = self.allocation_geometry();
        if g.cylinders == 0 {
            return Err(DiskError::InsufficientSpace {
                requested_sectors: g.sectors_per_cylinder(),
            });
        }
        let first = g.to_lba(ChsAddress::new(0, 1, 1))?;
        let last = g.to_lba(g.last_sector())?;
        let partition_type = kind.bios_type((last - first + 1) * SECTOR_SIZE, last)?;
        self.create_primary_by_cylinder(0, g.cylinders - 1, partition_type, active)
    }

    fn create_by_size(
        &mut self,
        size_bytes: u64,
        kind: WellKnownPartitionType,
        active: bool,
    ) -> Result<usize> {
        let g = self.allocation_geometry();
        let cylinder_bytes = g.bytes_per_cylinder();
        if cylinder_bytes == 0 || g.cylinders == 0 {
            return Err(DiskError::InsufficientSpace {
                requested_sectors: size_bytes.div_ceil(SECTOR_SIZE),
            });
        }
        let cylinders = size_bytes.div_ceil(cylinder_bytes);

        let used: Vec<(u64, u64)> = self
            .used_spans()?
            .into_iter()
            .map(|(f, l)| (g.to_chs(f).cylinder as u64, g.to_chs(l).cylinder as u64))
            .collect();
        let first_cyl = find_gap(&used, 0, g.cylinders as u64 - 1, cylinders, 1).map_err(|e| {
            match e {
                DiskError::InsufficientSpace { .. } => DiskError::InsufficientSpace {
                    requested_sectors: size_bytes.div_ceil(SECTOR_SIZE),
                },
                other => other,
            }
        })?;
        let last_cyl = first_cyl + cylinders - 1;

        let last_sector = g.to_lba(ChsAddress::new(
            last_cyl as u32,
            g.heads_per_cylinder - 1,
            g.sectors_per_track,
        ))?;
        let partition_type = kind.bios_type(size_bytes, last_sector)?;
        self.create_primary_by_cylinder(first_cyl as u32, last_cyl as u32, partition_type, active)
    }

    fn create_aligned(
        &mut self,
        size_bytes: u64,
        kind: WellKnownPartitionType,
        active: bool,
        alignment_bytes: u64,
    ) -> Result<usize> {
        let alignment = alignment_in_sectors(alignment_bytes, SECTOR_SIZE)?;
        let count = size_bytes.div_ceil(SECTOR_SIZE);
        let total = self.total_sectors();
        if total == 0 {
            return Err(DiskError::InsufficientSpace {
                requested_sectors: count,
            });
        }
        let used = self.used_spans()?;
        let first_usable = self.geometry.sectors_per_track.max(1) as u64;
        let (first, last) = allocate_aligned(&used, first_usable, total - 1, count, alignment)?;
        let partition_type = kind.bios_type(size_bytes, last)?;
        self.create_primary_by_sector(first, last, partition_type, active)
    }

    fn delete(&mut self, index: usize) -> Result<()> {
        let mut records: Vec<BiosRecord> = self
            .check_index(index)?
            .into_iter()
            .map(|(_, r)| r)
            .collect();
        let removed = records.remove(index);
        self.write_records(&records)?;
        tracing::debug!(
            index,
            first = removed.first_sector(),
            "deleted BIOS partition"
        );
        Ok(())
    }

    fn set_active_partition(&mut self, index: usize) -> Result<()> {
        let mut records: Vec<BiosRecord> = self
            .check_index(index)?
            .into_iter()
            .map(|(_, r)| r)
            .collect();
        for (i, r) in records.iter_mut().enumerate() {
            r.status = if i == index { STATUS_ACTIVE } else { 0 };
        }
        self.write_records(&records)
    }

    fn sector_size(&self) -> u64 {
        SECTOR_SIZE
    }

    fn stream_mut(&mut self) -> &mut dyn SparseStream {
        &mut self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partitions::types::bios_types;
    use crate::stream::BufferStream;

    fn disk(bytes: u64) -> BufferStream<crate::SparseMemoryBuffer> {
        let mut s = BufferStream::memory();
        s.set_len(bytes).unwrap();
        s
    }

    #[test]
    fn chs_encoding_packs_high_cylinder_bits() {
        let g = Geometry::new(1024, 16, 63);
        assert_eq!(encode_chs(ChsAddress::new(0, 1, 1), &g), [1, 1, 0]);
        assert_eq!(
            encode_chs(ChsAddress::new(0x3FF, 15, 63), &g),
            [15, 63 | 0xC0, 0xFF]
        );
        // Saturates past the CHS limit.
        assert_eq!(
            encode_chs(ChsAddress::new(5000, 3, 7), &g),
            [15, 63 | 0xC0, 0xFF]
        );
    }

    #[test]
    fn detect_rejects_bad_status_and_overlaps() {
        let mut s = disk(1 << 20);
        assert!(!detect(&mut s));

        BiosPartitionTable::initialize(&mut s, Geometry::new(2, 16, 63)).unwrap();
        assert!(detect(&mut s));

        let mut sector = read_sector0(&mut s).unwrap();
        sector[TABLE_OFFSET] = 0x12;
        s.write_at(0, &sector).unwrap();
        assert!(!detect(&mut s));
    }

    #[test]
    fn disk_signature_round_trips() {
        let mut table =
            BiosPartitionTable::initialize(disk(1 << 20), Geometry::new(2, 16, 63)).unwrap();
        table.set_disk_signature(0xDEAD_BEEF).unwrap();
        assert_eq!(table.disk_signature().unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn fifth_partition_is_directory_full() {
        let mut table =
            BiosPartitionTable::initialize(disk(10 * 16 * 63 * 512), Geometry::new(10, 16, 63))
                .unwrap();
        for c in 0..4 {
            table
                .create_primary_by_cylinder(c * 2, c * 2 + 1, bios_types::LINUX_NATIVE, false)
                .unwrap();
        }
        assert_eq!(
            table
                .create_primary_by_cylinder(9, 9, bios_types::LINUX_NATIVE, false)
                .unwrap_err(),
            DiskError::DirectoryFull { slots: 4 }
        );
    }

    #[test]
    fn active_flag_is_exclusive() {
        let mut table =
            BiosPartitionTable::initialize(disk(10 * 16 * 63 * 512), Geometry::new(10, 16, 63))
                .unwrap();
        table.create_primary_by_cylinder(0, 1, bios_types::FAT16, true).unwrap();
        table.create_primary_by_cylinder(2, 3, bios_types::FAT16, true).unwrap();

        let active: Vec<bool> = table.partitions().unwrap().iter().map(|p| p.is_active).collect();
        assert_eq!(active, vec![false, true]);

        table.set_active_partition(0).unwrap();
        let active: Vec<bool> = table.partitions().unwrap().iter().map(|p| p.is_active).collect();
        assert_eq!(active, vec![true, false]);
    }

    #[test]
    fn geometry_is_inferred_from_end_chs() {
        let mut s = disk(20 * 16 * 63 * 512);
        let mut table = BiosPartitionTable::initialize(&mut s, Geometry::new(20, 16, 63)).unwrap();
        table
            .create_primary_by_cylinder(0, 4, bios_types::FAT16, false)
            .unwrap();
        assert_eq!(detect_geometry(&mut s), Some(Geometry::new(20, 16, 63)));
    }
}
