//! NEC PC-98 partition table: an IPL boot sector at LBA 0 and sixteen 32-byte entries at
//! LBA 1. Entries address cylinder/head/sector with zero-based sectors.

use uuid::Uuid;

use crate::geometry::Geometry;
use crate::partitions::alloc::{alignment_in_sectors, find_gap, overlaps_any, trailing_free_span};
use crate::partitions::types::{PartitionInfo, PartitionType, WellKnownPartitionType};
use crate::partitions::{PartitionScheme, PartitionTable};
use crate::stream::SparseStream;
use crate::util::{le_u16, put_u16};
use crate::{DiskError, Result};

pub const SECTOR_SIZE: u64 = 512;
pub const SLOTS: usize = 16;

const ENTRY_SIZE: usize = 32;
const NAME_LEN: usize = 16;
const FLAG_BIT: u8 = 0x80;
const FALLBACK_HEADS: u8 = 16;
const FALLBACK_SECTORS: u8 = 63;
const IPL_SIGNATURES: [&[u8]; 3] = [b"IPL1", b"Linux 98", b"GRUB/98 "];

#[derive(Debug, Clone, PartialEq, Eq)]
struct Pc98Record {
    mid: u8,
    sid: u8,
    heads: u8,
    sectors: u8,
    ipl: (u8, u8, u16),
    start: (u8, u8, u16),
    end: (u8, u8, u16),
    name: [u8; NAME_LEN],
}

fn parse_address(raw: &[u8]) -> (u8, u8, u16) {
    (raw[0], raw[1], le_u16(&raw[2..4]))
}

fn put_address(raw: &mut [u8], (sector, head, cylinder): (u8, u8, u16)) {
    raw[0] = sector;
    raw[1] = head;
    put_u16(raw, 2, cylinder);
}

impl Pc98Record {
    fn parse(raw: &[u8]) -> Self {
        let mut name = [0u8; NAME_LEN];
        name.copy_from_slice(&raw[16..32]);
        Self {
            mid: raw[0],
            sid: raw[1],
            heads: raw[2],
            sectors: raw[3],
            ipl: parse_address(&raw[4..8]),
            start: parse_address(&raw[8..12]),
            end: parse_address(&raw[12..16]),
            name,
        }
    }

    fn encode(&self, raw: &mut [u8]) {
        raw[0] = self.mid;
        raw[1] = self.sid;
        raw[2] = self.heads;
        raw[3] = self.sectors;
        put_address(&mut raw[4..8], self.ipl);
        put_address(&mut raw[8..12], self.start);
        put_address(&mut raw[12..16], self.end);
        raw[16..32].copy_from_slice(&self.name);
    }

    fn is_empty(&self) -> bool {
        self.mid == 0 && self.sid == 0
    }

    fn layout(&self) -> (u64, u64) {
        let heads = if self.heads == 0 { FALLBACK_HEADS } else { self.heads };
        let sectors = if self.sectors == 0 {
            FALLBACK_SECTORS
        } else {
            self.sectors
        };
        (heads as u64, sectors as u64)
    }

    fn lba(&self, (sector, head, cylinder): (u8, u8, u16)) -> u64 {
        let (heads, sectors) = self.layout();
        (cylinder as u64 * heads + head as u64) * sectors + sector as u64
    }

    fn first_sector(&self) -> u64 {
        self.lba(self.start)
    }

    fn last_sector(&self) -> u64 {
        self.lba(self.end)
    }

    fn is_active(&self) -> bool {
        self.sid & FLAG_BIT != 0
    }

    fn set_active(&mut self, active: bool) {
        if active {
            self.mid |= FLAG_BIT;
            self.sid |= FLAG_BIT;
        } else {
            self.mid &= !FLAG_BIT;
            self.sid &= !FLAG_BIT;
        }
    }

    fn name(&self) -> String {
        String::from_utf8_lossy(&self.name)
            .trim_end_matches([' ', '\0'])
            .to_owned()
    }

    fn info(&self) -> PartitionInfo {
        PartitionInfo {
            first_sector: self.first_sector(),
            last_sector: self.last_sector(),
            partition_type: PartitionType::Pc98 {
                mid: self.mid & !FLAG_BIT,
                sid: self.sid & !FLAG_BIT,
            },
            is_active: self.is_active(),
            name: Some(self.name()),
            unique_id: None,
        }
    }
}

fn read_sector<S: SparseStream + ?Sized>(
    stream: &mut S,
    lba: u64,
) -> Result<[u8; SECTOR_SIZE as usize]> {
    let mut buf = [0u8; SECTOR_SIZE as usize];
    stream.read_exact_at(lba * SECTOR_SIZE, &mut buf)?;
    Ok(buf)
}

fn parse_records(sector: &[u8]) -> Result<Vec<Pc98Record>> {
    let records: Vec<Pc98Record> = sector
        .chunks_exact(ENTRY_SIZE)
        .map(Pc98Record::parse)
        .filter(|r| !r.is_empty())
        .collect();
    if records.iter().any(|r| r.first_sector() > r.last_sector()) {
        return Err(DiskError::CorruptStructure("PC-98 entry ends before it starts"));
    }
    Ok(records)
}

fn has_ipl_signature(boot: &[u8]) -> bool {
    IPL_SIGNATURES
        .iter()
        .any(|sig| boot[4..4 + sig.len()] == **sig)
}

/// Whether `stream` starts with a PC-98 IPL boot sector.
///
/// FAT boot sectors also end in `0x55 0xAA` and may carry arbitrary bytes at offset 4, so
/// a `FAT` file-system tag at 0x36 rules the disk out.
pub fn detect<S: SparseStream + ?Sized>(stream: &mut S) -> bool {
    if stream.len() < 2 * SECTOR_SIZE {
        return false;
    }
    let Ok(boot) = read_sector(stream, 0) else {
        return false;
    };
    boot[510] == 0x55
        && boot[511] == 0xAA
        && has_ipl_signature(&boot)
        && &boot[0x36..0x39] != b"FAT"
}

/// Heads and sectors per track recorded in the first entry, with as many cylinders as
/// `stream` holds.
pub fn detect_geometry<S: SparseStream + ?Sized>(stream: &mut S) -> Option<Geometry> {
    if !detect(stream) {
        return None;
    }
    let table = read_sector(stream, 1).ok()?;
    let first = parse_records(&table).ok()?.into_iter().next()?;
    let (heads, sectors) = first.layout();
    Some(Geometry::from_capacity_and_layout(
        stream.len(),
        heads as u32,
        sectors as u32,
        SECTOR_SIZE as u32,
    ))
}

pub struct Pc98PartitionTable<S> {
    stream: S,
    geometry: Geometry,
}

impl<S: SparseStream> Pc98PartitionTable<S> {
    pub fn open(mut stream: S, geometry: Geometry) -> Result<Self> {
        if !detect(&mut stream) {
            return Err(DiskError::CorruptStructure("no PC-98 IPL boot sector"));
        }
        Ok(Self { stream, geometry })
    }

    /// Writes an IPL boot sector and an empty partition directory.
    pub fn initialize(mut stream: S, geometry: Geometry) -> Result<Self> {
        if stream.len() < 2 * SECTOR_SIZE {
            return Err(DiskError::InvalidConfig("disk is smaller than two sectors"));
        }
        let mut boot = [0u8; SECTOR_SIZE as usize];
        boot[4..8].copy_from_slice(IPL_SIGNATURES[0]);
        boot[510] = 0x55;
        boot[511] = 0xAA;
        stream.write_at(0, &boot)?;
        stream.write_at(SECTOR_SIZE, &[0u8; SECTOR_SIZE as usize])?;
        stream.flush()?;
        tracing::debug!(%geometry, "initialized PC-98 partition table");
        Ok(Self { stream, geometry })
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn into_stream(self) -> S {
        self.stream
    }

    fn allocation_geometry(&self) -> Geometry {
        Geometry::from_capacity_and_layout(
            self.stream.len(),
            self.geometry.heads_per_cylinder,
            self.geometry.sectors_per_track,
            SECTOR_SIZE as u32,
        )
    }

    fn records(&mut self) -> Result<Vec<Pc98Record>> {
        parse_records(&read_sector(&mut self.stream, 1)?)
    }

    fn write_records(&mut self, records: &[Pc98Record]) -> Result<()> {
        let mut sector = [0u8; SECTOR_SIZE as usize];
        for (record, raw) in records.iter().zip(sector.chunks_exact_mut(ENTRY_SIZE)) {
            record.encode(raw);
        }
        self.stream.write_at(SECTOR_SIZE, &sector)?;
        self.stream.flush()
    }

    /// Records as inclusive cylinder spans in the allocation geometry.
    fn used_cylinders(&mut self, g: &Geometry) -> Result<Vec<(u64, u64)>> {
        let per_cylinder = g.sectors_per_cylinder();
        Ok(self
            .records()?
            .iter()
            .map(|r| (r.first_sector() / per_cylinder, r.last_sector() / per_cylinder))
            .collect())
    }

    /// Creates a partition over whole cylinders `first..=last`.
    pub fn create_by_cylinder(
        &mut self,
        first_cylinder: u64,
        last_cylinder: u64,
        kind: WellKnownPartitionType,
        active: bool,
    ) -> Result<usize> {
        let g = self.allocation_geometry();
        if first_cylinder == 0
            || first_cylinder > last_cylinder
            || last_cylinder >= g.cylinders as u64
        {
            return Err(DiskError::InvalidConfig("cylinder range outside the disk"));
        }
        let (mid, sid, name) = kind.pc98_type()?;
        let first = u16::try_from(first_cylinder)
            .map_err(|_| DiskError::InvalidConfig("cylinder does not fit a PC-98 entry"))?;
        let last = u16::try_from(last_cylinder)
            .map_err(|_| DiskError::InvalidConfig("cylinder does not fit a PC-98 entry"))?;
        let heads = u8::try_from(g.heads_per_cylinder)
            .map_err(|_| DiskError::InvalidConfig("too many heads for a PC-98 entry"))?;
        let sectors = u8::try_from(g.sectors_per_track)
            .map_err(|_| DiskError::InvalidConfig("too many sectors for a PC-98 entry"))?;
        if heads == 0 || sectors == 0 {
            return Err(DiskError::InvalidConfig("geometry has no heads or sectors"));
        }

        let mut records = self.records()?;
        let used = self.used_cylinders(&g)?;
        if overlaps_any(&used, first_cylinder, last_cylinder) {
            let cylinders = last_cylinder - first_cylinder + 1;
            return Err(DiskError::InsufficientSpace {
                requested_sectors: cylinders * g.sectors_per_cylinder(),
            });
        }
        if records.len() >= SLOTS {
            return Err(DiskError::DirectoryFull { slots: SLOTS });
        }

        let mut padded = [b' '; NAME_LEN];
        padded[..name.len()].copy_from_slice(name.as_bytes());
        let mut record = Pc98Record {
            mid,
            sid,
            heads,
            sectors,
            ipl: (0, 0, first),
            start: (0, 0, first),
            end: (sectors - 1, heads - 1, last),
            name: padded,
        };
        if active {
            for r in &mut records {
                r.set_active(false);
            }
            record.set_active(true);
        }
        records.push(record);
        self.write_records(&records)?;

        tracing::debug!(first_cylinder, last_cylinder, active, "created PC-98 partition");
        Ok(records.len() - 1)
    }

    fn check_index(&mut self, index: usize) -> Result<Vec<Pc98Record>> {
        let records = self.records()?;
        if index >= records.len() {
            return Err(DiskError::InvalidIndex {
                index,
                count: records.len(),
            });
        }
        Ok(records)
    }

    fn insufficient(size_bytes: u64) -> DiskError {
        DiskError::InsufficientSpace {
            requested_sectors: size_bytes.div_ceil(SECTOR_SIZE),
        }
    }
}

impl<S: SparseStream> PartitionTable for Pc98PartitionTable<S> {
    fn scheme(&self) -> PartitionScheme {
        PartitionScheme::Pc98
    }

    fn disk_guid(&self) -> Option<Uuid> {
        None
    }

    fn partitions(&mut self) -> Result<Vec<PartitionInfo>> {
        Ok(self.records()?.iter().map(Pc98Record::info).collect())
    }

    fn create(&mut self, kind: WellKnownPartitionType, active: bool) -> Result<usize> {
        let g = self.allocation_geometry();
        if g.cylinders < 2 {
            return Err(DiskError::InsufficientSpace {
                requested_sectors: g.sectors_per_cylinder(),
            });
        }
        let used = self.used_cylinders(&g)?;
        let (first, last) = trailing_free_span(&used, 1, g.cylinders as u64 - 1)?;
        self.create_by_cylinder(first, last, kind, active)
    }

    fn create_by_size(
        &mut self,
        size_bytes: u64,
        kind: WellKnownPartitionType,
        active: bool,
    ) -> Result<usize> {
        self.create_aligned(size_bytes, kind, active, SECTOR_SIZE)
    }

    /// Cylinder-granular allocation; the alignment is rounded to whole cylinders.
    fn create_aligned(
        &mut self,
        size_bytes: u64,
        kind: WellKnownPartitionType,
        active: bool,
        alignment_bytes: u64,
    ) -> Result<usize> {
        alignment_in_sectors(alignment_bytes, SECTOR_SIZE)?;
        let g = self.allocation_geometry();
        let cylinder_bytes = g.bytes_per_cylinder();
        if cylinder_bytes == 0 || g.cylinders < 2 {
            return Err(Self::insufficient(size_bytes));
        }
        let cylinders = size_bytes.div_ceil(cylinder_bytes);
        let alignment = (alignment_bytes / cylinder_bytes).max(1);

        let used = self.used_cylinders(&g)?;
        let first = find_gap(&used, 1, g.cylinders as u64 - 1, cylinders, alignment).map_err(
            |e| match e {
                DiskError::InsufficientSpace { .. } => Self::insufficient(size_bytes),
                other => other,
            },
        )?;
        self.create_by_cylinder(first, first + cylinders - 1, kind, active)
    }

    fn delete(&mut self, index: usize) -> Result<()> {
        let mut records = self.check_index(index)?;
        records.remove(index);
        self.write_records(&records)?;
        tracing::debug!(index, "deleted PC-98 partition");
        Ok(())
    }

    fn set_active_partition(&mut self, index: usize) -> Result<()> {
        let mut records = self.check_index(index)?;
        for (i, r) in records.iter_mut().enumerate() {
            r.set_active(i == index);
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
