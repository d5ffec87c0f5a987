//! GUID partition table: protective MBR, primary header and entry array at the start of
//! the disk, mirrored entry array and backup header at the end.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geometry::Geometry;
use crate::partitions::alloc::{
    alignment_in_sectors, allocate_aligned, find_gap, overlaps_any, trailing_free_span,
};
use crate::partitions::bios::{self, BiosPartitionTable};
use crate::partitions::types::{
    bios_types, PartitionInfo, PartitionType, WellKnownPartitionType,
};
use crate::partitions::{PartitionScheme, PartitionTable};
use crate::stream::SparseStream;
use crate::util::{le_u32, le_u64, put_u32, put_u64};
use crate::{DiskError, Result};

pub const SECTOR_SIZE: u64 = 512;
pub const DEFAULT_ENTRY_COUNT: u32 = 128;
pub const ENTRY_SIZE: u32 = 128;

const SIGNATURE: [u8; 8] = *b"EFI PART";
const REVISION: u32 = 0x0001_0000;
const HEADER_SIZE: u32 = 92;
const NAME_UNITS: usize = 36;
const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Controls the shape of a freshly initialized table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GptLayout {
    pub entry_count: u32,
    /// Create a Microsoft Reserved partition on disks of at least 512 MiB.
    pub reserve_microsoft_partition: bool,
}

impl Default for GptLayout {
    fn default() -> Self {
        Self {
            entry_count: DEFAULT_ENTRY_COUNT,
            reserve_microsoft_partition: true,
        }
    }
}

impl GptLayout {
    pub fn validate(&self) -> Result<()> {
        if self.entry_count == 0 || self.entry_count % (SECTOR_SIZE as u32 / ENTRY_SIZE) != 0 {
            return Err(DiskError::InvalidConfig(
                "entry count must be a non-zero multiple of 4",
            ));
        }
        Ok(())
    }

    fn entry_sectors(&self) -> u64 {
        (self.entry_count as u64 * ENTRY_SIZE as u64).div_ceil(SECTOR_SIZE)
    }
}

/// Microsoft Reserved partition size Windows uses for a disk of `capacity` bytes.
pub fn microsoft_reserved_size(capacity: u64) -> u64 {
    if capacity < 16 * GIB {
        32 * MIB
    } else {
        128 * MIB
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct GptHeader {
    current_lba: u64,
    alternate_lba: u64,
    first_usable: u64,
    last_usable: u64,
    disk_guid: Uuid,
    entries_lba: u64,
    entry_count: u32,
    entry_size: u32,
    entries_crc: u32,
}

impl GptHeader {
    fn encode(&self) -> [u8; SECTOR_SIZE as usize] {
        let mut buf = [0u8; SECTOR_SIZE as usize];
        buf[0..8].copy_from_slice(&SIGNATURE);
        put_u32(&mut buf, 8, REVISION);
        put_u32(&mut buf, 12, HEADER_SIZE);
        put_u64(&mut buf, 24, self.current_lba);
        put_u64(&mut buf, 32, self.alternate_lba);
        put_u64(&mut buf, 40, self.first_usable);
        put_u64(&mut buf, 48, self.last_usable);
        buf[56..72].copy_from_slice(&self.disk_guid.to_bytes_le());
        put_u64(&mut buf, 72, self.entries_lba);
        put_u32(&mut buf, 80, self.entry_count);
        put_u32(&mut buf, 84, self.entry_size);
        put_u32(&mut buf, 88, self.entries_crc);
        let crc = crc32fast::hash(&buf[..HEADER_SIZE as usize]);
        put_u32(&mut buf, 16, crc);
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf[0..8] != SIGNATURE {
            return Err(DiskError::CorruptStructure("missing GPT signature"));
        }
        let header_size = le_u32(&buf[12..16]);
        if header_size < HEADER_SIZE || header_size as u64 > SECTOR_SIZE {
            return Err(DiskError::CorruptStructure("invalid GPT header size"));
        }
        let mut scratch = buf[..header_size as usize].to_vec();
        put_u32(&mut scratch, 16, 0);
        if crc32fast::hash(&scratch) != le_u32(&buf[16..20]) {
            return Err(DiskError::CorruptStructure("GPT header checksum mismatch"));
        }

        let mut guid = [0u8; 16];
        guid.copy_from_slice(&buf[56..72]);
        let header = Self {
            current_lba: le_u64(&buf[24..32]),
            alternate_lba: le_u64(&buf[32..40]),
            first_usable: le_u64(&buf[40..48]),
            last_usable: le_u64(&buf[48..56]),
            disk_guid: Uuid::from_bytes_le(guid),
            entries_lba: le_u64(&buf[72..80]),
            entry_count: le_u32(&buf[80..84]),
            entry_size: le_u32(&buf[84..88]),
            entries_crc: le_u32(&buf[88..92]),
        };
        if header.entry_size < ENTRY_SIZE
            || header.entry_size as u64 > SECTOR_SIZE
            || header.entry_size % 8 != 0
        {
            return Err(DiskError::CorruptStructure("invalid GPT entry size"));
        }
        if header.entry_count == 0 || header.entry_count > 16 * 1024 {
            return Err(DiskError::CorruptStructure("invalid GPT entry count"));
        }
        if header.first_usable > header.last_usable {
            return Err(DiskError::CorruptStructure("invalid GPT usable range"));
        }
        Ok(header)
    }

    /// Rejects headers whose structures do not fit on a disk of `total_sectors`.
    fn check_bounds(&self, total_sectors: u64) -> Result<()> {
        if self.alternate_lba >= total_sectors || self.alternate_lba == self.current_lba {
            return Err(DiskError::CorruptStructure("GPT alternate header out of range"));
        }
        let entries_end = self
            .entries_lba
            .checked_add(self.entry_sectors())
            .ok_or(DiskError::CorruptStructure("GPT entry array out of range"))?;
        if self.entries_lba < 2 || entries_end > total_sectors {
            return Err(DiskError::CorruptStructure("GPT entry array out of range"));
        }
        if self.first_usable < 2 || self.last_usable >= total_sectors {
            return Err(DiskError::CorruptStructure("GPT usable range out of range"));
        }
        if self.current_lba == 1 && self.alternate_lba <= self.entry_sectors() {
            return Err(DiskError::CorruptStructure("GPT alternate header out of range"));
        }
        Ok(())
    }

    fn entry_array_bytes(&self) -> usize {
        self.entry_count as usize * self.entry_size as usize
    }

    fn entry_sectors(&self) -> u64 {
        (self.entry_array_bytes() as u64).div_ceil(SECTOR_SIZE)
    }

    /// The copy of this header that lives at the other end of the disk.
    fn mirrored(&self) -> Result<Self> {
        let entries_lba = if self.current_lba == 1 {
            self.alternate_lba
                .checked_sub(self.entry_sectors())
                .ok_or(DiskError::CorruptStructure("GPT alternate header out of range"))?
        } else {
            2
        };
        Ok(Self {
            current_lba: self.alternate_lba,
            alternate_lba: self.current_lba,
            entries_lba,
            ..self.clone()
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct GptEntry {
    type_guid: Uuid,
    unique_id: Uuid,
    first_lba: u64,
    last_lba: u64,
    attributes: u64,
    name: String,
}

impl GptEntry {
    fn decode(raw: &[u8]) -> Self {
        let guid = |off: usize| {
            let mut b = [0u8; 16];
            b.copy_from_slice(&raw[off..off + 16]);
            Uuid::from_bytes_le(b)
        };
        let units: Vec<u16> = raw[56..56 + NAME_UNITS * 2]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .take_while(|u| *u != 0)
            .collect();
        Self {
            type_guid: guid(0),
            unique_id: guid(16),
            first_lba: le_u64(&raw[32..40]),
            last_lba: le_u64(&raw[40..48]),
            attributes: le_u64(&raw[48..56]),
            name: String::from_utf16_lossy(&units),
        }
    }

    fn encode(&self, raw: &mut [u8]) {
        raw[..ENTRY_SIZE as usize].fill(0);
        raw[0..16].copy_from_slice(&self.type_guid.to_bytes_le());
        raw[16..32].copy_from_slice(&self.unique_id.to_bytes_le());
        put_u64(raw, 32, self.first_lba);
        put_u64(raw, 40, self.last_lba);
        put_u64(raw, 48, self.attributes);
        for (i, unit) in self.name.encode_utf16().take(NAME_UNITS).enumerate() {
            raw[56 + i * 2..58 + i * 2].copy_from_slice(&unit.to_le_bytes());
        }
    }

    fn is_empty(&self) -> bool {
        self.type_guid.is_nil()
    }

    fn info(&self) -> PartitionInfo {
        PartitionInfo {
            first_sector: self.first_lba,
            last_sector: self.last_lba,
            partition_type: PartitionType::Gpt(self.type_guid),
            is_active: false,
            name: Some(self.name.clone()),
            unique_id: Some(self.unique_id),
        }
    }
}

fn read_header<S: SparseStream + ?Sized>(stream: &mut S, lba: u64) -> Result<GptHeader> {
    let mut buf = [0u8; SECTOR_SIZE as usize];
    stream.read_exact_at(lba * SECTOR_SIZE, &mut buf)?;
    let header = GptHeader::decode(&buf)?;
    if header.current_lba != lba {
        return Err(DiskError::CorruptStructure("GPT header found at wrong LBA"));
    }
    header.check_bounds(stream.len() / SECTOR_SIZE)?;
    Ok(header)
}

fn read_entries<S: SparseStream + ?Sized>(
    stream: &mut S,
    header: &GptHeader,
) -> Result<Vec<GptEntry>> {
    let offset = header
        .entries_lba
        .checked_mul(SECTOR_SIZE)
        .ok_or(DiskError::OffsetOverflow)?;
    let mut raw = vec![0u8; header.entry_array_bytes()];
    stream.read_exact_at(offset, &mut raw)?;
    if crc32fast::hash(&raw) != header.entries_crc {
        return Err(DiskError::CorruptStructure("GPT entry array checksum mismatch"));
    }
    let entries: Vec<GptEntry> = raw
        .chunks_exact(header.entry_size as usize)
        .map(GptEntry::decode)
        .collect();
    for entry in entries.iter().filter(|e| !e.is_empty()) {
        if entry.first_lba > entry.last_lba {
            return Err(DiskError::CorruptStructure("GPT entry ends before it starts"));
        }
        if entry.first_lba < header.first_usable || entry.last_lba > header.last_usable {
            return Err(DiskError::CorruptStructure("GPT entry outside the usable range"));
        }
    }
    Ok(entries)
}

/// Loads a consistent header + entry array, preferring the primary copy.
fn load<S: SparseStream + ?Sized>(stream: &mut S) -> Result<(GptHeader, Vec<GptEntry>)> {
    let primary = read_header(stream, 1).and_then(|h| {
        let entries = read_entries(stream, &h)?;
        Ok((h, entries))
    });
    let primary_err = match primary {
        Ok(found) => return Ok(found),
        Err(e) => e,
    };

    let total = stream.len() / SECTOR_SIZE;
    if total < 2 {
        return Err(primary_err);
    }
    let backup = read_header(stream, total - 1)?;
    if backup.alternate_lba != 1 {
        return Err(DiskError::CorruptStructure("backup GPT header does not point at LBA 1"));
    }
    let entries = read_entries(stream, &backup)?;
    let primary = backup.mirrored()?;
    tracing::warn!(%primary_err, "primary GPT is damaged, using backup copy");
    Ok((primary, entries))
}

/// Whether `stream` holds a GPT: a protective MBR plus a valid primary or backup header.
pub fn detect<S: SparseStream + ?Sized>(stream: &mut S) -> bool {
    if stream.len() < 3 * SECTOR_SIZE || !bios::detect(stream) {
        return false;
    }
    let mut mbr = [0u8; SECTOR_SIZE as usize];
    if stream.read_exact_at(0, &mut mbr).is_err() {
        return false;
    }
    let protective =
        (0..4).any(|slot| mbr[0x1BE + slot * 16 + 4] == bios_types::GPT_PROTECTIVE);
    protective && load(stream).is_ok()
}

/// GUID partition table over a disk's content stream.
///
/// The header and entry array are held in memory; every mutation writes both copies and
/// flushes before the in-memory state is updated.
pub struct GuidPartitionTable<S> {
    stream: S,
    header: GptHeader,
    entries: Vec<GptEntry>,
}

impl<S: SparseStream> GuidPartitionTable<S> {
    pub fn open(mut stream: S) -> Result<Self> {
        let (header, entries) = load(&mut stream)?;
        Ok(Self {
            stream,
            header,
            entries,
        })
    }

    pub fn initialize(stream: S, geometry: Geometry) -> Result<Self> {
        Self::initialize_with(stream, geometry, GptLayout::default())
    }

    pub fn initialize_with(mut stream: S, geometry: Geometry, layout: GptLayout) -> Result<Self> {
        layout.validate()?;
        let capacity = stream.len();
        let total = capacity / SECTOR_SIZE;
        let entry_sectors = layout.entry_sectors();
        if total < 2 * entry_sectors + 6 {
            return Err(DiskError::InvalidConfig("disk is too small for a GPT"));
        }

        {
            let mut mbr = BiosPartitionTable::initialize(&mut stream, geometry)?;
            let last = (total - 1).min(u32::MAX as u64);
            mbr.create_primary_by_sector(1, last, bios_types::GPT_PROTECTIVE, false)?;
        }

        let alternate_lba = total - 1;
        let header = GptHeader {
            current_lba: 1,
            alternate_lba,
            first_usable: 2 + entry_sectors,
            last_usable: alternate_lba - entry_sectors - 1,
            disk_guid: Uuid::new_v4(),
            entries_lba: 2,
            entry_count: layout.entry_count,
            entry_size: ENTRY_SIZE,
            entries_crc: 0,
        };
        let entries = vec![empty_entry(); layout.entry_count as usize];

        let mut table = Self {
            stream,
            header,
            entries,
        };
        let entries = table.entries.clone();
        table.commit(entries)?;
        tracing::debug!(capacity, entry_count = layout.entry_count, "initialized GPT");

        if layout.reserve_microsoft_partition && capacity >= 512 * MIB {
            let count = microsoft_reserved_size(capacity) / SECTOR_SIZE;
            let first = table.header.first_usable;
            table.create_entry(
                first,
                first + count - 1,
                WellKnownPartitionType::MicrosoftReserved.gpt_type(),
                0,
                WellKnownPartitionType::MicrosoftReserved.gpt_name(),
            )?;
        }
        Ok(table)
    }

    pub fn first_usable(&self) -> u64 {
        self.header.first_usable
    }

    pub fn last_usable(&self) -> u64 {
        self.header.last_usable
    }

    pub fn entry_count(&self) -> u32 {
        self.header.entry_count
    }

    pub fn into_stream(self) -> S {
        self.stream
    }

    fn used_spans(&self) -> Vec<(u64, u64)> {
        self.entries
            .iter()
            .filter(|e| !e.is_empty())
            .map(|e| (e.first_lba, e.last_lba))
            .collect()
    }

    /// Maps a partition index to its slot in the entry array.
    fn slot_of(&self, index: usize) -> Result<usize> {
        let used: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.is_empty())
            .map(|(i, _)| i)
            .collect();
        used.get(index).copied().ok_or(DiskError::InvalidIndex {
            index,
            count: used.len(),
        })
    }

    /// Adds an entry with an explicit type GUID and returns its partition index.
    pub fn create_entry(
        &mut self,
        first: u64,
        last: u64,
        type_guid: Uuid,
        attributes: u64,
        name: &str,
    ) -> Result<usize> {
        if first > last || first < self.header.first_usable || last > self.header.last_usable {
            return Err(DiskError::InvalidConfig("partition outside the usable range"));
        }
        if type_guid.is_nil() {
            return Err(DiskError::InvalidConfig("nil type GUID marks an empty entry"));
        }
        if overlaps_any(&self.used_spans(), first, last) {
            return Err(DiskError::InsufficientSpace {
                requested_sectors: last - first + 1,
            });
        }
        let slot = self
            .entries
            .iter()
            .position(GptEntry::is_empty)
            .ok_or(DiskError::DirectoryFull {
                slots: self.entries.len(),
            })?;

        let mut entries = self.entries.clone();
        entries[slot] = GptEntry {
            type_guid,
            unique_id: Uuid::new_v4(),
            first_lba: first,
            last_lba: last,
            attributes,
            name: name.to_owned(),
        };
        self.commit(entries)?;
        tracing::debug!(first, last, %type_guid, "created GPT partition");

        Ok(self.entries[..=slot].iter().filter(|e| !e.is_empty()).count() - 1)
    }

    /// Writes both copies of the entry array and headers, then adopts `entries`.
    fn commit(&mut self, entries: Vec<GptEntry>) -> Result<()> {
        let mut raw = vec![0u8; self.header.entry_array_bytes()];
        for (entry, chunk) in entries
            .iter()
            .zip(raw.chunks_exact_mut(self.header.entry_size as usize))
        {
            entry.encode(chunk);
        }

        let mut primary = self.header.clone();
        primary.entries_crc = crc32fast::hash(&raw);
        let backup = primary.mirrored()?;

        self.stream
            .write_at(primary.entries_lba * SECTOR_SIZE, &raw)?;
        self.stream.write_at(backup.entries_lba * SECTOR_SIZE, &raw)?;
        self.stream
            .write_at(backup.current_lba * SECTOR_SIZE, &backup.encode())?;
        self.stream
            .write_at(primary.current_lba * SECTOR_SIZE, &primary.encode())?;
        self.stream.flush()?;

        self.header = primary;
        self.entries = entries;
        Ok(())
    }
}

fn empty_entry() -> GptEntry {
    GptEntry {
        type_guid: Uuid::nil(),
        unique_id: Uuid::nil(),
        first_lba: 0,
        last_lba: 0,
        attributes: 0,
        name: String::new(),
    }
}

impl<S: SparseStream> PartitionTable for GuidPartitionTable<S> {
    fn scheme(&self) -> PartitionScheme {
        PartitionScheme::Gpt
    }

    fn disk_guid(&self) -> Option<Uuid> {
        Some(self.header.disk_guid)
    }

    fn partitions(&mut self) -> Result<Vec<PartitionInfo>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| !e.is_empty())
            .map(GptEntry::info)
            .collect())
    }

    fn create(&mut self, kind: WellKnownPartitionType, _active: bool) -> Result<usize> {
        let (first, last) = trailing_free_span(
            &self.used_spans(),
            self.header.first_usable,
            self.header.last_usable,
        )?;
        self.create_entry(first, last, kind.gpt_type(), 0, kind.gpt_name())
    }

    fn create_by_size(
        &mut self,
        size_bytes: u64,
        kind: WellKnownPartitionType,
        _active: bool,
    ) -> Result<usize> {
        let count = size_bytes.div_ceil(SECTOR_SIZE);
        let first = find_gap(
            &self.used_spans(),
            self.header.first_usable,
            self.header.last_usable,
            count,
            1,
        )?;
        self.create_entry(first, first + count - 1, kind.gpt_type(), 0, kind.gpt_name())
    }

    fn create_aligned(
        &mut self,
        size_bytes: u64,
        kind: WellKnownPartitionType,
        _active: bool,
        alignment_bytes: u64,
    ) -> Result<usize> {
        let alignment = alignment_in_sectors(alignment_bytes, SECTOR_SIZE)?;
        let (first, last) = allocate_aligned(
            &self.used_spans(),
            self.header.first_usable,
            self.header.last_usable,
            size_bytes.div_ceil(SECTOR_SIZE),
            alignment,
        )?;
        self.create_entry(first, last, kind.gpt_type(), 0, kind.gpt_name())
    }

    fn delete(&mut self, index: usize) -> Result<()> {
        let slot = self.slot_of(index)?;
        let mut entries = self.entries.clone();
        entries.remove(slot);
        // Compact used entries to the front so indices stay dense.
        entries.sort_by_key(GptEntry::is_empty);
        entries.push(empty_entry());
        self.commit(entries)?;
        tracing::debug!(index, "deleted GPT partition");
        Ok(())
    }

    fn set_active_partition(&mut self, _index: usize) -> Result<()> {
        Err(DiskError::Unsupported("GPT partitions have no active flag"))
    }

    fn sector_size(&self) -> u64 {
        SECTOR_SIZE
    }

    fn stream_mut(&mut self) -> &mut dyn SparseStream {
        &mut self.stream
    }
}
