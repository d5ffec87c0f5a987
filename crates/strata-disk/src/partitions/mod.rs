//! Partition tables: parsing, detection and free-space allocation for the BIOS, GPT and
//! PC-98 schemes.
//!
//! Every scheme implements [`PartitionTable`]. Indices passed to `get`, `delete` and
//! `set_active_partition` are positions in the compacted list returned by `partitions`;
//! deleting an entry shifts later indices down by one.

pub(crate) mod alloc;
pub mod bios;
pub mod gpt;
pub mod pc98;
pub mod types;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use bios::BiosPartitionTable;
pub use gpt::{GptLayout, GuidPartitionTable};
pub use pc98::Pc98PartitionTable;
pub use types::{
    PartitionInfo, PartitionScheme, PartitionType, WellKnownPartitionType,
};

use crate::geometry::Geometry;
use crate::stream::{Ownership, SparseStream, SubStream};
use crate::{DiskError, Result};

pub trait PartitionTable {
    fn scheme(&self) -> PartitionScheme;

    /// Disk identifier, for schemes that carry one.
    fn disk_guid(&self) -> Option<Uuid>;

    fn partitions(&mut self) -> Result<Vec<PartitionInfo>>;

    fn count(&mut self) -> Result<usize> {
        Ok(self.partitions()?.len())
    }

    fn get(&mut self, index: usize) -> Result<PartitionInfo> {
        let mut partitions = self.partitions()?;
        let count = partitions.len();
        if index >= count {
            return Err(DiskError::InvalidIndex { index, count });
        }
        Ok(partitions.swap_remove(index))
    }

    /// Creates a partition covering the largest trailing free region.
    fn create(&mut self, kind: WellKnownPartitionType, active: bool) -> Result<usize>;

    fn create_by_size(
        &mut self,
        size_bytes: u64,
        kind: WellKnownPartitionType,
        active: bool,
    ) -> Result<usize>;

    /// Creates a partition whose start and end are multiples of `alignment_bytes`.
    fn create_aligned(
        &mut self,
        size_bytes: u64,
        kind: WellKnownPartitionType,
        active: bool,
        alignment_bytes: u64,
    ) -> Result<usize>;

    fn delete(&mut self, index: usize) -> Result<()>;

    fn set_active_partition(&mut self, index: usize) -> Result<()>;

    fn sector_size(&self) -> u64;

    fn stream_mut(&mut self) -> &mut dyn SparseStream;

    /// A view over the bytes of partition `index`.
    fn open_partition(&mut self, index: usize) -> Result<SubStream<&mut dyn SparseStream>> {
        let info = self.get(index)?;
        let sector_size = self.sector_size();
        let first = info
            .first_sector
            .checked_mul(sector_size)
            .ok_or(DiskError::OffsetOverflow)?;
        let length = info
            .sector_count()
            .checked_mul(sector_size)
            .ok_or(DiskError::OffsetOverflow)?;
        SubStream::new(self.stream_mut(), Ownership::DoesNotOwn, first, length)
    }
}

/// A partition table of any supported scheme.
pub enum AnyPartitionTable<S> {
    Bios(BiosPartitionTable<S>),
    Gpt(GuidPartitionTable<S>),
    Pc98(Pc98PartitionTable<S>),
}

impl<S: SparseStream> AnyPartitionTable<S> {
    fn as_table(&self) -> &dyn PartitionTable {
        match self {
            AnyPartitionTable::Bios(t) => t,
            AnyPartitionTable::Gpt(t) => t,
            AnyPartitionTable::Pc98(t) => t,
        }
    }

    fn as_table_mut(&mut self) -> &mut dyn PartitionTable {
        match self {
            AnyPartitionTable::Bios(t) => t,
            AnyPartitionTable::Gpt(t) => t,
            AnyPartitionTable::Pc98(t) => t,
        }
    }

    pub fn into_stream(self) -> S {
        match self {
            AnyPartitionTable::Bios(t) => t.into_stream(),
            AnyPartitionTable::Gpt(t) => t.into_stream(),
            AnyPartitionTable::Pc98(t) => t.into_stream(),
        }
    }
}

impl<S: SparseStream> PartitionTable for AnyPartitionTable<S> {
    fn scheme(&self) -> PartitionScheme {
        self.as_table().scheme()
    }

    fn disk_guid(&self) -> Option<Uuid> {
        self.as_table().disk_guid()
    }

    fn partitions(&mut self) -> Result<Vec<PartitionInfo>> {
        self.as_table_mut().partitions()
    }

    fn create(&mut self, kind: WellKnownPartitionType, active: bool) -> Result<usize> {
        self.as_table_mut().create(kind, active)
    }

    fn create_by_size(
        &mut self,
        size_bytes: u64,
        kind: WellKnownPartitionType,
        active: bool,
    ) -> Result<usize> {
        self.as_table_mut().create_by_size(size_bytes, kind, active)
    }

    fn create_aligned(
        &mut self,
        size_bytes: u64,
        kind: WellKnownPartitionType,
        active: bool,
        alignment_bytes: u64,
    ) -> Result<usize> {
        self.as_table_mut()
            .create_aligned(size_bytes, kind, active, alignment_bytes)
    }

    fn delete(&mut self, index: usize) -> Result<()> {
        self.as_table_mut().delete(index)
    }

    fn set_active_partition(&mut self, index: usize) -> Result<()> {
        self.as_table_mut().set_active_partition(index)
    }

    fn sector_size(&self) -> u64 {
        self.as_table().sector_size()
    }

    fn stream_mut(&mut self) -> &mut dyn SparseStream {
        self.as_table_mut().stream_mut()
    }
}

/// How overlapping scheme signatures are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionPolicy {
    /// A PC-98 IPL sector also ends in `0x55 0xAA`; when set, the BIOS reading of such a
    /// disk is not reported.
    pub pc98_suppresses_bios: bool,
}

impl Default for DetectionPolicy {
    fn default() -> Self {
        Self {
            pc98_suppresses_bios: true,
        }
    }
}

/// Schemes found on `stream`, highest priority first (GPT, PC-98, BIOS).
pub fn detect_schemes<S: SparseStream + ?Sized>(
    stream: &mut S,
    policy: DetectionPolicy,
) -> Vec<PartitionScheme> {
    let mut found = Vec::new();
    let gpt = gpt::detect(stream);
    if gpt {
        found.push(PartitionScheme::Gpt);
    }
    let pc98 = pc98::detect(stream);
    if pc98 {
        found.push(PartitionScheme::Pc98);
    }
    if !gpt && !(pc98 && policy.pc98_suppresses_bios) && bios::detect(stream) {
        found.push(PartitionScheme::Bios);
    }
    found
}

fn fallback_geometry(len: u64) -> Geometry {
    Geometry::from_capacity(len).make_bios_safe(len)
}

/// Opens the highest-priority partition table on `stream`, or `None` if the disk is not
/// partitioned.
pub fn open_partition_table<S: SparseStream>(
    mut stream: S,
    policy: DetectionPolicy,
) -> Result<Option<AnyPartitionTable<S>>> {
    let Some(scheme) = detect_schemes(&mut stream, policy).first().copied() else {
        return Ok(None);
    };
    tracing::debug!(?scheme, "opening partition table");
    let len = stream.len();
    let table = match scheme {
        PartitionScheme::Gpt => AnyPartitionTable::Gpt(GuidPartitionTable::open(stream)?),
        PartitionScheme::Pc98 => {
            let geometry =
                pc98::detect_geometry(&mut stream).unwrap_or_else(|| fallback_geometry(len));
            AnyPartitionTable::Pc98(Pc98PartitionTable::open(stream, geometry)?)
        }
        PartitionScheme::Bios => {
            let geometry =
                bios::detect_geometry(&mut stream).unwrap_or_else(|| fallback_geometry(len));
            AnyPartitionTable::Bios(BiosPartitionTable::open(stream, geometry)?)
        }
    };
    Ok(Some(table))
}
