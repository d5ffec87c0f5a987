//! Cylinder/head/sector disk geometry and CHS <-> LBA translation.
//!
//! CHS sectors are 1-based (BIOS convention); cylinders and heads are 0-based.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{DiskError, Result};

pub const DEFAULT_SECTOR_SIZE: u32 = 512;

/// Largest geometry a BIOS INT 13h CHS address can describe.
pub const MAX_BIOS_CYLINDERS: u32 = 1024;
pub const MAX_BIOS_HEADS: u32 = 255;
pub const MAX_BIOS_SECTORS: u32 = 63;

const FLOPPY_GEOMETRIES: [(u64, Geometry); 3] = [
    (
        720 * 1024,
        Geometry::with_sector_size(80, 2, 9, DEFAULT_SECTOR_SIZE),
    ),
    (
        1440 * 1024,
        Geometry::with_sector_size(80, 2, 18, DEFAULT_SECTOR_SIZE),
    ),
    (
        2880 * 1024,
        Geometry::with_sector_size(80, 2, 36, DEFAULT_SECTOR_SIZE),
    ),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChsAddress {
    pub cylinder: u32,
    pub head: u32,
    pub sector: u32,
}

impl ChsAddress {
    pub const fn new(cylinder: u32, head: u32, sector: u32) -> Self {
        Self {
            cylinder,
            head,
            sector,
        }
    }
}

impl fmt::Display for ChsAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}/{}/{})", self.cylinder, self.head, self.sector)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Geometry {
    pub cylinders: u32,
    pub heads_per_cylinder: u32,
    pub sectors_per_track: u32,
    pub bytes_per_sector: u32,
}

impl Geometry {
    pub const fn new(cylinders: u32, heads_per_cylinder: u32, sectors_per_track: u32) -> Self {
        Self::with_sector_size(
            cylinders,
            heads_per_cylinder,
            sectors_per_track,
            DEFAULT_SECTOR_SIZE,
        )
    }

    pub const fn with_sector_size(
        cylinders: u32,
        heads_per_cylinder: u32,
        sectors_per_track: u32,
        bytes_per_sector: u32,
    ) -> Self {
        Self {
            cylinders,
            heads_per_cylinder,
            sectors_per_track,
            bytes_per_sector,
        }
    }

    /// Derives a geometry with the given head/sector layout, fitting as many whole
    /// cylinders as `capacity` allows.
    pub fn from_capacity_and_layout(
        capacity: u64,
        heads_per_cylinder: u32,
        sectors_per_track: u32,
        bytes_per_sector: u32,
    ) -> Self {
        let cylinder_bytes =
            heads_per_cylinder as u64 * sectors_per_track as u64 * bytes_per_sector as u64;
        let cylinders = if cylinder_bytes == 0 {
            0
        } else {
            (capacity / cylinder_bytes).min(u32::MAX as u64) as u32
        };
        Self::with_sector_size(
            cylinders,
            heads_per_cylinder,
            sectors_per_track,
            bytes_per_sector,
        )
    }

    /// Synthesises a geometry for a disk of `capacity` bytes with 512-byte sectors.
    ///
    /// This is the algorithm used by fixed and dynamic VHD images, so geometries agree
    /// with what other tools report for the same capacity.
    pub fn from_capacity(capacity: u64) -> Self {
        let mut total_sectors = capacity / DEFAULT_SECTOR_SIZE as u64;
        total_sectors = total_sectors.min(65535 * 16 * 255);

        let (spt, heads, cyl_times_heads) = if total_sectors > 65535 * 16 * 63 {
            (255u64, 16u64, total_sectors / 255)
        } else {
            let mut spt = 17u64;
            let mut cth = total_sectors / spt;
            let mut heads = ((cth + 1023) / 1024).max(4);

            if cth >= heads * 1024 || heads > 16 {
                spt = 31;
                heads = 16;
                cth = total_sectors / spt;
            }
            if cth >= heads * 1024 {
                spt = 63;
                heads = 16;
                cth = total_sectors / spt;
            }
            (spt, heads, cth)
        };

        let cylinders = cyl_times_heads / heads;
        Self::new(cylinders as u32, heads as u32, spt as u32)
    }

    /// The standard floppy geometry whose capacity is exactly `capacity`, if any.
    pub fn floppy(capacity: u64) -> Option<Self> {
        FLOPPY_GEOMETRIES
            .iter()
            .find(|(size, _)| *size == capacity)
            .map(|(_, g)| *g)
    }

    /// LBA-assisted translation as performed by BIOSes for large disks.
    pub fn lba_assisted(capacity: u64) -> Self {
        const MIB: u64 = 1024 * 1024;
        let heads: u32 = if capacity <= 504 * MIB {
            16
        } else if capacity <= 1008 * MIB {
            32
        } else if capacity <= 2016 * MIB {
            64
        } else if capacity <= 4032 * MIB {
            128
        } else {
            255
        };
        let spt = MAX_BIOS_SECTORS;
        let cylinders = (capacity / (heads as u64 * spt as u64 * DEFAULT_SECTOR_SIZE as u64))
            .min(MAX_BIOS_CYLINDERS as u64) as u32;
        Self::new(cylinders, heads, spt)
    }

    pub fn is_bios_safe(&self) -> bool {
        self.cylinders <= MAX_BIOS_CYLINDERS
            && self.heads_per_cylinder <= MAX_BIOS_HEADS
            && self.sectors_per_track <= MAX_BIOS_SECTORS
    }

    /// Returns `self` if a BIOS can address it, otherwise the LBA-assisted geometry.
    pub fn make_bios_safe(&self, capacity: u64) -> Self {
        if self.is_bios_safe() {
            *self
        } else {
            Self::lba_assisted(capacity)
        }
    }

    pub fn total_sectors(&self) -> u64 {
        self.cylinders as u64 * self.heads_per_cylinder as u64 * self.sectors_per_track as u64
    }

    pub fn capacity(&self) -> u64 {
        self.total_sectors() * self.bytes_per_sector as u64
    }

    pub fn sectors_per_cylinder(&self) -> u64 {
        self.heads_per_cylinder as u64 * self.sectors_per_track as u64
    }

    pub fn bytes_per_cylinder(&self) -> u64 {
        self.sectors_per_cylinder() * self.bytes_per_sector as u64
    }

    pub fn last_sector(&self) -> ChsAddress {
        ChsAddress::new(
            self.cylinders.saturating_sub(1),
            self.heads_per_cylinder.saturating_sub(1),
            self.sectors_per_track,
        )
    }

    pub fn contains(&self, chs: ChsAddress) -> bool {
        chs.cylinder < self.cylinders
            && chs.head < self.heads_per_cylinder
            && chs.sector >= 1
            && chs.sector <= self.sectors_per_track
    }

    /// `(c * H + h) * S + s - 1`. Sector numbers start at 1.
    pub fn to_lba(&self, chs: ChsAddress) -> Result<u64> {
        let sector_index = (chs.sector as u64)
            .checked_sub(1)
            .ok_or(DiskError::InvalidConfig("CHS sector numbers start at 1"))?;
        (chs.cylinder as u64)
            .checked_mul(self.heads_per_cylinder as u64)
            .and_then(|track| track.checked_add(chs.head as u64))
            .and_then(|track| track.checked_mul(self.sectors_per_track as u64))
            .and_then(|lba| lba.checked_add(sector_index))
            .ok_or(DiskError::OffsetOverflow)
    }

    pub fn to_chs(&self, lba: u64) -> ChsAddress {
        let spt = self.sectors_per_track.max(1) as u64;
        let heads = self.heads_per_cylinder.max(1) as u64;
        let cylinder = lba / (spt * heads);
        let head = (lba / spt) % heads;
        let sector = lba % spt + 1;
        ChsAddress::new(
            cylinder.min(u32::MAX as u64) as u32,
            head as u32,
            sector as u32,
        )
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}/{}/{}:{})",
            self.cylinders, self.heads_per_cylinder, self.sectors_per_track, self.bytes_per_sector
        )
    }
}
