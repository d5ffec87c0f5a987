use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{DiskError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionScheme {
    Bios,
    Gpt,
    Pc98,
}

/// Scheme-independent partition kinds accepted by the allocation operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WellKnownPartitionType {
    WindowsFat,
    WindowsNtfs,
    Linux,
    LinuxSwap,
    LinuxLvm,
    EfiSystem,
    MicrosoftReserved,
}

/// The scheme-specific type marker stored in a partition entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionType {
    Bios(u8),
    Gpt(Uuid),
    Pc98 { mid: u8, sid: u8 },
}

pub mod bios_types {
    pub const EMPTY: u8 = 0x00;
    pub const FAT12: u8 = 0x01;
    pub const FAT16: u8 = 0x06;
    pub const NTFS: u8 = 0x07;
    pub const FAT32: u8 = 0x0B;
    pub const FAT32_LBA: u8 = 0x0C;
    pub const LINUX_SWAP: u8 = 0x82;
    pub const LINUX_NATIVE: u8 = 0x83;
    pub const LINUX_LVM: u8 = 0x8E;
    pub const GPT_PROTECTIVE: u8 = 0xEE;
    pub const EFI_SYSTEM: u8 = 0xEF;
}

pub mod gpt_types {
    use uuid::Uuid;

    pub const BASIC_DATA: Uuid = Uuid::from_u128(0xEBD0A0A2_B9E5_4433_87C0_68B6B72699C7);
    pub const MICROSOFT_RESERVED: Uuid = Uuid::from_u128(0xE3C9E316_0B5C_4DB8_817D_F92DF00215AE);
    pub const LINUX_FILESYSTEM: Uuid = Uuid::from_u128(0x0FC63DAF_8483_4772_8E79_3D69D8477DE4);
    pub const LINUX_SWAP: Uuid = Uuid::from_u128(0x0657FD6D_A4AB_43C4_84E5_0933C84B4F4F);
    pub const LINUX_LVM: Uuid = Uuid::from_u128(0xE6D6D379_F507_44C2_A23C_238F2A3DF928);
    pub const EFI_SYSTEM: Uuid = Uuid::from_u128(0xC12A7328_F81F_11D2_BA4B_00A0C93EC93B);
}

/// PC-98 `mid`/`sid` values, without the bootable/active bit.
pub mod pc98_types {
    pub const MID_DOS: u8 = 0x20;
    pub const SID_FAT12: u8 = 0x01;
    pub const SID_FAT16: u8 = 0x21;
    pub const SID_LINUX: u8 = 0x62;
}

const FAT16_LIMIT: u64 = 512 * 1024 * 1024;
/// Last sector addressable through a BIOS CHS tuple (1024/255/63).
const CHS_LIMIT_SECTORS: u64 = 1024 * 255 * 63;

impl WellKnownPartitionType {
    /// BIOS type byte for a partition of `size_bytes` ending at sector `last_sector`.
    pub fn bios_type(self, size_bytes: u64, last_sector: u64) -> Result<u8> {
        Ok(match self {
            WellKnownPartitionType::WindowsFat => {
                if size_bytes < FAT16_LIMIT {
                    bios_types::FAT16
                } else if last_sector < CHS_LIMIT_SECTORS {
                    bios_types::FAT32
                } else {
                    bios_types::FAT32_LBA
                }
            }
            WellKnownPartitionType::WindowsNtfs => bios_types::NTFS,
            WellKnownPartitionType::Linux => bios_types::LINUX_NATIVE,
            WellKnownPartitionType::LinuxSwap => bios_types::LINUX_SWAP,
            WellKnownPartitionType::LinuxLvm => bios_types::LINUX_LVM,
            WellKnownPartitionType::EfiSystem => bios_types::EFI_SYSTEM,
            WellKnownPartitionType::MicrosoftReserved => {
                return Err(DiskError::Unsupported(
                    "Microsoft reserved partitions only exist on GPT disks",
                ))
            }
        })
    }

    pub fn gpt_type(self) -> Uuid {
        match self {
            WellKnownPartitionType::WindowsFat | WellKnownPartitionType::WindowsNtfs => {
                gpt_types::BASIC_DATA
            }
            WellKnownPartitionType::Linux => gpt_types::LINUX_FILESYSTEM,
            WellKnownPartitionType::LinuxSwap => gpt_types::LINUX_SWAP,
            WellKnownPartitionType::LinuxLvm => gpt_types::LINUX_LVM,
            WellKnownPartitionType::EfiSystem => gpt_types::EFI_SYSTEM,
            WellKnownPartitionType::MicrosoftReserved => gpt_types::MICROSOFT_RESERVED,
        }
    }

    pub fn gpt_name(self) -> &'static str {
        match self {
            WellKnownPartitionType::WindowsFat | WellKnownPartitionType::WindowsNtfs => {
                "Basic data partition"
            }
            WellKnownPartitionType::Linux => "Linux filesystem",
            WellKnownPartitionType::LinuxSwap => "Linux swap",
            WellKnownPartitionType::LinuxLvm => "Linux LVM",
            WellKnownPartitionType::EfiSystem => "EFI system partition",
            WellKnownPartitionType::MicrosoftReserved => "Microsoft reserved partition",
        }
    }

    /// `(mid, sid, name)` for a PC-98 entry.
    pub fn pc98_type(self) -> Result<(u8, u8, &'static str)> {
        match self {
            WellKnownPartitionType::WindowsFat => {
                Ok((pc98_types::MID_DOS, pc98_types::SID_FAT16, "MS-DOS"))
            }
            WellKnownPartitionType::Linux => {
                Ok((pc98_types::MID_DOS, pc98_types::SID_LINUX, "Linux"))
            }
            _ => Err(DiskError::Unsupported(
                "partition type has no PC-98 encoding",
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub first_sector: u64,
    /// Inclusive.
    pub last_sector: u64,
    pub partition_type: PartitionType,
    pub is_active: bool,
    pub name: Option<String>,
    pub unique_id: Option<Uuid>,
}

impl PartitionInfo {
    /// Zero for an inverted span.
    pub fn sector_count(&self) -> u64 {
        self.last_sector
            .checked_sub(self.first_sector)
            .map_or(0, |span| span.saturating_add(1))
    }

    pub fn overlaps(&self, first: u64, last: u64) -> bool {
        self.first_sector <= last && first <= self.last_sector
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_fat_type_depends_on_size_and_position() {
        let fat = WellKnownPartitionType::WindowsFat;
        assert_eq!(fat.bios_type(100 << 20, 1000).unwrap(), bios_types::FAT16);
        assert_eq!(fat.bios_type(1 << 30, 2_000_000).unwrap(), bios_types::FAT32);
        assert_eq!(
            fat.bios_type(10 << 30, 20_000_000).unwrap(),
            bios_types::FAT32_LBA
        );
    }

    #[test]
    fn gpt_guids_render_canonically() {
        assert_eq!(
            gpt_types::BASIC_DATA.to_string(),
            "ebd0a0a2-b9e5-4433-87c0-68b6b72699c7"
        );
        assert_eq!(
            WellKnownPartitionType::MicrosoftReserved.gpt_type(),
            gpt_types::MICROSOFT_RESERVED
        );
    }

    #[test]
    fn inverted_span_has_no_sectors() {
        let mut info = PartitionInfo {
            first_sector: 10,
            last_sector: 19,
            partition_type: PartitionType::Bios(bios_types::LINUX_NATIVE),
            is_active: false,
            name: None,
            unique_id: None,
        };
        assert_eq!(info.sector_count(), 10);
        info.last_sector = 9;
        assert_eq!(info.sector_count(), 0);
        info.first_sector = 0;
        info.last_sector = u64::MAX;
        assert_eq!(info.sector_count(), u64::MAX);
    }
}
