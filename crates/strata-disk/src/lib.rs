//! Sparse storage primitives, layered virtual disks and partition tables.
//!
//! Everything here is synchronous and byte-addressed. The crate is organised bottom-up:
//!
//! - [`Buffer`] / [`SparseStream`]: random-access storage that can report which byte
//!   ranges actually hold data ([`Extent`]s), with memory, file, windowed, shared and
//!   cached implementations
//! - [`VirtualDisk`]: a logical disk composed from a chain of [`DiskLayer`]s, where
//!   sparse differencing layers fall through to their parents for unallocated blocks
//! - [`partitions`]: BIOS MBR, GPT and PC-98 partition tables with a common
//!   allocation engine
//! - [`TarFile`] / [`TarBuilder`]: ustar archives addressed as sub-streams
//!
//! Ownership of every stream handed to a constructor is explicit ([`Ownership`]); a layer
//! or view only closes the streams it owns.

mod buffer;
mod cache;
mod disk;
mod error;
mod extent;
mod file;
mod geometry;
mod layer;
mod locator;
mod object_cache;
pub mod partitions;
mod sparse_buffer;
mod sparse_layer;
mod stream;
mod tar;
mod util;

pub use buffer::{Buffer, SubBuffer};
pub use cache::{BlockCacheConfig, BlockCacheStats, BlockCacheStream};
pub use disk::{VirtualDisk, MAX_CHAIN_DEPTH};
pub use error::{DiskError, Result};
pub use extent::{rebase_extents, union_in_range, Extent};
pub use file::FileStream;
pub use geometry::{
    ChsAddress, Geometry, DEFAULT_SECTOR_SIZE, MAX_BIOS_CYLINDERS, MAX_BIOS_HEADS,
    MAX_BIOS_SECTORS,
};
pub use layer::{DiskFormat, DiskLayer, FlatLayer, VirtualDiskLayer, OPTICAL_SECTOR_SIZE};
pub use locator::{DirectoryLocator, FileLocator, MemoryLocator, NoLocator};
pub use object_cache::ObjectCache;
pub use partitions::{
    detect_schemes, open_partition_table, AnyPartitionTable, DetectionPolicy, PartitionInfo,
    PartitionScheme, PartitionTable, PartitionType, WellKnownPartitionType,
};
pub use sparse_buffer::{SparseMemoryBuffer, DEFAULT_CHUNK_SIZE};
pub use sparse_layer::{
    SparseHeader, SparseLayer, SparseLayerConfig, SparseLayerStream, DEFAULT_BLOCK_SIZE,
    SPARSE_HEADER_SIZE, SPARSE_MAGIC, SPARSE_VERSION,
};
pub use stream::{
    AccessMode, BoxedStream, BufferStream, Ownership, SharedStream, SparseStream,
    StreamHandle, SubStream,
};
pub use tar::{TarBuilder, TarEntry, TarEntryKind, TarFile};
pub use util::{align_down_u64, align_up_u64, checked_range};

#[cfg(test)]
mod proptests;
