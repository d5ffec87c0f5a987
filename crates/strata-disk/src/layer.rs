use serde::{Deserialize, Serialize};

use crate::geometry::Geometry;
use crate::sparse_layer::{SparseLayer, SPARSE_MAGIC};
use crate::stream::{AccessMode, BoxedStream, Ownership, SharedStream, SparseStream, StreamHandle};
use crate::{DiskError, Result};

pub const OPTICAL_SECTOR_SIZE: u32 = 2048;

const ISO_DESCRIPTOR_OFFSET: u64 = 0x8001;
const ISO_IDENTIFIER: [u8; 5] = *b"CD001";

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum DiskFormat {
    Raw,
    Optical,
    Sparse,
}

impl DiskFormat {
    pub fn name(self) -> &'static str {
        match self {
            DiskFormat::Raw => "raw",
            DiskFormat::Optical => "optical",
            DiskFormat::Sparse => "sparse",
        }
    }

    pub fn supports_differencing(self) -> bool {
        matches!(self, DiskFormat::Sparse)
    }

    /// Detects the image format from magic values.
    ///
    /// Unknown content falls back to [`DiskFormat::Raw`]; only I/O failures are errors.
    pub fn detect<S: SparseStream + ?Sized>(stream: &mut S) -> Result<DiskFormat> {
        let len = stream.len();

        if len >= SPARSE_MAGIC.len() as u64 {
            let mut magic = [0u8; 8];
            stream.read_exact_at(0, &mut magic)?;
            if magic == SPARSE_MAGIC {
                return Ok(DiskFormat::Sparse);
            }
        }

        if len > ISO_DESCRIPTOR_OFFSET + ISO_IDENTIFIER.len() as u64
            && len % OPTICAL_SECTOR_SIZE as u64 == 0
        {
            let mut ident = [0u8; 5];
            stream.read_exact_at(ISO_DESCRIPTOR_OFFSET, &mut ident)?;
            if ident == ISO_IDENTIFIER {
                return Ok(DiskFormat::Optical);
            }
        }

        Ok(DiskFormat::Raw)
    }
}

/// One physical representation of (part of) a virtual disk's content.
pub trait VirtualDiskLayer {
    fn format(&self) -> DiskFormat;

    fn capacity(&self) -> u64;

    /// Geometry recorded by the layer itself, if the format stores one.
    fn geometry(&self) -> Option<Geometry>;

    fn is_sparse(&self) -> bool;

    fn needs_parent(&self) -> bool;

    /// Candidate locations of the parent layer, in the order they should be tried.
    fn parent_locations(&self) -> Vec<String>;

    fn is_read_only(&self) -> bool;

    /// Builds this layer's view of the disk content on top of `parent`.
    fn open_content(&mut self, parent: Option<BoxedStream>) -> Result<BoxedStream>;

    fn close(&mut self) -> Result<()>;
}

/// Wraps a caller-supplied stream for use as a layer's backing store.
pub(crate) fn backing_stream(
    stream: BoxedStream,
    ownership: Ownership,
    access: AccessMode,
) -> SharedStream {
    let handle = if access.can_write() {
        StreamHandle::new(stream, ownership)
    } else {
        StreamHandle::read_only(stream, ownership)
    };
    SharedStream::new(handle)
}

/// A layer whose backing stream *is* the disk content (raw and optical images).
pub struct FlatLayer {
    format: DiskFormat,
    stream: SharedStream,
    read_only: bool,
}

impl FlatLayer {
    pub fn open(
        stream: BoxedStream,
        ownership: Ownership,
        format: DiskFormat,
        access: AccessMode,
    ) -> Result<Self> {
        match format {
            DiskFormat::Raw => {}
            DiskFormat::Optical if access.can_write() => {
                return Err(DiskError::AccessDenied("optical images are read-only"));
            }
            DiskFormat::Optical => {}
            DiskFormat::Sparse => {
                return Err(DiskError::InvalidConfig("sparse images are not flat"));
            }
        }
        if access.can_write() && !stream.can_write() {
            return Err(DiskError::AccessDenied("backing stream is not writable"));
        }
        Ok(Self {
            format,
            stream: backing_stream(stream, ownership, access),
            read_only: !access.can_write(),
        })
    }

    /// Creates a zero-filled raw image of `capacity` bytes.
    pub fn initialize_raw(
        mut stream: BoxedStream,
        ownership: Ownership,
        capacity: u64,
    ) -> Result<Self> {
        stream.set_len(0)?;
        stream.set_len(capacity)?;
        stream.flush()?;
        Self::open(stream, ownership, DiskFormat::Raw, AccessMode::ReadWrite)
    }
}

impl VirtualDiskLayer for FlatLayer {
    fn format(&self) -> DiskFormat {
        self.format
    }

    fn capacity(&self) -> u64 {
        self.stream.len()
    }

    fn geometry(&self) -> Option<Geometry> {
        match self.format {
            DiskFormat::Optical => Some(Geometry::with_sector_size(
                (self.capacity() / OPTICAL_SECTOR_SIZE as u64).min(u32::MAX as u64) as u32,
                1,
                1,
                OPTICAL_SECTOR_SIZE,
            )),
            _ => None,
        }
    }

    fn is_sparse(&self) -> bool {
        false
    }

    fn needs_parent(&self) -> bool {
        false
    }

    fn parent_locations(&self) -> Vec<String> {
        Vec::new()
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn open_content(&mut self, parent: Option<BoxedStream>) -> Result<BoxedStream> {
        if parent.is_some() {
            return Err(DiskError::UnsupportedForFormat {
                format: self.format.name(),
                operation: "differencing",
            });
        }
        Ok(Box::new(self.stream.share()))
    }

    fn close(&mut self) -> Result<()> {
        self.stream.close()
    }
}

/// Closed set of layer kinds a [`crate::VirtualDisk`] can be built from.
pub enum DiskLayer {
    Flat(FlatLayer),
    Sparse(SparseLayer),
}

impl DiskLayer {
    /// Detects the format of `stream` and opens it as a layer.
    pub fn open(mut stream: BoxedStream, ownership: Ownership, access: AccessMode) -> Result<Self> {
        let format = DiskFormat::detect(&mut stream)?;
        tracing::debug!(format = format.name(), "opening disk layer");
        match format {
            DiskFormat::Raw | DiskFormat::Optical => Ok(DiskLayer::Flat(FlatLayer::open(
                stream, ownership, format, access,
            )?)),
            DiskFormat::Sparse => Ok(DiskLayer::Sparse(SparseLayer::open(
                stream, ownership, access,
            )?)),
        }
    }

    fn as_layer(&self) -> &dyn VirtualDiskLayer {
        match self {
            DiskLayer::Flat(l) => l,
            DiskLayer::Sparse(l) => l,
        }
    }

    fn as_layer_mut(&mut self) -> &mut dyn VirtualDiskLayer {
        match self {
            DiskLayer::Flat(l) => l,
            DiskLayer::Sparse(l) => l,
        }
    }
}

impl VirtualDiskLayer for DiskLayer {
    fn format(&self) -> DiskFormat {
        self.as_layer().format()
    }

    fn capacity(&self) -> u64 {
        self.as_layer().capacity()
    }

    fn geometry(&self) -> Option<Geometry> {
        self.as_layer().geometry()
    }

    fn is_sparse(&self) -> bool {
        self.as_layer().is_sparse()
    }

    fn needs_parent(&self) -> bool {
        self.as_layer().needs_parent()
    }

    fn parent_locations(&self) -> Vec<String> {
        self.as_layer().parent_locations()
    }

    fn is_read_only(&self) -> bool {
        self.as_layer().is_read_only()
    }

    fn open_content(&mut self, parent: Option<BoxedStream>) -> Result<BoxedStream> {
        self.as_layer_mut().open_content(parent)
    }

    fn close(&mut self) -> Result<()> {
        self.as_layer_mut().close()
    }
}
