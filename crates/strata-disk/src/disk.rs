use std::path::Path;

use crate::file::FileStream;
use crate::geometry::Geometry;
use crate::layer::{DiskFormat, DiskLayer, FlatLayer, VirtualDiskLayer};
use crate::locator::{DirectoryLocator, FileLocator};
use crate::partitions::bios::detect_geometry;
use crate::sparse_layer::{SparseLayer, SparseLayerConfig, DEFAULT_BLOCK_SIZE};
use crate::stream::{AccessMode, BoxedStream, Ownership, SparseStream};
use crate::{DiskError, Result};

/// Longest parent chain that will be followed before the image is considered corrupt.
pub const MAX_CHAIN_DEPTH: usize = 64;

/// A logical disk assembled from a chain of layers.
///
/// `layers()[0]` is the most-derived layer; each later entry is the parent of the one
/// before it. Reads and writes go through [`VirtualDisk::content`], a single stream that
/// resolves every block from the most-derived layer that stores it. Only the most-derived
/// layer is ever written.
pub struct VirtualDisk {
    layers: Vec<DiskLayer>,
    content: Option<BoxedStream>,
    explicit_geometry: Option<Geometry>,
}

impl VirtualDisk {
    /// Opens the image in `stream`, resolving parent layers through `locator`.
    ///
    /// Parent streams are held with the locator's [`FileLocator::ownership`].
    pub fn open<S: SparseStream + 'static>(
        stream: S,
        ownership: Ownership,
        access: AccessMode,
        locator: &mut dyn FileLocator,
    ) -> Result<Self> {
        let parent_ownership = locator.ownership();
        Self::open_boxed(Box::new(stream), ownership, parent_ownership, access, locator)
    }

    /// Like [`VirtualDisk::open`], with the ownership of every parent stream given
    /// explicitly.
    pub fn open_boxed(
        stream: BoxedStream,
        ownership: Ownership,
        parent_ownership: Ownership,
        access: AccessMode,
        locator: &mut dyn FileLocator,
    ) -> Result<Self> {
        let mut layers = vec![DiskLayer::open(stream, ownership, access)?];

        loop {
            let depth = layers.len() - 1;
            let (needs_parent, candidates) = {
                let current = &layers[depth];
                (current.needs_parent(), current.parent_locations())
            };
            if !needs_parent {
                break;
            }
            if layers.len() >= MAX_CHAIN_DEPTH {
                return Err(DiskError::CorruptStructure("differencing chain is too deep"));
            }

            let mut parent = None;
            for location in &candidates {
                if !locator.exists(location) {
                    continue;
                }
                let opened = locator
                    .open(location, AccessMode::Read)
                    .and_then(|s| DiskLayer::open(s, parent_ownership, AccessMode::Read));
                match opened {
                    Ok(layer) => {
                        tracing::debug!(depth, %location, "resolved parent layer");
                        parent = Some(layer);
                        break;
                    }
                    Err(err) => {
                        tracing::debug!(depth, %location, %err, "parent candidate failed to open");
                    }
                }
            }

            match parent {
                Some(layer) => layers.push(layer),
                None => {
                    return Err(DiskError::ParentNotFound {
                        layer: depth,
                        candidates,
                    })
                }
            }
        }

        Self::compose(layers, None)
    }

    /// Opens an image file; parents are looked up relative to the image's directory.
    pub fn open_file(path: impl AsRef<Path>, access: AccessMode) -> Result<Self> {
        let path = path.as_ref();
        let stream = FileStream::open(path, access)?;
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let mut locator = DirectoryLocator::new(dir);
        Self::open(stream, Ownership::Owns, access, &mut locator)
    }

    /// Creates a new, empty disk of `format` in `stream`.
    pub fn initialize<S: SparseStream + 'static>(
        stream: S,
        ownership: Ownership,
        format: DiskFormat,
        capacity: u64,
        geometry: Option<Geometry>,
    ) -> Result<Self> {
        let stream: BoxedStream = Box::new(stream);
        let layer = match format {
            DiskFormat::Raw => {
                DiskLayer::Flat(FlatLayer::initialize_raw(stream, ownership, capacity)?)
            }
            DiskFormat::Optical => {
                return Err(DiskError::UnsupportedForFormat {
                    format: format.name(),
                    operation: "initialize",
                })
            }
            DiskFormat::Sparse => DiskLayer::Sparse(SparseLayer::initialize(
                stream,
                ownership,
                SparseLayerConfig {
                    disk_size_bytes: capacity,
                    block_size_bytes: DEFAULT_BLOCK_SIZE,
                    geometry,
                },
            )?),
        };
        tracing::debug!(format = format.name(), capacity, "initialized virtual disk");
        Self::compose(vec![layer], geometry)
    }

    /// Creates a differencing child of this disk in `stream`.
    ///
    /// The child records `parent_location` as its only parent locator; the returned disk
    /// takes over this disk's layers as its parents.
    pub fn create_differencing<S: SparseStream + 'static>(
        mut self,
        stream: S,
        ownership: Ownership,
        parent_location: &str,
    ) -> Result<VirtualDisk> {
        let format = self.format();
        if !format.supports_differencing() {
            return Err(DiskError::UnsupportedForFormat {
                format: format.name(),
                operation: "differencing",
            });
        }

        let capacity = self.capacity();
        let geometry = self.geometry()?;
        let parent_content = self.content.take().ok_or(DiskError::Closed)?;

        let mut child = SparseLayer::initialize_differencing(
            Box::new(stream),
            ownership,
            capacity,
            geometry,
            DEFAULT_BLOCK_SIZE,
            vec![parent_location.to_owned()],
        )?;
        let content = child.open_content(Some(parent_content))?;

        let mut layers = Vec::with_capacity(self.layers.len() + 1);
        layers.push(DiskLayer::Sparse(child));
        layers.append(&mut self.layers);
        tracing::debug!(depth = layers.len(), %parent_location, "created differencing disk");

        Ok(VirtualDisk {
            layers,
            content: Some(content),
            explicit_geometry: None,
        })
    }

    fn compose(mut layers: Vec<DiskLayer>, explicit_geometry: Option<Geometry>) -> Result<Self> {
        let mut content: Option<BoxedStream> = None;
        for layer in layers.iter_mut().rev() {
            content = Some(layer.open_content(content.take())?);
        }
        let content = content.ok_or(DiskError::InvalidConfig("disk has no layers"))?;
        Ok(Self {
            layers,
            content: Some(content),
            explicit_geometry,
        })
    }

    pub fn layers(&self) -> &[DiskLayer] {
        &self.layers
    }

    pub fn format(&self) -> DiskFormat {
        self.layers[0].format()
    }

    pub fn capacity(&self) -> u64 {
        self.layers[0].capacity()
    }

    pub fn is_read_only(&self) -> bool {
        self.layers[0].is_read_only()
    }

    pub fn sector_size(&self) -> u32 {
        self.layers[0]
            .geometry()
            .map_or(crate::geometry::DEFAULT_SECTOR_SIZE, |g| g.bytes_per_sector)
    }

    /// The logical content of the disk.
    pub fn content(&mut self) -> Result<&mut BoxedStream> {
        self.content.as_mut().ok_or(DiskError::Closed)
    }

    /// Geometry of the disk.
    ///
    /// A layer-recorded or explicitly supplied geometry wins. Otherwise the geometry of a
    /// flat image is inferred: an exact floppy capacity, then the BIOS partition table in
    /// sector 0, then a geometry synthesised from the capacity.
    pub fn geometry(&mut self) -> Result<Geometry> {
        if let Some(g) = self.explicit_geometry.or_else(|| self.layers[0].geometry()) {
            return Ok(g);
        }
        let capacity = self.capacity();
        if let Some(g) = Geometry::floppy(capacity) {
            return Ok(g);
        }
        let content = self.content()?;
        if let Some(g) = detect_geometry(content) {
            return Ok(g);
        }
        Ok(Geometry::from_capacity(capacity))
    }

    /// A geometry a BIOS can address, translating large disks LBA-assisted style.
    pub fn bios_geometry(&mut self) -> Result<Geometry> {
        let capacity = self.capacity();
        Ok(self.geometry()?.make_bios_safe(capacity))
    }

    /// Closes the content stream, then every layer. Later I/O fails with `Closed`.
    pub fn close(&mut self) -> Result<()> {
        if let Some(mut content) = self.content.take() {
            content.close()?;
        }
        for layer in &mut self.layers {
            layer.close()?;
        }
        Ok(())
    }
}
