use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::file::FileStream;
use crate::stream::{AccessMode, BoxedStream, Ownership, SharedStream};
use crate::{DiskError, Result};

/// Resolves parent-locator strings recorded in differencing layers to streams.
pub trait FileLocator {
    fn exists(&self, location: &str) -> bool;

    fn open(&mut self, location: &str, access: AccessMode) -> Result<BoxedStream>;

    /// Whether a layer opened over a stream from [`FileLocator::open`] closes it.
    fn ownership(&self) -> Ownership {
        Ownership::Owns
    }
}

/// Resolves locations relative to a host directory; absolute paths are used as-is.
#[derive(Debug, Clone)]
pub struct DirectoryLocator {
    root: PathBuf,
}

impl DirectoryLocator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, location: &str) -> PathBuf {
        let path = Path::new(location);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

impl FileLocator for DirectoryLocator {
    fn exists(&self, location: &str) -> bool {
        self.resolve(location).is_file()
    }

    fn open(&mut self, location: &str, access: AccessMode) -> Result<BoxedStream> {
        Ok(Box::new(FileStream::open(self.resolve(location), access)?))
    }
}

/// In-memory name -> stream table, mostly for tests and composed images.
///
/// Every `open` hands out a new borrowing [`SharedStream`] handle onto the registered
/// stream; the registered handles stay with the locator.
#[derive(Default)]
pub struct MemoryLocator {
    streams: HashMap<String, SharedStream>,
}

impl MemoryLocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, location: impl Into<String>, stream: SharedStream) {
        self.streams.insert(location.into(), stream);
    }

    pub fn remove(&mut self, location: &str) -> Option<SharedStream> {
        self.streams.remove(location)
    }
}

impl FileLocator for MemoryLocator {
    fn exists(&self, location: &str) -> bool {
        self.streams.contains_key(location)
    }

    fn open(&mut self, location: &str, _access: AccessMode) -> Result<BoxedStream> {
        let stream = self
            .streams
            .get(location)
            .ok_or(DiskError::Io(format!("no stream registered as {location}")))?;
        Ok(Box::new(stream.share()))
    }

    fn ownership(&self) -> Ownership {
        Ownership::DoesNotOwn
    }
}

/// Locator that resolves nothing; for images known to have no parent.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLocator;

impl FileLocator for NoLocator {
    fn exists(&self, _location: &str) -> bool {
        false
    }

    fn open(&mut self, location: &str, _access: AccessMode) -> Result<BoxedStream> {
        Err(DiskError::Io(format!("cannot resolve {location}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{BufferStream, SparseStream};

    #[test]
    fn memory_locator_hands_out_shared_handles() {
        let mut locator = MemoryLocator::new();
        locator.insert("base", SharedStream::new(BufferStream::from_bytes(b"base!").unwrap()));

        assert!(locator.exists("base"));
        assert!(!locator.exists("other"));

        let mut a = locator.open("base", AccessMode::Read).unwrap();
        let mut buf = [0u8; 5];
        a.read_exact_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"base!");
        assert_eq!(locator.ownership(), Ownership::DoesNotOwn);
        assert_eq!(DirectoryLocator::new(".").ownership(), Ownership::Owns);
        assert!(locator.open("other", AccessMode::Read).is_err());
    }

    #[test]
    fn directory_locator_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("parent.img"), [7u8; 16]).unwrap();

        let mut locator = DirectoryLocator::new(dir.path());
        assert!(locator.exists("parent.img"));
        assert!(!locator.exists("missing.img"));

        let s = locator.open("parent.img", AccessMode::Read).unwrap();
        assert_eq!(s.len(), 16);
    }
}
