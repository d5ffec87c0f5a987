use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::extent::Extent;
use crate::stream::{resolve_seek, AccessMode, SparseStream};
use crate::util::checked_end;
use crate::{DiskError, Result};

/// [`SparseStream`] backed by a host file.
///
/// The file is reported as a single extent; holes in host sparse files are not reported.
pub struct FileStream {
    file: Option<File>,
    access: AccessMode,
    len: u64,
    position: u64,
}

impl FileStream {
    /// Creates (or truncates) `path` for read-write access.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Self::from_file(file, AccessMode::ReadWrite)
    }

    pub fn open(path: impl AsRef<Path>, access: AccessMode) -> Result<Self> {
        let file = OpenOptions::new()
            .read(access.can_read())
            .write(access.can_write())
            .open(path)?;
        Self::from_file(file, access)
    }

    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(path, AccessMode::Read)
    }

    /// Wraps an already opened file. `access` must match how the file was opened.
    pub fn from_file(file: File, access: AccessMode) -> Result<Self> {
        let len = file.metadata()?.len();
        Ok(Self {
            file: Some(file),
            access,
            len,
            position: 0,
        })
    }

    /// Returns the file, or `None` if the stream was closed.
    pub fn into_file(self) -> Option<File> {
        self.file
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    fn file_mut(&mut self) -> Result<&mut File> {
        self.file.as_mut().ok_or(DiskError::Closed)
    }
}

impl SparseStream for FileStream {
    fn can_read(&self) -> bool {
        self.file.is_some() && self.access.can_read()
    }

    fn can_write(&self) -> bool {
        self.file.is_some() && self.access.can_write()
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        if self.file.is_none() {
            return Err(DiskError::Closed);
        }
        self.position = resolve_seek(self.position, self.len, pos)?;
        Ok(self.position)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.access.can_read() {
            return Err(DiskError::AccessDenied("file opened write-only"));
        }
        let position = self.position;
        let len = self.len;
        if position >= len {
            self.file_mut()?;
            return Ok(0);
        }
        let want = (len - position).min(buf.len() as u64) as usize;
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(position))?;
        let mut done = 0;
        while done < want {
            let n = file.read(&mut buf[done..want])?;
            if n == 0 {
                break;
            }
            done += n;
        }
        self.position += done as u64;
        Ok(done)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        if !self.access.can_write() {
            return Err(DiskError::AccessDenied("file opened read-only"));
        }
        let position = self.position;
        let end = checked_end(position, buf.len() as u64)?;
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(position))?;
        file.write_all(buf)?;
        self.position = end;
        self.len = self.len.max(end);
        Ok(())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        if !self.access.can_write() {
            return Err(DiskError::AccessDenied("file opened read-only"));
        }
        self.file_mut()?.set_len(len)?;
        self.len = len;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let writable = self.access.can_write();
        let file = self.file_mut()?;
        if writable {
            file.flush()?;
            file.sync_data()?;
        }
        Ok(())
    }

    fn extents_in_range(&mut self, start: u64, count: u64) -> Result<Vec<Extent>> {
        if self.file.is_none() {
            return Err(DiskError::Closed);
        }
        Ok(Extent::new(0, self.len)
            .intersect(start, count)
            .into_iter()
            .collect())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            if self.access.can_write() {
                file.flush()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_extend_the_file() {
        let file = tempfile::tempfile().unwrap();
        let mut s = FileStream::from_file(file, AccessMode::ReadWrite).unwrap();
        s.write_at(4096, b"tail").unwrap();
        assert_eq!(s.len(), 4100);
        assert_eq!(s.extents().unwrap(), vec![Extent::new(0, 4100)]);

        let mut hole = [0xAAu8; 16];
        assert_eq!(s.read_at(0, &mut hole).unwrap(), 16);
        assert!(hole.iter().all(|b| *b == 0));
    }

    #[test]
    fn closed_stream_rejects_io() {
        let file = tempfile::tempfile().unwrap();
        let mut s = FileStream::from_file(file, AccessMode::ReadWrite).unwrap();
        s.write_at(0, b"data").unwrap();
        s.close().unwrap();

        assert!(s.is_closed());
        let mut buf = [0u8; 4];
        assert_eq!(s.read_at(0, &mut buf).unwrap_err(), DiskError::Closed);
        assert_eq!(s.write(b"x").unwrap_err(), DiskError::Closed);
    }
}
