//! Minimal ustar archives: building from in-memory entries and read-only access to the
//! files of an archive held in a stream.

use crate::object_cache::ObjectCache;
use crate::stream::{Ownership, SparseStream, SubStream};
use crate::{DiskError, Result};

const BLOCK: u64 = 512;
const NAME_LEN: usize = 100;
const PREFIX_OFFSET: usize = 345;
const PREFIX_LEN: usize = 155;
const CHECKSUM_OFFSET: usize = 148;
const TYPE_OFFSET: usize = 156;
const MAGIC_OFFSET: usize = 257;
const MAX_SIZE: u64 = 0o777_7777_7777;
const LOOKUP_CACHE_ENTRIES: usize = 64;
const LOOKUP_RECENT: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TarEntryKind {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarEntry {
    pub name: String,
    pub kind: TarEntryKind,
    pub size: u64,
    /// Byte offset of the content within the archive.
    pub data_offset: u64,
}

fn normalize(name: &str) -> &str {
    name.trim_start_matches("./")
        .trim_start_matches('/')
        .trim_end_matches('/')
}

fn put_octal(field: &mut [u8], value: u64) -> Result<()> {
    let digits = field.len() - 1;
    let text = format!("{value:0digits$o}");
    if text.len() > digits {
        return Err(DiskError::InvalidConfig("value does not fit a tar header field"));
    }
    field[..digits].copy_from_slice(text.as_bytes());
    field[digits] = 0;
    Ok(())
}

fn parse_octal(field: &[u8]) -> Result<u64> {
    let text = std::str::from_utf8(field)
        .map_err(|_| DiskError::CorruptStructure("non-ASCII numeric tar field"))?;
    let text = text.trim_matches(|c: char| c == '\0' || c == ' ');
    if text.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(text, 8)
        .map_err(|_| DiskError::CorruptStructure("malformed tar numeric field"))
}

fn header_checksum(header: &[u8]) -> u64 {
    header
        .iter()
        .enumerate()
        .map(|(i, b)| {
            if (CHECKSUM_OFFSET..CHECKSUM_OFFSET + 8).contains(&i) {
                b' ' as u64
            } else {
                *b as u64
            }
        })
        .sum()
}

fn cstr(field: &[u8]) -> String {
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn encode_header(name: &str, kind: TarEntryKind, size: u64) -> Result<[u8; BLOCK as usize]> {
    let mut name = normalize(name).to_owned();
    if name.is_empty() {
        return Err(DiskError::InvalidConfig("tar entry name is empty"));
    }
    if kind == TarEntryKind::Directory {
        name.push('/');
    }
    if name.len() > NAME_LEN {
        return Err(DiskError::InvalidConfig("tar entry name longer than 100 bytes"));
    }
    if size > MAX_SIZE {
        return Err(DiskError::InvalidConfig("tar entry larger than 8 GiB"));
    }

    let mut header = [0u8; BLOCK as usize];
    header[..name.len()].copy_from_slice(name.as_bytes());
    let mode = match kind {
        TarEntryKind::File => 0o644,
        TarEntryKind::Directory => 0o755,
    };
    put_octal(&mut header[100..108], mode)?;
    put_octal(&mut header[108..116], 0)?;
    put_octal(&mut header[116..124], 0)?;
    put_octal(&mut header[124..136], size)?;
    put_octal(&mut header[136..148], 0)?;
    header[TYPE_OFFSET] = match kind {
        TarEntryKind::File => b'0',
        TarEntryKind::Directory => b'5',
    };
    header[MAGIC_OFFSET..MAGIC_OFFSET + 6].copy_from_slice(b"ustar\0");
    header[MAGIC_OFFSET + 6..MAGIC_OFFSET + 8].copy_from_slice(b"00");

    let checksum = format!("{:06o}\0 ", header_checksum(&header));
    header[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 8].copy_from_slice(checksum.as_bytes());
    Ok(header)
}

/// Collects entries in memory and writes them out as one archive.
#[derive(Debug, Default)]
pub struct TarBuilder {
    entries: Vec<(String, TarEntryKind, Vec<u8>)>,
}

impl TarBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&mut self, name: &str, content: &[u8]) -> &mut Self {
        self.entries
            .push((name.to_owned(), TarEntryKind::File, content.to_vec()));
        self
    }

    pub fn add_directory(&mut self, name: &str) -> &mut Self {
        self.entries
            .push((name.to_owned(), TarEntryKind::Directory, Vec::new()));
        self
    }

    /// Writes the archive at offset 0 of `stream` and returns its length in bytes.
    pub fn build<S: SparseStream + ?Sized>(&self, stream: &mut S) -> Result<u64> {
        let mut offset = 0u64;
        for (name, kind, content) in &self.entries {
            let header = encode_header(name, *kind, content.len() as u64)?;
            stream.write_at(offset, &header)?;
            offset += BLOCK;
            stream.write_at(offset, content)?;
            let padded = (content.len() as u64).div_ceil(BLOCK) * BLOCK;
            let padding = (padded - content.len() as u64) as usize;
            if padding > 0 {
                stream.write_at(offset + content.len() as u64, &vec![0u8; padding])?;
            }
            offset += padded;
        }
        stream.write_at(offset, &[0u8; 2 * BLOCK as usize])?;
        offset += 2 * BLOCK;
        stream.flush()?;
        tracing::debug!(entries = self.entries.len(), bytes = offset, "built tar archive");
        Ok(offset)
    }
}

/// Read-only view of a tar archive held in a stream.
pub struct TarFile<S> {
    stream: S,
    entries: Vec<TarEntry>,
    lookups: ObjectCache<String, Option<usize>>,
}

impl<S: SparseStream> TarFile<S> {
    /// Scans every header up to the terminating zero block.
    pub fn open(mut stream: S) -> Result<Self> {
        let len = stream.len();
        let mut entries = Vec::new();
        let mut offset = 0u64;
        let mut header = [0u8; BLOCK as usize];

        while offset + BLOCK <= len {
            stream.read_exact_at(offset, &mut header)?;
            if header.iter().all(|b| *b == 0) {
                break;
            }
            let stored = parse_octal(&header[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 8])?;
            if stored != header_checksum(&header) {
                return Err(DiskError::CorruptStructure("tar header checksum mismatch"));
            }

            let mut name = cstr(&header[..NAME_LEN]);
            if &header[MAGIC_OFFSET..MAGIC_OFFSET + 5] == b"ustar" {
                let prefix = cstr(&header[PREFIX_OFFSET..PREFIX_OFFSET + PREFIX_LEN]);
                if !prefix.is_empty() {
                    name = format!("{prefix}/{name}");
                }
            }
            let size = parse_octal(&header[124..136])?;
            let kind = if header[TYPE_OFFSET] == b'5' || name.ends_with('/') {
                TarEntryKind::Directory
            } else {
                TarEntryKind::File
            };

            let data_offset = offset + BLOCK;
            let next = size
                .div_ceil(BLOCK)
                .checked_mul(BLOCK)
                .and_then(|padded| data_offset.checked_add(padded))
                .ok_or(DiskError::CorruptStructure("tar entry size overflows"))?;
            if data_offset + size > len {
                return Err(DiskError::CorruptStructure("tar entry extends past the archive"));
            }
            entries.push(TarEntry {
                name: normalize(&name).to_owned(),
                kind,
                size,
                data_offset,
            });
            offset = next;
        }

        Ok(Self {
            stream,
            entries,
            lookups: ObjectCache::new(LOOKUP_CACHE_ENTRIES, LOOKUP_RECENT)?,
        })
    }

    pub fn entries(&self) -> &[TarEntry] {
        &self.entries
    }

    fn find(&mut self, name: &str) -> Option<usize> {
        let key = normalize(name).to_owned();
        let entries = &self.entries;
        self.lookups
            .get_or_try_insert_with(&key, || {
                // Later entries replace earlier ones with the same name.
                Ok(entries.iter().rposition(|e| e.name == key))
            })
            .ok()
            .flatten()
    }

    pub fn file_exists(&mut self, name: &str) -> bool {
        self.find(name)
            .is_some_and(|i| self.entries[i].kind == TarEntryKind::File)
    }

    pub fn dir_exists(&mut self, name: &str) -> bool {
        self.find(name)
            .is_some_and(|i| self.entries[i].kind == TarEntryKind::Directory)
    }

    /// A view over the content of file `name`, or `None` if the archive has no such file.
    pub fn open_file(&mut self, name: &str) -> Result<Option<SubStream<&mut S>>> {
        let Some(index) = self.find(name) else {
            return Ok(None);
        };
        let entry = &self.entries[index];
        if entry.kind != TarEntryKind::File {
            return Ok(None);
        }
        let (first, size) = (entry.data_offset, entry.size);
        SubStream::new(&mut self.stream, Ownership::DoesNotOwn, first, size).map(Some)
    }

    pub fn into_stream(self) -> S {
        self.stream
    }
}
