use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use bytes::{Buf, Bytes};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, trace};

use crate::{
    IndexEntry, IndexEntryBytes, PakError, ResourceType, INDEX_ENTRY_LEN, NAME_LEN, PAK_HEADER_LEN,
    PAK_MAGIC, PAK_VERSION,
};

/// An open archive with its index in memory
///
/// Entry lookups are case-insensitive. Reads lock the underlying reader, so
/// a [Pak] can be shared between threads.
pub struct Pak<R = BufReader<File>> {
    reader: Mutex<R>,
    entries: Vec<IndexEntry>,
    by_name: HashMap<String, usize>,
}

impl Pak<BufReader<File>> {
    /// Open an archive file and load its index
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PakError> {
        Self::from_reader(BufReader::new(File::open(path)?))
    }
}

fn read_exact_or_truncated<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), PakError> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            PakError::Truncated
        } else {
            PakError::Io(e)
        }
    })
}

impl<R: Read + Seek> Pak<R> {
    /// Load an archive from a reader positioned at the header
    pub fn from_reader(mut reader: R) -> Result<Self, PakError> {
        let mut header = [0u8; PAK_HEADER_LEN];
        read_exact_or_truncated(&mut reader, &mut header)?;
        if header[0..4] != PAK_MAGIC {
            return Err(PakError::InvalidMagic);
        }
        let mut rest = &header[4..];
        let version = rest.get_u32_le();
        if version > PAK_VERSION {
            return Err(PakError::UnsupportedVersion(version));
        }
        let count = rest.get_u32_le() as usize;

        let mut entries = Vec::with_capacity(count);
        let mut by_name = HashMap::with_capacity(count);
        for _ in 0..count {
            let mut entry_bytes: IndexEntryBytes = [0; INDEX_ENTRY_LEN];
            read_exact_or_truncated(&mut reader, &mut entry_bytes)?;
            let entry = IndexEntry::from_bytes(&entry_bytes)?;
            if by_name
                .insert(entry.name.to_ascii_lowercase(), entries.len())
                .is_some()
            {
                return Err(PakError::DuplicateName(entry.name));
            }
            entries.push(entry);
        }

        let data_start = (PAK_HEADER_LEN + count * INDEX_ENTRY_LEN) as u64;
        let file_len = reader.seek(SeekFrom::End(0))?;
        let mut ranges: Vec<(u64, u64, &str)> = entries
            .iter()
            .map(|e| (e.offset, e.offset + u64::from(e.comp_size), e.name.as_str()))
            .collect();
        ranges.sort_unstable_by_key(|r| r.0);
        let mut last_end = data_start;
        for (start, end, name) in ranges {
            if start < data_start {
                return Err(PakError::CorruptEntry(format!(
                    "{name}: data inside the header region"
                )));
            }
            if start < last_end {
                return Err(PakError::CorruptEntry(format!(
                    "{name}: data overlaps another entry"
                )));
            }
            if end > file_len {
                return Err(PakError::Truncated);
            }
            last_end = end;
        }
        debug!("Opened archive with {} entries", entries.len());

        Ok(Self {
            reader: Mutex::new(reader),
            entries,
            by_name,
        })
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry names in index order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    /// Whether a resource with this name exists; names match
    /// case-insensitively
    pub fn contains(&self, name: &str) -> bool {
        self.entry(name).is_some()
    }

    /// Index metadata for a named resource
    pub fn entry(&self, name: &str) -> Option<&IndexEntry> {
        self.by_name
            .get(&name.to_ascii_lowercase())
            .map(|&i| &self.entries[i])
    }

    /// Names of all entries of a given type, in index order
    pub fn list_by_type(&self, resource_type: ResourceType) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.resource_type == resource_type)
            .map(|e| e.name.as_str())
            .collect()
    }

    /// Read and decompress a resource
    pub fn get(&self, name: &str) -> Result<Bytes, PakError> {
        let entry = self
            .entry(name)
            .ok_or_else(|| PakError::ResourceNotFound(name.to_string()))?;
        trace!(
            "Reading {:?}: {} bytes at {:#x}",
            entry.name,
            entry.comp_size,
            entry.offset
        );

        let mut raw = vec![0u8; entry.comp_size as usize];
        {
            let mut reader = self.reader.lock().unwrap();
            reader.seek(SeekFrom::Start(entry.offset))?;
            read_exact_or_truncated(&mut *reader, &mut raw)?;
        }

        if entry.is_raw() {
            return Ok(Bytes::from(raw));
        }
        let mut out = Vec::with_capacity(entry.orig_size as usize);
        GzDecoder::new(&raw[..])
            .read_to_end(&mut out)
            .map_err(|e| PakError::CorruptEntry(format!("{}: {e}", entry.name)))?;
        if out.len() != entry.orig_size as usize {
            return Err(PakError::CorruptEntry(format!(
                "{}: expanded to {} bytes instead of {}",
                entry.name,
                out.len(),
                entry.orig_size
            )));
        }
        Ok(Bytes::from(out))
    }
}

/// A resource to be packed by [create] or [write_to]
#[derive(Debug, Clone, Copy)]
pub struct PakSource<'a> {
    pub name: &'a str,
    pub resource_type: ResourceType,
    pub data: &'a [u8],
}

impl<'a> PakSource<'a> {
    /// Source with the type inferred from the name
    pub fn new(name: &'a str, data: &'a [u8]) -> Self {
        Self {
            name,
            resource_type: crate::infer_type(name),
            data,
        }
    }
}

/// Create an archive file from a set of resources
pub fn create<P: AsRef<Path>>(path: P, sources: &[PakSource]) -> Result<(), PakError> {
    let mut out = BufWriter::new(File::create(path)?);
    write_to(&mut out, sources)?;
    out.flush()?;
    Ok(())
}

/// Write an archive to a writer
///
/// Every entry is compressed at the highest GZIP level; when that does not
/// shrink it the entry is stored raw instead. The header is written first,
/// then the fixed-size index, then the blobs in index order.
pub fn write_to<W: Write>(writer: &mut W, sources: &[PakSource]) -> Result<(), PakError> {
    let mut seen = HashMap::new();
    for source in sources {
        if source.name.len() >= NAME_LEN {
            return Err(PakError::NameTooLong(source.name.to_string()));
        }
        if seen
            .insert(source.name.to_ascii_lowercase(), ())
            .is_some()
        {
            return Err(PakError::DuplicateName(source.name.to_string()));
        }
    }

    let mut blobs = Vec::with_capacity(sources.len());
    for source in sources {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(source.data)?;
        let compressed = encoder.finish()?;
        let blob = if compressed.len() < source.data.len() {
            compressed
        } else {
            // Compression did not help; comp_size == orig_size marks the
            // entry as raw
            source.data.to_vec()
        };
        trace!(
            "Packing {:?}: {} -> {} bytes",
            source.name,
            source.data.len(),
            blob.len()
        );
        blobs.push(blob);
    }

    let mut header = Vec::with_capacity(PAK_HEADER_LEN);
    header.extend_from_slice(&PAK_MAGIC);
    header.extend_from_slice(&PAK_VERSION.to_le_bytes());
    header.extend_from_slice(&(sources.len() as u32).to_le_bytes());
    writer.write_all(&header)?;

    let mut offset = (PAK_HEADER_LEN + sources.len() * INDEX_ENTRY_LEN) as u64;
    for (source, blob) in sources.iter().zip(&blobs) {
        let entry = IndexEntry {
            name: source.name.to_string(),
            offset,
            comp_size: blob.len() as u32,
            orig_size: source.data.len() as u32,
            resource_type: source.resource_type,
        };
        if source.data.len() > i32::MAX as usize {
            return Err(PakError::EntryTooLarge(source.name.to_string()));
        }
        writer.write_all(&entry.to_bytes()?)?;
        offset += blob.len() as u64;
    }
    for blob in &blobs {
        writer.write_all(blob)?;
    }
    Ok(())
}
