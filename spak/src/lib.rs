#![doc = include_str!("../README.md")]

/// Archive reader and writer
pub mod archive;

use bytes::{Buf, BufMut};
use strum::FromRepr;
use thiserror::Error;

/// File magic - the first 4 bytes of an archive
pub const PAK_MAGIC: [u8; 4] = *b"SPAK";
/// Highest archive version this crate understands
pub const PAK_VERSION: u32 = 1;
/// Length of the file header in bytes
pub const PAK_HEADER_LEN: usize = 12;
/// Length of one index entry in bytes
pub const INDEX_ENTRY_LEN: usize = 88;
/// Space for an entry name in the index, including the terminating NUL
pub const NAME_LEN: usize = 64;

/// Archive errors
#[derive(Debug, Error)]
pub enum PakError {
    #[error("Not a SPAK archive")]
    InvalidMagic,
    #[error("Unsupported archive version {0}")]
    UnsupportedVersion(u32),
    #[error("Archive is truncated")]
    Truncated,
    #[error("Corrupt entry: {0}")]
    CorruptEntry(String),
    #[error("No resource named {0:?}")]
    ResourceNotFound(String),
    #[error("Resource name {0:?} does not fit the index")]
    NameTooLong(String),
    #[error("Duplicate resource name {0:?}")]
    DuplicateName(String),
    #[error("Resource {0:?} is too large for the index")]
    EntryTooLarge(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Kind of resource stored in an archive entry
#[derive(Copy, Clone, Debug, FromRepr, Eq, PartialEq)]
pub enum ResourceType {
    Unknown = 0,
    Exploit = 1,
    Fdl1 = 2,
    Fdl2 = 3,
    Config = 4,
    Script = 5,
    Firmware = 6,
}

/// Guess the resource type from a file name
///
/// Matching is on the lower-cased name: an `exploit` substring wins, then
/// `fdl1`/`fdl2`, then well-known config and script extensions.
pub fn infer_type(filename: &str) -> ResourceType {
    let lower = filename.to_ascii_lowercase();
    if lower.contains("exploit") {
        return ResourceType::Exploit;
    }
    if lower.contains("fdl1") {
        return ResourceType::Fdl1;
    }
    if lower.contains("fdl2") {
        return ResourceType::Fdl2;
    }
    match lower.rsplit_once('.').map(|(_, ext)| ext) {
        Some("json") | Some("xml") | Some("ini") => ResourceType::Config,
        Some("bat") | Some("sh") | Some("ps1") => ResourceType::Script,
        _ => ResourceType::Unknown,
    }
}

/// Byte array which fits an index entry
pub type IndexEntryBytes = [u8; INDEX_ENTRY_LEN];

/// One entry of the in-memory archive index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Entry name; matched case-insensitively
    pub name: String,
    /// Absolute file offset of the entry data
    pub offset: u64,
    /// Bytes on disk
    pub comp_size: u32,
    /// Bytes after decompression; equal to comp_size for raw entries
    pub orig_size: u32,
    /// Kind of resource
    pub resource_type: ResourceType,
}

impl IndexEntry {
    /// Whether the entry data is stored without compression
    pub fn is_raw(&self) -> bool {
        self.comp_size == self.orig_size
    }

    /// Parse a raw index entry
    pub fn from_bytes(bytes: &IndexEntryBytes) -> Result<IndexEntry, PakError> {
        let name_bytes = &bytes[..NAME_LEN];
        if name_bytes[NAME_LEN - 1] != 0 {
            return Err(PakError::CorruptEntry("unterminated name".into()));
        }
        let nul = name_bytes.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        let name = std::str::from_utf8(&name_bytes[..nul])
            .map_err(|_| PakError::CorruptEntry("name is not valid UTF-8".into()))?
            .to_string();

        let mut rest = &bytes[NAME_LEN..];
        let offset = rest.get_i64_le();
        let comp_size = rest.get_i32_le();
        let orig_size = rest.get_i32_le();
        let resource_type = rest.get_u32_le();
        // reserved
        rest.advance(4);

        if offset < 0 || comp_size < 0 || orig_size < 0 {
            return Err(PakError::CorruptEntry(format!(
                "{name}: negative offset or size"
            )));
        }
        let Some(resource_type) = ResourceType::from_repr(resource_type as usize) else {
            return Err(PakError::CorruptEntry(format!(
                "{name}: unknown resource type {resource_type}"
            )));
        };

        Ok(IndexEntry {
            name,
            offset: offset as u64,
            comp_size: comp_size as u32,
            orig_size: orig_size as u32,
            resource_type,
        })
    }

    /// Convert into a raw index entry
    pub fn to_bytes(&self) -> Result<IndexEntryBytes, PakError> {
        if self.name.len() >= NAME_LEN {
            return Err(PakError::NameTooLong(self.name.clone()));
        }
        if self.comp_size > i32::MAX as u32
            || self.orig_size > i32::MAX as u32
            || self.offset > i64::MAX as u64
        {
            return Err(PakError::EntryTooLarge(self.name.clone()));
        }
        let mut bytes = [0; INDEX_ENTRY_LEN];
        bytes[..self.name.len()].copy_from_slice(self.name.as_bytes());
        let mut w = &mut bytes[NAME_LEN..];
        w.put_i64_le(self.offset as i64);
        w.put_i32_le(self.comp_size as i32);
        w.put_i32_le(self.orig_size as i32);
        w.put_u32_le(self.resource_type as u32);
        // reserved
        w.put_u32_le(0);
        Ok(bytes)
    }
}
