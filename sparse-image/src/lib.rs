#![doc = include_str!("../README.md")]

/// Streaming readers yielding bounded sub-images
pub mod stream;

use strum::FromRepr;
use thiserror::Error;

/// File magic, little-endian, the first 4 bytes of a sparse image
pub const SPARSE_MAGIC: u32 = 0xed26ff3a;
/// On-disk size of the file header
pub const SPARSE_HEADER_LEN: usize = 28;
/// On-disk size of a chunk header
pub const CHUNK_HEADER_LEN: usize = 12;

/// Whether a byte prefix carries the sparse image magic
pub fn is_sparse(prefix: &[u8]) -> bool {
    prefix
        .get(..4)
        .map(|magic| magic == SPARSE_MAGIC.to_le_bytes())
        .unwrap_or(false)
}

/// Parsing and layout errors
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ParseError {
    #[error("Not enough bytes for a header")]
    Truncated,
    #[error("Missing sparse image magic")]
    UnknownMagic,
    #[error("Unsupported sparse format version {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },
    #[error("Header sizes disagree with the version 1.0 layout")]
    BadHeaderLayout,
    #[error("Unknown chunk type {0:#06x}")]
    UnknownChunkType(u16),
}

fn u16_at(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn u32_at(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn put_u16(bytes: &mut [u8], at: usize, value: u16) {
    bytes[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(bytes: &mut [u8], at: usize, value: u32) {
    bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

/// The 28 byte header leading a sparse image
///
/// Wire layout, every field little-endian: magic, major and minor version,
/// file header size, chunk header size, block size, expanded block count,
/// chunk count, crc32. Only version 1.0 with the standard header sizes is
/// accepted.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SparseHeader {
    /// Block size in bytes, a multiple of 4
    pub block_size: u32,
    /// Blocks in the expanded image
    pub blocks: u32,
    /// Chunks in the sparse image
    pub chunks: u32,
    /// Optional crc32 of the expanded image, 0 when absent
    pub checksum: u32,
}

impl SparseHeader {
    /// Parse the header at the start of `bytes`
    pub fn parse(bytes: &[u8]) -> Result<SparseHeader, ParseError> {
        if bytes.len() < SPARSE_HEADER_LEN {
            return Err(ParseError::Truncated);
        }
        if !is_sparse(bytes) {
            return Err(ParseError::UnknownMagic);
        }
        let major = u16_at(bytes, 4);
        let minor = u16_at(bytes, 6);
        if (major, minor) != (1, 0) {
            return Err(ParseError::UnsupportedVersion { major, minor });
        }
        let header_len = usize::from(u16_at(bytes, 8));
        let chunk_header_len = usize::from(u16_at(bytes, 10));
        if header_len != SPARSE_HEADER_LEN || chunk_header_len != CHUNK_HEADER_LEN {
            return Err(ParseError::BadHeaderLayout);
        }

        Ok(SparseHeader {
            block_size: u32_at(bytes, 12),
            blocks: u32_at(bytes, 16),
            chunks: u32_at(bytes, 20),
            checksum: u32_at(bytes, 24),
        })
    }

    /// Encode the header into its wire form
    pub fn encode(&self) -> [u8; SPARSE_HEADER_LEN] {
        let mut out = [0u8; SPARSE_HEADER_LEN];
        put_u32(&mut out, 0, SPARSE_MAGIC);
        // Version 1.0
        put_u16(&mut out, 4, 1);
        put_u16(&mut out, 6, 0);
        put_u16(&mut out, 8, SPARSE_HEADER_LEN as u16);
        put_u16(&mut out, 10, CHUNK_HEADER_LEN as u16);
        put_u32(&mut out, 12, self.block_size);
        put_u32(&mut out, 16, self.blocks);
        put_u32(&mut out, 20, self.chunks);
        put_u32(&mut out, 24, self.checksum);
        out
    }

    /// Size of the image after expansion
    pub fn total_out_bytes(&self) -> u64 {
        u64::from(self.blocks) * u64::from(self.block_size)
    }
}

/// Chunk type discriminants as they appear on the wire
#[derive(Copy, Clone, Debug, FromRepr, Eq, PartialEq)]
pub enum ChunkKind {
    /// `data_len` bytes follow, copied to the output verbatim
    Raw = 0xcac1,
    /// A 4 byte pattern follows, repeated over the output blocks
    Fill = 0xcac2,
    /// Nothing follows; the output blocks hold arbitrary content
    DontCare = 0xcac3,
    /// A 4 byte crc32 over the expanded image so far follows
    Crc32 = 0xcac4,
}

/// The 12 byte header in front of every chunk
///
/// Wire layout: chunk type, 2 reserved bytes, output size in blocks, and
/// the chunk's size in the file with the header included. In memory only
/// the trailing data length is kept; the file size is put back when
/// encoding.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ChunkHeader {
    pub kind: ChunkKind,
    /// Blocks this chunk covers in the expanded image
    pub out_blocks: u32,
    /// Bytes of chunk data following the header in the file
    pub data_len: u32,
}

impl ChunkHeader {
    /// Header for a chunk covering `out_blocks` blocks of `block_size`
    ///
    /// The data length follows from the kind: the full block range for
    /// raw, the 4 byte pattern or checksum for fill and crc32, nothing
    /// for don't-care.
    pub fn new(kind: ChunkKind, out_blocks: u32, block_size: u32) -> ChunkHeader {
        let data_len = match kind {
            ChunkKind::Raw => out_blocks.saturating_mul(block_size),
            ChunkKind::Fill | ChunkKind::Crc32 => 4,
            ChunkKind::DontCare => 0,
        };
        ChunkHeader {
            kind,
            out_blocks,
            data_len,
        }
    }

    /// Parse the chunk header at the start of `bytes`
    pub fn parse(bytes: &[u8]) -> Result<ChunkHeader, ParseError> {
        if bytes.len() < CHUNK_HEADER_LEN {
            return Err(ParseError::Truncated);
        }
        let raw_kind = u16_at(bytes, 0);
        let Some(kind) = ChunkKind::from_repr(raw_kind.into()) else {
            return Err(ParseError::UnknownChunkType(raw_kind));
        };
        let out_blocks = u32_at(bytes, 4);
        let file_len = u32_at(bytes, 8);

        Ok(ChunkHeader {
            kind,
            out_blocks,
            data_len: file_len.saturating_sub(CHUNK_HEADER_LEN as u32),
        })
    }

    /// Encode the chunk header into its wire form
    pub fn encode(&self) -> [u8; CHUNK_HEADER_LEN] {
        let mut out = [0u8; CHUNK_HEADER_LEN];
        put_u16(&mut out, 0, self.kind as u16);
        put_u32(&mut out, 4, self.out_blocks);
        put_u32(&mut out, 8, CHUNK_HEADER_LEN as u32 + self.data_len);
        out
    }

    /// Bytes this chunk produces in the expanded image
    pub fn out_bytes(&self, block_size: u32) -> u64 {
        u64::from(self.out_blocks) * u64::from(block_size)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn magic_detection() {
        assert!(is_sparse(&[0x3a, 0xff, 0x26, 0xed]));
        assert!(is_sparse(
            &SparseHeader {
                block_size: 4096,
                blocks: 1,
                chunks: 1,
                checksum: 0,
            }
            .encode()
        ));
        assert!(!is_sparse(&[0x3a, 0xff, 0x26]));
        assert!(!is_sparse(b"ANDROID!"));
    }

    #[test]
    fn header_parse() {
        let mut bytes = [0u8; SPARSE_HEADER_LEN];
        put_u32(&mut bytes, 0, SPARSE_MAGIC);
        put_u16(&mut bytes, 4, 1);
        put_u16(&mut bytes, 8, 28);
        put_u16(&mut bytes, 10, 12);
        put_u32(&mut bytes, 12, 4096);
        put_u32(&mut bytes, 16, 512);
        put_u32(&mut bytes, 20, 3);
        put_u32(&mut bytes, 24, 0x78563412);

        let header = SparseHeader::parse(&bytes).unwrap();
        assert_eq!(
            header,
            SparseHeader {
                block_size: 4096,
                blocks: 512,
                chunks: 3,
                checksum: 0x78563412,
            }
        );
        assert_eq!(header.total_out_bytes(), 512 * 4096);
    }

    #[test]
    fn header_rejects() {
        let good = SparseHeader {
            block_size: 4096,
            blocks: 16,
            chunks: 1,
            checksum: 0,
        }
        .encode();

        assert_eq!(
            SparseHeader::parse(&good[..20]),
            Err(ParseError::Truncated)
        );

        let mut bad_magic = good;
        bad_magic[0] = 0x3b;
        assert_eq!(
            SparseHeader::parse(&bad_magic),
            Err(ParseError::UnknownMagic)
        );

        let mut bad_version = good;
        put_u16(&mut bad_version, 4, 2);
        assert_eq!(
            SparseHeader::parse(&bad_version),
            Err(ParseError::UnsupportedVersion { major: 2, minor: 0 })
        );

        let mut bad_layout = good;
        put_u16(&mut bad_layout, 8, 32);
        assert_eq!(
            SparseHeader::parse(&bad_layout),
            Err(ParseError::BadHeaderLayout)
        );
    }

    #[test]
    fn header_roundtrip() {
        let orig = SparseHeader {
            block_size: 4096,
            blocks: 8192,
            chunks: 17,
            checksum: 0xdeadbeef,
        };
        assert_eq!(SparseHeader::parse(&orig.encode()), Ok(orig));
    }

    #[test]
    fn chunk_data_lengths() {
        assert_eq!(ChunkHeader::new(ChunkKind::Raw, 12, 4096).data_len, 12 * 4096);
        assert_eq!(ChunkHeader::new(ChunkKind::Fill, 64, 4096).data_len, 4);
        assert_eq!(ChunkHeader::new(ChunkKind::Crc32, 0, 4096).data_len, 4);
        assert_eq!(ChunkHeader::new(ChunkKind::DontCare, 1000, 4096).data_len, 0);
    }

    #[test]
    fn chunk_parse() {
        let mut bytes = [0u8; CHUNK_HEADER_LEN];
        put_u16(&mut bytes, 0, 0xcac2);
        put_u32(&mut bytes, 4, 64);
        put_u32(&mut bytes, 8, CHUNK_HEADER_LEN as u32 + 4);

        let chunk = ChunkHeader::parse(&bytes).unwrap();
        assert_eq!(chunk, ChunkHeader::new(ChunkKind::Fill, 64, 4096));
        assert_eq!(chunk.out_bytes(4096), 64 * 4096);
    }

    #[test]
    fn chunk_rejects() {
        let good = ChunkHeader::new(ChunkKind::Raw, 2, 4096).encode();
        assert_eq!(ChunkHeader::parse(&good[..8]), Err(ParseError::Truncated));

        let mut bad_kind = good;
        put_u16(&mut bad_kind, 0, 0xcac5);
        assert_eq!(
            ChunkHeader::parse(&bad_kind),
            Err(ParseError::UnknownChunkType(0xcac5))
        );
    }

    #[test]
    fn chunk_roundtrip() {
        for kind in [
            ChunkKind::Raw,
            ChunkKind::Fill,
            ChunkKind::DontCare,
            ChunkKind::Crc32,
        ] {
            let orig = ChunkHeader::new(kind, 8, 4096);
            assert_eq!(ChunkHeader::parse(&orig.encode()), Ok(orig));
        }
    }
}
