use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use bytes::Bytes;
use log::{debug, trace};
use thiserror::Error;

use crate::{
    is_sparse, ChunkHeader, ChunkKind, ParseError, SparseHeader, CHUNK_HEADER_LEN,
    SPARSE_HEADER_LEN,
};

/// Errors when streaming an image
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse sparse image: {0}")]
    Parse(#[from] ParseError),
    #[error("Chunk table covers {actual} blocks while the header claims {expected}")]
    BlockCountMismatch { expected: u32, actual: u32 },
    #[error("Chunk expands to {blocks} blocks, above the limit of {max_blocks} blocks")]
    ChunkTooLarge { blocks: u32, max_blocks: u32 },
    #[error("Limit of {max_bytes} bytes is below the minimum of {min_bytes} bytes")]
    LimitTooSmall { max_bytes: u64, min_bytes: u64 },
    #[error("Failed to allocate a {bytes} byte sub-image buffer")]
    OutOfMemory { bytes: usize },
}

#[derive(Debug, Clone)]
struct ChunkEntry {
    header: ChunkHeader,
    /// Pattern for fill chunks
    fill: [u8; 4],
    /// Offset of the chunk data in the image
    data_offset: u64,
}

/// Streaming reader over a sparse image yielding bounded sub-images
///
/// Each call to [SparseStream::next_sub_image] materializes the next
/// contiguous part of the logical image as a standalone sparse image.
/// Sub-images after the first lead with a don't-care chunk seeking to their
/// block offset, so downloading and flashing them in order writes the same
/// bytes as flashing the original image at once.
pub struct SparseStream<R> {
    reader: R,
    header: SparseHeader,
    entries: Vec<ChunkEntry>,
    /// Next chunk to emit
    index: usize,
    /// Blocks of the current raw chunk already emitted by earlier sub-images
    consumed_blocks: u32,
    /// Blocks of the expanded image covered by earlier sub-images
    out_blocks_done: u32,
}

impl SparseStream<BufReader<File>> {
    /// Open a sparse image file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StreamError> {
        Self::from_reader(BufReader::new(File::open(path)?))
    }
}

impl<R: Read + Seek> SparseStream<R> {
    /// Create a stream from a reader positioned at the file header
    ///
    /// The whole chunk table is walked up-front; chunk data is only read
    /// when a sub-image containing it is materialized.
    pub fn from_reader(mut reader: R) -> Result<Self, StreamError> {
        let mut header_bytes = [0u8; SPARSE_HEADER_LEN];
        reader.read_exact(&mut header_bytes)?;
        let header = SparseHeader::parse(&header_bytes)?;

        let mut entries = Vec::with_capacity(header.chunks as usize);
        let mut blocks = 0u32;
        for _ in 0..header.chunks {
            let mut chunk_bytes = [0u8; CHUNK_HEADER_LEN];
            reader.read_exact(&mut chunk_bytes)?;
            let chunk = ChunkHeader::parse(&chunk_bytes)?;

            let data_offset = reader.stream_position()?;
            let mut fill = [0u8; 4];
            match chunk.kind {
                ChunkKind::Fill | ChunkKind::Crc32 => reader.read_exact(&mut fill)?,
                ChunkKind::Raw => {
                    reader.seek(SeekFrom::Current(i64::from(chunk.data_len)))?;
                }
                ChunkKind::DontCare => (),
            }
            blocks = blocks.saturating_add(chunk.out_blocks);
            entries.push(ChunkEntry {
                header: chunk,
                fill,
                data_offset,
            });
        }
        if blocks != header.blocks {
            return Err(StreamError::BlockCountMismatch {
                expected: header.blocks,
                actual: blocks,
            });
        }
        debug!(
            "Sparse image: {} chunks, {} blocks of {} bytes",
            header.chunks, header.blocks, header.block_size
        );

        Ok(Self {
            reader,
            header,
            entries,
            index: 0,
            consumed_blocks: 0,
            out_blocks_done: 0,
        })
    }

    /// The file header of the full image
    pub fn header(&self) -> &SparseHeader {
        &self.header
    }

    /// Size of the image after expansion
    pub fn total_out_bytes(&self) -> u64 {
        self.header.total_out_bytes()
    }

    /// Materialize the next sub-image expanding to at most `max_bytes`
    ///
    /// Raw chunks are split at block boundaries as needed. Fill and
    /// don't-care chunks are taken whole; one expanding beyond `max_bytes`
    /// on its own fails with [StreamError::ChunkTooLarge]. Crc32 chunks are
    /// dropped as their checksum no longer matches a partial image.
    ///
    /// Returns None once the image is exhausted.
    pub fn next_sub_image(&mut self, max_bytes: u64) -> Result<Option<Bytes>, StreamError> {
        if self.index >= self.entries.len() {
            return Ok(None);
        }
        let block_size = self.header.block_size;
        if max_bytes < u64::from(block_size) {
            return Err(StreamError::LimitTooSmall {
                max_bytes,
                min_bytes: u64::from(block_size),
            });
        }
        let max_blocks = u64::min(max_bytes / u64::from(block_size), u64::from(u32::MAX)) as u32;

        let mut plan: Vec<ChunkEntry> = Vec::new();
        if self.out_blocks_done > 0 {
            // Seek to the sub-image's offset first
            plan.push(ChunkEntry {
                header: ChunkHeader::new(ChunkKind::DontCare, self.out_blocks_done, block_size),
                fill: [0; 4],
                data_offset: 0,
            });
        }

        let mut used = 0u32;
        while self.index < self.entries.len() {
            let entry = &self.entries[self.index];
            match entry.header.kind {
                ChunkKind::Crc32 => {
                    trace!("Dropping crc32 chunk");
                    self.index += 1;
                }
                ChunkKind::Raw => {
                    let left = entry.header.out_blocks - self.consumed_blocks;
                    let take = left.min(max_blocks - used);
                    if take == 0 {
                        break;
                    }
                    let offset = entry.data_offset
                        + u64::from(self.consumed_blocks) * u64::from(block_size);
                    plan.push(ChunkEntry {
                        header: ChunkHeader::new(ChunkKind::Raw, take, block_size),
                        fill: [0; 4],
                        data_offset: offset,
                    });
                    used += take;
                    self.consumed_blocks += take;
                    if self.consumed_blocks == entry.header.out_blocks {
                        self.index += 1;
                        self.consumed_blocks = 0;
                    }
                }
                ChunkKind::Fill | ChunkKind::DontCare => {
                    let blocks = entry.header.out_blocks;
                    if blocks > max_blocks {
                        return Err(StreamError::ChunkTooLarge { blocks, max_blocks });
                    }
                    if used + blocks > max_blocks {
                        break;
                    }
                    plan.push(entry.clone());
                    used += blocks;
                    self.index += 1;
                }
            }
        }
        if used == 0 {
            // Only crc chunks were left
            return Ok(None);
        }

        let header = SparseHeader {
            block_size,
            blocks: self.out_blocks_done + used,
            chunks: plan.len() as u32,
            checksum: 0,
        };
        let sparse_len = SPARSE_HEADER_LEN
            + plan
                .iter()
                .map(|e| CHUNK_HEADER_LEN + e.header.data_len as usize)
                .sum::<usize>();
        let mut out = Vec::new();
        out.try_reserve_exact(sparse_len)
            .map_err(|_| StreamError::OutOfMemory { bytes: sparse_len })?;
        out.extend_from_slice(&header.encode());
        for entry in &plan {
            out.extend_from_slice(&entry.header.encode());
            match entry.header.kind {
                ChunkKind::Raw => {
                    let len = entry.header.data_len as usize;
                    self.reader.seek(SeekFrom::Start(entry.data_offset))?;
                    let start = out.len();
                    out.resize(start + len, 0);
                    self.reader.read_exact(&mut out[start..])?;
                }
                ChunkKind::Fill => out.extend_from_slice(&entry.fill),
                ChunkKind::DontCare => (),
                ChunkKind::Crc32 => unreachable!(),
            }
        }
        self.out_blocks_done += used;
        trace!(
            "Sub-image: {} chunks, {} blocks, {}/{} blocks done",
            header.chunks,
            used,
            self.out_blocks_done,
            self.header.blocks
        );

        Ok(Some(Bytes::from(out)))
    }
}

/// Passthrough reader for non-sparse images
///
/// Yields plain sub-buffers of at most `max_bytes` in file order.
pub struct RawStream<R> {
    reader: R,
    total: u64,
    pos: u64,
}

impl RawStream<BufReader<File>> {
    /// Open a raw image file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StreamError> {
        Self::from_reader(BufReader::new(File::open(path)?))
    }
}

impl<R: Read + Seek> RawStream<R> {
    /// Create a stream from a reader; the file size is taken by seeking
    pub fn from_reader(mut reader: R) -> Result<Self, StreamError> {
        let total = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;
        Ok(Self {
            reader,
            total,
            pos: 0,
        })
    }

    /// Size of the image
    pub fn total_out_bytes(&self) -> u64 {
        self.total
    }

    /// Read the next sub-buffer of at most `max_bytes`
    pub fn next_sub_buffer(&mut self, max_bytes: u64) -> Result<Option<Bytes>, StreamError> {
        if max_bytes == 0 {
            return Err(StreamError::LimitTooSmall {
                max_bytes,
                min_bytes: 1,
            });
        }
        if self.pos >= self.total {
            return Ok(None);
        }
        let len = (self.total - self.pos).min(max_bytes) as usize;
        let mut out = Vec::new();
        out.try_reserve_exact(len)
            .map_err(|_| StreamError::OutOfMemory { bytes: len })?;
        out.resize(len, 0);
        self.reader.read_exact(&mut out)?;
        self.pos += len as u64;
        Ok(Some(Bytes::from(out)))
    }
}

/// Image reader dispatching on the sparse magic
pub enum ImageStream<R> {
    Sparse(SparseStream<R>),
    Raw(RawStream<R>),
}

impl ImageStream<BufReader<File>> {
    /// Open an image file, detecting whether it is sparse
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StreamError> {
        Self::from_reader(BufReader::new(File::open(path)?))
    }
}

impl<R: Read + Seek> ImageStream<R> {
    /// Create a stream from a reader, detecting whether it is sparse
    pub fn from_reader(mut reader: R) -> Result<Self, StreamError> {
        let mut prefix = [0u8; 4];
        let mut filled = 0;
        while filled < prefix.len() {
            let n = reader.read(&mut prefix[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        reader.seek(SeekFrom::Start(0))?;
        if is_sparse(&prefix[..filled]) {
            Ok(Self::Sparse(SparseStream::from_reader(reader)?))
        } else {
            Ok(Self::Raw(RawStream::from_reader(reader)?))
        }
    }

    /// Whether the underlying image is sparse
    pub fn is_sparse(&self) -> bool {
        matches!(self, Self::Sparse(_))
    }

    /// Size of the image after expansion
    pub fn total_out_bytes(&self) -> u64 {
        match self {
            Self::Sparse(s) => s.total_out_bytes(),
            Self::Raw(r) => r.total_out_bytes(),
        }
    }

    /// Next sub-image (sparse) or sub-buffer (raw) of at most `max_bytes`
    /// expanded bytes
    pub fn next_sub_image(&mut self, max_bytes: u64) -> Result<Option<Bytes>, StreamError> {
        match self {
            Self::Sparse(s) => s.next_sub_image(max_bytes),
            Self::Raw(r) => r.next_sub_buffer(max_bytes),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    enum TestChunk {
        Raw(Vec<u8>),
        Fill([u8; 4], u32),
        DontCare(u32),
        Crc32(u32),
    }

    const BLOCK: u32 = 16;

    fn build_image(chunks: &[TestChunk]) -> Vec<u8> {
        let mut blocks = 0;
        let mut body = vec![];
        for chunk in chunks {
            match chunk {
                TestChunk::Raw(data) => {
                    assert_eq!(data.len() % BLOCK as usize, 0);
                    let n = (data.len() / BLOCK as usize) as u32;
                    body.extend_from_slice(&ChunkHeader::new(ChunkKind::Raw, n, BLOCK).encode());
                    body.extend_from_slice(data);
                    blocks += n;
                }
                TestChunk::Fill(pattern, n) => {
                    body.extend_from_slice(&ChunkHeader::new(ChunkKind::Fill, *n, BLOCK).encode());
                    body.extend_from_slice(pattern);
                    blocks += n;
                }
                TestChunk::DontCare(n) => {
                    body.extend_from_slice(
                        &ChunkHeader::new(ChunkKind::DontCare, *n, BLOCK).encode(),
                    );
                    blocks += n;
                }
                TestChunk::Crc32(crc) => {
                    body.extend_from_slice(&ChunkHeader::new(ChunkKind::Crc32, 0, BLOCK).encode());
                    body.extend_from_slice(&crc.to_le_bytes());
                }
            }
        }
        let header = SparseHeader {
            block_size: BLOCK,
            blocks,
            chunks: chunks.len() as u32,
            checksum: 0,
        };
        let mut image = header.encode().to_vec();
        image.append(&mut body);
        image
    }

    /// Expand a sparse image into `out`, seeking over don't-care chunks
    fn expand_into(image: &[u8], out: &mut [u8]) {
        let header = SparseHeader::parse(image).unwrap();
        let mut pos = SPARSE_HEADER_LEN;
        let mut cursor = 0usize;
        for _ in 0..header.chunks {
            let chunk = ChunkHeader::parse(&image[pos..]).unwrap();
            pos += CHUNK_HEADER_LEN;
            let out_size = chunk.out_bytes(header.block_size) as usize;
            match chunk.kind {
                ChunkKind::Raw => {
                    out[cursor..cursor + out_size].copy_from_slice(&image[pos..pos + out_size]);
                    pos += out_size;
                }
                ChunkKind::Fill => {
                    let pattern = &image[pos..pos + 4];
                    pos += 4;
                    for b in 0..out_size {
                        out[cursor + b] = pattern[b % 4];
                    }
                }
                ChunkKind::DontCare => (),
                ChunkKind::Crc32 => pos += 4,
            }
            cursor += out_size;
        }
        assert_eq!(cursor, out.len());
    }

    fn expand(image: &[u8]) -> Vec<u8> {
        let header = SparseHeader::parse(image).unwrap();
        let mut out = vec![0; header.total_out_bytes() as usize];
        expand_into(image, &mut out);
        out
    }

    /// Stream the image in sub-images of `max_bytes` and rebuild the output
    fn reconstruct(image: &[u8], max_bytes: u64) -> Vec<u8> {
        let mut stream = SparseStream::from_reader(Cursor::new(image)).unwrap();
        let total = stream.total_out_bytes() as usize;
        let mut out = vec![0; total];
        let mut subs = 0;
        while let Some(sub) = stream.next_sub_image(max_bytes).unwrap() {
            let header = SparseHeader::parse(&sub).unwrap();
            assert!(
                header.total_out_bytes() as usize <= total,
                "sub-image covers more than the image"
            );
            expand_into(&sub, &mut out[..header.total_out_bytes() as usize]);
            subs += 1;
        }
        assert!(subs > 0);
        out
    }

    fn pattern_data(blocks: u32, seed: u8) -> Vec<u8> {
        (0..blocks * BLOCK)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect()
    }

    #[test]
    fn single_sub_image() {
        let image = build_image(&[
            TestChunk::Fill([0xa5; 4], 4),
            TestChunk::Raw(pattern_data(4, 7)),
        ]);
        let mut stream = SparseStream::from_reader(Cursor::new(&image)).unwrap();
        assert_eq!(stream.total_out_bytes(), 8 * BLOCK as u64);

        let sub = stream
            .next_sub_image(8 * BLOCK as u64)
            .unwrap()
            .expect("One sub-image");
        assert_eq!(expand(&sub), expand(&image));
        assert!(stream.next_sub_image(8 * BLOCK as u64).unwrap().is_none());
    }

    #[test]
    fn split_raw_chunk() {
        let image = build_image(&[TestChunk::Raw(pattern_data(8, 3))]);
        let mut stream = SparseStream::from_reader(Cursor::new(&image)).unwrap();

        let limit = 3 * BLOCK as u64;
        let first = stream.next_sub_image(limit).unwrap().unwrap();
        let first_header = SparseHeader::parse(&first).unwrap();
        assert_eq!(first_header.blocks, 3);
        assert_eq!(first_header.chunks, 1);

        let second = stream.next_sub_image(limit).unwrap().unwrap();
        let lead = ChunkHeader::parse(&second[SPARSE_HEADER_LEN..]).unwrap();
        assert_eq!(lead, ChunkHeader::new(ChunkKind::DontCare, 3, BLOCK));

        assert_eq!(reconstruct(&image, limit), expand(&image));

        let mut stream = SparseStream::from_reader(Cursor::new(&image)).unwrap();
        let mut subs = 0;
        while stream.next_sub_image(limit).unwrap().is_some() {
            subs += 1;
        }
        assert_eq!(subs, 3);
    }

    #[test]
    fn fill_chunks_not_split() {
        let image = build_image(&[
            TestChunk::Raw(pattern_data(2, 11)),
            TestChunk::Fill([0x11, 0x22, 0x33, 0x44], 4),
            TestChunk::DontCare(2),
            TestChunk::Raw(pattern_data(1, 13)),
        ]);
        let limit = 4 * BLOCK as u64;
        assert_eq!(reconstruct(&image, limit), expand(&image));

        // The fill chunk does not fit after the first raw chunk, so it
        // starts the second sub-image
        let mut stream = SparseStream::from_reader(Cursor::new(&image)).unwrap();
        let first = stream.next_sub_image(limit).unwrap().unwrap();
        let header = SparseHeader::parse(&first).unwrap();
        assert_eq!(header.blocks, 2);
    }

    #[test]
    fn oversized_fill_rejected() {
        let image = build_image(&[TestChunk::Fill([0; 4], 8)]);
        let mut stream = SparseStream::from_reader(Cursor::new(&image)).unwrap();
        assert!(matches!(
            stream.next_sub_image(4 * BLOCK as u64),
            Err(StreamError::ChunkTooLarge {
                blocks: 8,
                max_blocks: 4
            })
        ));
    }

    #[test]
    fn crc_chunks_dropped() {
        let image = build_image(&[TestChunk::Raw(pattern_data(2, 5)), TestChunk::Crc32(0xabcd)]);
        let mut stream = SparseStream::from_reader(Cursor::new(&image)).unwrap();
        let sub = stream.next_sub_image(8 * BLOCK as u64).unwrap().unwrap();
        let header = SparseHeader::parse(&sub).unwrap();
        assert_eq!(header.chunks, 1);
        assert_eq!(expand(&sub), expand(&image));
        assert!(stream.next_sub_image(8 * BLOCK as u64).unwrap().is_none());
    }

    #[test]
    fn block_count_mismatch() {
        let mut image = build_image(&[TestChunk::Raw(pattern_data(4, 1))]);
        // Claim one block more than the chunk table covers
        let header = SparseHeader {
            block_size: BLOCK,
            blocks: 5,
            chunks: 1,
            checksum: 0,
        };
        image[..SPARSE_HEADER_LEN].copy_from_slice(&header.encode());
        assert!(matches!(
            SparseStream::from_reader(Cursor::new(&image)),
            Err(StreamError::BlockCountMismatch {
                expected: 5,
                actual: 4
            })
        ));
    }

    #[test]
    fn limit_below_block_size() {
        let image = build_image(&[TestChunk::Raw(pattern_data(1, 9))]);
        let mut stream = SparseStream::from_reader(Cursor::new(&image)).unwrap();
        assert!(matches!(
            stream.next_sub_image(BLOCK as u64 - 1),
            Err(StreamError::LimitTooSmall { .. })
        ));
    }

    #[test]
    fn raw_passthrough() {
        let data: Vec<u8> = (0..10000u32).map(|i| i as u8).collect();
        let mut stream = RawStream::from_reader(Cursor::new(&data)).unwrap();
        assert_eq!(stream.total_out_bytes(), 10000);

        let mut collected = vec![];
        let mut lens = vec![];
        while let Some(sub) = stream.next_sub_buffer(4096).unwrap() {
            lens.push(sub.len());
            collected.extend_from_slice(&sub);
        }
        assert_eq!(lens, [4096, 4096, 1808]);
        assert_eq!(collected, data);
    }

    #[test]
    fn image_stream_dispatch() {
        let sparse = build_image(&[TestChunk::Fill([1; 4], 2)]);
        let stream = ImageStream::from_reader(Cursor::new(&sparse)).unwrap();
        assert!(stream.is_sparse());
        assert_eq!(stream.total_out_bytes(), 2 * BLOCK as u64);

        let raw = vec![0x42u8; 100];
        let stream = ImageStream::from_reader(Cursor::new(&raw)).unwrap();
        assert!(!stream.is_sparse());
        assert_eq!(stream.total_out_bytes(), 100);
    }
}
