use std::{
    io::Write,
    path::{Path, PathBuf},
};

use clap::Parser;
use sparse_image::{
    stream::{ImageStream, SparseStream},
    ChunkKind, SPARSE_HEADER_LEN,
};

#[derive(clap::Parser)]
enum Opts {
    /// Inspect the contents of a sparse image
    Inspect { img: PathBuf },
    /// Split <img> into sub-images each expanding to at most <max-bytes>
    Split {
        img: PathBuf,
        #[clap(long, default_value_t = 256 * 1024 * 1024)]
        max_bytes: u64,
        out_prefix: PathBuf,
    },
}

fn inspect(img: &Path) -> anyhow::Result<()> {
    let stream = SparseStream::open(img)?;
    let header = stream.header();
    println!(
        "Chunks {}, expanded size: {} ({} blocks, {} blocksize), checksum: {}",
        header.chunks,
        header.total_out_bytes(),
        header.blocks,
        header.block_size,
        header.checksum
    );
    Ok(())
}

fn split(img: &Path, max_bytes: u64, out_prefix: &Path) -> anyhow::Result<()> {
    let mut stream = ImageStream::open(img)?;
    let mut index = 0;
    while let Some(sub) = stream.next_sub_image(max_bytes)? {
        let path = out_prefix.with_extension(format!("{index}.simg"));
        let mut out = std::fs::File::create(&path)?;
        out.write_all(&sub)?;
        if stream.is_sparse() {
            let header = sparse_image::SparseHeader::parse(&sub)?;
            let mut pos = SPARSE_HEADER_LEN;
            for i in 0..header.chunks {
                let chunk = sparse_image::ChunkHeader::parse(&sub[pos..])?;
                let kind = match chunk.kind {
                    ChunkKind::Raw => "raw",
                    ChunkKind::Fill => "fill",
                    ChunkKind::DontCare => "dontcare",
                    ChunkKind::Crc32 => "crc32",
                };
                println!(
                    "{}: chunk {i}: {kind} {} blocks",
                    path.display(),
                    chunk.out_blocks
                );
                pos += sparse_image::CHUNK_HEADER_LEN + chunk.data_len as usize;
            }
        } else {
            println!("{}: raw buffer of {} bytes", path.display(), sub.len());
        }
        index += 1;
    }
    println!("Wrote {index} parts");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    match opts {
        Opts::Inspect { img } => inspect(&img)?,
        Opts::Split {
            img,
            max_bytes,
            out_prefix,
        } => split(&img, max_bytes, &out_prefix)?,
    }

    Ok(())
}
