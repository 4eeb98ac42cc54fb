use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use spak::archive::{create, Pak, PakSource};

#[derive(clap::Parser)]
enum Opts {
    /// List the entries of an archive
    List { pak: PathBuf },
    /// Extract one entry to a file
    Extract {
        pak: PathBuf,
        name: String,
        out: PathBuf,
    },
    /// Pack files into a new archive, inferring resource types from names
    Pack { out: PathBuf, files: Vec<PathBuf> },
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    match opts {
        Opts::List { pak } => {
            let pak = Pak::open(&pak)?;
            for name in pak.names() {
                let entry = pak.entry(name).context("entry vanished")?;
                println!(
                    "{name}: {:?}, {} bytes ({} on disk)",
                    entry.resource_type, entry.orig_size, entry.comp_size
                );
            }
        }
        Opts::Extract { pak, name, out } => {
            let pak = Pak::open(&pak)?;
            let data = pak.get(&name)?;
            std::fs::write(&out, &data)?;
            println!("Extracted {name} ({} bytes)", data.len());
        }
        Opts::Pack { out, files } => {
            let contents = files
                .iter()
                .map(|f| std::fs::read(f).with_context(|| format!("Reading {}", f.display())))
                .collect::<Result<Vec<_>, _>>()?;
            let sources = files
                .iter()
                .zip(&contents)
                .map(|(f, data)| {
                    let name = f
                        .file_name()
                        .and_then(|n| n.to_str())
                        .context("File name is not valid UTF-8")?;
                    Ok(PakSource::new(name, data))
                })
                .collect::<anyhow::Result<Vec<_>>>()?;
            create(&out, &sources)?;
            println!("Packed {} entries into {}", sources.len(), out.display());
        }
    }
    Ok(())
}
