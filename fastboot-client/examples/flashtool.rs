use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use fastboot_client::client::FastbootClient;
use fastboot_client::nusb::NusbTransport;
use fastboot_client::progress::{Progress, Stage};

#[derive(Parser)]
struct Opts {
    /// Use the device with this serial number
    #[clap(long)]
    serial: Option<String>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// List fastboot devices
    Devices,
    GetVar {
        var: String,
    },
    GetAllVars,
    /// Show a typed device summary
    Info,
    /// Flash an image file, splitting sparse images as needed
    Flash {
        target: String,
        file: PathBuf,
    },
    /// Flash a resource straight out of a SPAK archive
    FlashPak {
        pak: PathBuf,
        name: String,
        target: String,
    },
    Erase {
        target: String,
    },
    SetActive {
        slot: String,
    },
    Oem {
        cmd: Vec<String>,
    },
    Reboot,
    RebootBootloader,
}

fn print_progress(p: &Progress) {
    match p.stage {
        Stage::Sending => eprint!(
            "\r{}: part {}/{}, {:.1}% ({} KiB/s)   ",
            p.partition,
            p.current_chunk,
            p.total_chunks,
            p.percent,
            p.speed_bps / 1024
        ),
        Stage::Writing => eprint!("\r{}: writing part {}          ", p.partition, p.current_chunk),
        Stage::Done => eprintln!("\r{}: done                        ", p.partition),
        Stage::Failed => eprintln!("\r{}: failed                      ", p.partition),
        Stage::Preparing => (),
    }
}

async fn open(serial: Option<&str>) -> anyhow::Result<FastbootClient> {
    let info = match serial {
        Some(serial) => fastboot_client::nusb::find_by_serial(serial)?
            .context("No fastboot device with that serial")?,
        None => fastboot_client::nusb::devices()?
            .next()
            .context("No fastboot device found")?,
    };
    println!(
        "Using fastboot device {:04x}:{:04x} serial {}",
        info.vendor_id(),
        info.product_id(),
        info.serial_number().unwrap_or("<none>")
    );
    let transport = NusbTransport::from_info(&info)?;
    Ok(FastbootClient::connect(Box::new(transport)).await?)
}

async fn flash(client: &mut FastbootClient, target: &str, file: &Path) -> anyhow::Result<()> {
    let token = client.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupted, stopping after the current transfer");
            token.cancel();
        }
    });
    client
        .flash_partition(target, file, |p| print_progress(&p))
        .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let opts = Opts::parse();

    if let Command::Devices = opts.command {
        for info in fastboot_client::nusb::devices()? {
            println!(
                "{:04x}:{:04x} {} {}",
                info.vendor_id(),
                info.product_id(),
                info.product_string().unwrap_or_default(),
                info.serial_number().unwrap_or("<no serial>")
            );
        }
        return Ok(());
    }

    let mut client = open(opts.serial.as_deref()).await?;
    match opts.command {
        Command::Devices => unreachable!(),
        Command::GetVar { var } => {
            println!("{var}: {}", client.get_var(&var).await?);
        }
        Command::GetAllVars => {
            for (k, v) in client.get_var_all().await? {
                println!("{k}: {v}");
            }
        }
        Command::Info => {
            let info = client.device_info().await?;
            println!("Product: {}", info.product.as_deref().unwrap_or("?"));
            println!("Serial: {}", info.serialno.as_deref().unwrap_or("?"));
            println!(
                "Slot: {} of {}",
                info.current_slot.as_deref().unwrap_or("-"),
                info.slot_count
            );
            println!("Unlocked: {}", info.unlocked);
            println!("Userspace fastboot: {}", info.is_userspace);
            println!("Max download: {} bytes", info.max_download_size);
            let mut partitions: Vec<_> = info.partition_sizes.iter().collect();
            partitions.sort();
            for (name, size) in partitions {
                let logical = if info.is_logical(name) { " (logical)" } else { "" };
                println!("  {name}: {size} bytes{logical}");
            }
        }
        Command::Flash { target, file } => flash(&mut client, &target, &file).await?,
        Command::FlashPak { pak, name, target } => {
            let pak = spak::archive::Pak::open(&pak)?;
            let data = pak.get(&name)?;
            println!("Flashing {name} ({} bytes) to {target}", data.len());
            client.download(&data).await?;
            client.flash(&target).await?;
        }
        Command::Erase { target } => client.erase(&target).await?,
        Command::SetActive { slot } => client.set_active(&slot).await?,
        Command::Oem { cmd } => {
            let output = client.oem(&cmd.join(" ")).await?;
            println!("{output}");
        }
        Command::Reboot => client.reboot().await?,
        Command::RebootBootloader => client.reboot_bootloader().await?,
    }

    Ok(())
}
