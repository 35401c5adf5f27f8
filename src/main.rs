// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{fs::File, path::Path, path::PathBuf, process::exit, thread, time::Duration};

use clap::{Parser, Subcommand};
use log::{error, info, warn};

use tcmu_device::tcmu::{hba::Hba, Result};

#[derive(Parser)]
#[command(about = "Expose file-backed storage as local SCSI block devices via TCMU")]
struct TcmuArgs {
    /// Module name; device nodes are created under /dev/<module>.
    #[arg(long, default_value = "tcmu")]
    module: String,
    /// Logical sector size presented to the initiator.
    #[arg(long, default_value_t = 512)]
    sector_size: u32,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create one LUN bound to a backing file and keep serving it.
    Once {
        /// Backing image, e.g. vol1 or vol2.
        #[arg(default_value = "vol1")]
        image: PathBuf,
    },
    /// Create and tear down a LUN repeatedly to exercise the lifecycle.
    Many {
        #[arg(default_value = "vol1")]
        image: PathBuf,
        #[arg(long, default_value_t = 8)]
        iterations: u32,
    },
}

fn open_image(path: &Path) -> Result<(File, u64, String)> {
    let file = File::options().read(true).write(true).open(path)?;
    let size = file.metadata()?.len();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "vol".to_string());
    Ok((file, size, name))
}

fn run() -> Result<()> {
    let args = TcmuArgs::parse();
    let hba = Hba::new(&args.module)?;
    hba.start()?;

    match args.command {
        Command::Once { image } => {
            let (file, size, name) = open_image(&image)?;
            let device = hba.create_device(&name, size, args.sector_size, Box::new(file))?;
            info!("attached to {}", device.node_path().display());
            match device.block_device_path() {
                Ok(path) => info!("kernel block device at {}", path.display()),
                Err(e) => warn!("kernel block device not resolved: {e}"),
            }
            loop {
                thread::sleep(Duration::from_secs(30));
            }
        }
        Command::Many { image, iterations } => {
            for iteration in 0..iterations {
                let (file, size, name) = open_image(&image)?;
                let device = hba.create_device(&name, size, args.sector_size, Box::new(file))?;
                info!(
                    "iteration {iteration}: attached to {}",
                    device.node_path().display()
                );
                hba.remove_device(&name)?;
            }
            hba.stop()
        }
    }
}

fn main() {
    env_logger::init();
    if let Err(e) = run() {
        error!("{e}");
        exit(1);
    }
}
