// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! The TCMU runtime: ring transport, device lifecycle, HBA registry.

pub mod device;
pub mod hba;
mod poll;
pub mod ring;
pub mod uevent;
pub mod wwn;

use std::{io, path::PathBuf};

use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("configfs write to {path} failed: {source}")]
    ConfigFs { path: PathBuf, source: io::Error },
    #[error("no uio device matches dev config {0:?}")]
    UioNotFound(String),
    #[error("opening uio device {path} failed: {source}")]
    UioOpen { path: PathBuf, source: io::Error },
    #[error("mapping the uio region failed: {0}")]
    Mmap(vm_memory::mmap::MmapRegionError),
    #[error("timed out waiting for the kernel block device to appear")]
    UeventTimeout,
    #[error("another device is already initializing on this hba")]
    AlreadyInitializing,
    #[error("device is mounted")]
    DeviceBusy,
    #[error("timed out removing {0}")]
    TeardownTimeout(PathBuf),
    #[error("unsupported CDB opcode {0:#04x}")]
    UnsupportedOpcode(u8),
    #[error("unexpected ring entry opcode {0}")]
    Protocol(u32),
    #[error("ring geometry exceeds the shared region")]
    Geometry,
    #[error("shared region access out of bounds: {0}")]
    Ring(#[from] vm_memory::VolatileMemoryError),
    #[error("an hba already exists for module {0:?}")]
    HbaExists(String),
    #[error("invalid WWN component: {0}")]
    InvalidWwn(String),
    #[error("netlink uevent socket: {0}")]
    Netlink(io::Error),
    #[error("creating device node {path} failed: {source}")]
    DevNode { path: PathBuf, source: io::Error },
    #[error("no SCSI block device appeared for address {0:?}")]
    BlockDeviceNotFound(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}
