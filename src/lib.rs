// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! A user-space SCSI target runtime for the Linux TCMU facility.
//!
//! The kernel's TCM userspace passthrough publishes SCSI commands through a
//! shared-memory command ring carried by a UIO device; this crate drains that
//! ring, emulates enough of SPC/SBC to make the LUN usable, and posts the
//! responses back, so that any object capable of positional reads and writes
//! shows up as a regular local block device.
//!
//! [`tcmu::hba::Hba`] owns device creation and teardown (configfs wiring,
//! uevent correlation, device nodes); [`scsi`] holds the command model and
//! the default emulator over a [`scsi::BlockBackend`].

pub mod scsi;
pub mod tcmu;
