// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Kernel uevent monitoring over `NETLINK_KOBJECT_UEVENT`.
//!
//! The monitor subscribes to the raw kernel broadcast group and forwards
//! `add` events for TCMU-backed disks to the HBA's creation path. Messages
//! are `\0`-separated `KEY=VALUE` properties behind an `action@devpath`
//! header; frames without that header (libudev traffic) are ignored.

use std::{
    fs, io, mem,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    path::{Path, PathBuf},
    sync::mpsc::{SyncSender, TrySendError},
    thread,
    time::Duration,
};

use log::{debug, error, info, warn};

use crate::tcmu::poll::{self, Wake};

/// How long the monitor keeps retrying a momentarily full event channel
/// before dropping an event: 300 x 50ms.
const FORWARD_RETRIES: u32 = 300;
const FORWARD_BACKOFF: Duration = Duration::from_millis(50);

/// An `add` event for a TCMU-backed disk, ready for correlation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDeviceEvent {
    pub devnode: PathBuf,
    pub major: u32,
    pub minor: u32,
}

/// The properties we care about from one uevent frame.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Uevent {
    pub action: String,
    pub subsystem: String,
    pub devtype: String,
    pub devname: String,
    pub major: Option<u32>,
    pub minor: Option<u32>,
}

/// Parse a raw kobject uevent frame. Returns `None` for frames that are not
/// kernel uevents (no `@` header) or are not valid UTF-8.
pub fn parse(buf: &[u8]) -> Option<Uevent> {
    let text = std::str::from_utf8(buf).ok()?;
    let mut fields = text.split('\0');
    let header = fields.next()?;
    if !header.contains('@') {
        return None;
    }
    let mut ev = Uevent::default();
    for field in fields {
        let Some((key, value)) = field.split_once('=') else {
            continue;
        };
        match key {
            "ACTION" => ev.action = value.to_string(),
            "SUBSYSTEM" => ev.subsystem = value.to_string(),
            "DEVTYPE" => ev.devtype = value.to_string(),
            "DEVNAME" => ev.devname = value.to_string(),
            "MAJOR" => ev.major = value.parse().ok(),
            "MINOR" => ev.minor = value.parse().ok(),
            _ => {}
        }
    }
    Some(ev)
}

/// Whether the block device behind `devnode` is TCMU-backed, judged by its
/// SCSI model string.
pub fn is_tcmu_device(devnode: &Path) -> io::Result<bool> {
    let name = devnode
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "devnode without a name"))?;
    let model = fs::read_to_string(Path::new("/sys/block").join(name).join("device/model"))?;
    Ok(model.contains("TCMU"))
}

/// A bound `NETLINK_KOBJECT_UEVENT` datagram socket.
pub struct UeventSocket {
    fd: OwnedFd,
}

impl UeventSocket {
    pub fn open() -> io::Result<Self> {
        // SAFETY: plain socket(2); the result is checked before wrapping.
        let raw = unsafe {
            libc::socket(
                libc::PF_NETLINK,
                libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
                libc::NETLINK_KOBJECT_UEVENT,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: raw is a freshly created, owned descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // SAFETY: sockaddr_nl is plain old data; zeroed is a valid init.
        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_pid = 0;
        addr.nl_groups = 1; // kernel uevent broadcast group

        // SAFETY: addr is a valid sockaddr_nl and the length matches it.
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                std::ptr::addr_of!(addr).cast::<libc::sockaddr>(),
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: buf is valid for writes of its whole length.
        let n = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr().cast(),
                buf.len(),
                0,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl AsRawFd for UeventSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// The monitor loop: runs on its own thread until a byte lands on the stop
/// pipe or the event channel is dropped.
pub(crate) fn run_monitor(sock: UeventSocket, stop: OwnedFd, events: SyncSender<BlockDeviceEvent>) {
    info!("uevent monitor started");
    let mut buf = [0u8; 4096];
    loop {
        match poll::wait_readable(sock.as_raw_fd(), stop.as_raw_fd()) {
            Ok(Wake::Shutdown) => {
                info!("uevent monitor stopping");
                return;
            }
            Ok(Wake::Ready) => {}
            Err(e) => {
                error!("uevent monitor poll failed: {e}");
                return;
            }
        }
        let n = match sock.recv(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.raw_os_error() == Some(libc::ENOBUFS) => {
                // the socket overflowed under an event flood; later events
                // still arrive, so keep listening
                warn!("uevent socket overflowed: {e}");
                continue;
            }
            Err(e) => {
                error!("uevent recv failed: {e}");
                return;
            }
        };
        let Some(ev) = parse(&buf[..n]) else {
            continue;
        };
        if ev.action != "add" || ev.subsystem != "block" || ev.devtype != "disk" {
            continue;
        }
        let (Some(major), Some(minor)) = (ev.major, ev.minor) else {
            continue;
        };
        if ev.devname.is_empty() {
            continue;
        }
        let devnode = if ev.devname.starts_with('/') {
            PathBuf::from(&ev.devname)
        } else {
            Path::new("/dev").join(&ev.devname)
        };
        match is_tcmu_device(&devnode) {
            Ok(true) => {}
            Ok(false) => {
                debug!("ignoring non-TCMU disk {}", devnode.display());
                continue;
            }
            Err(e) => {
                debug!("cannot inspect {}: {e}", devnode.display());
                continue;
            }
        }
        if !forward(&events, BlockDeviceEvent { devnode, major, minor }) {
            return;
        }
    }
}

/// Push an event to the creation path, backing off while the channel is
/// full. Returns false when the receiving side is gone.
fn forward(events: &SyncSender<BlockDeviceEvent>, mut event: BlockDeviceEvent) -> bool {
    for _ in 0..FORWARD_RETRIES {
        match events.try_send(event) {
            Ok(()) => return true,
            Err(TrySendError::Full(back)) => {
                event = back;
                thread::sleep(FORWARD_BACKOFF);
            }
            Err(TrySendError::Disconnected(_)) => return false,
        }
    }
    warn!("event channel stayed full; dropping a device event");
    true
}
