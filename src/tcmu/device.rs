// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! One TCMU loop LUN end-to-end: configfs wiring, UIO discovery and
//! mapping, the device node, the poll loop, and timed teardown.

use std::{
    ffi::CString,
    fs::{self, File, OpenOptions},
    io::{self, Write},
    os::fd::{AsRawFd, OwnedFd, RawFd},
    os::unix::{ffi::OsStrExt, fs::OpenOptionsExt},
    path::{Path, PathBuf},
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use log::{debug, error, info, warn};
use vm_memory::{mmap::MmapRegion, FileOffset};

use crate::{
    scsi::{DataSizes, ScsiCmdHandler, ScsiResponse},
    tcmu::{poll, ring::Ring, wwn::NaaWwn, Error, Result},
};

const CONFIG_DIR: &str = "/sys/kernel/config/target/core";
const LOOPBACK_DIR: &str = "/sys/kernel/config/target/loopback";
const UIO_SYS_DIR: &str = "/sys/class/uio";
const SCSI_DEVICES_DIR: &str = "/sys/bus/scsi/devices";

/// Budget for the poll loop to confirm exit after the shutdown byte.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(30);
/// Budget per configfs path removal; the kernel may need time to release
/// references.
const REMOVE_TIMEOUT: Duration = Duration::from_secs(30);
/// Attempts x interval while waiting for the SCSI address to materialize.
const ADDRESS_POLL_ATTEMPTS: u32 = 30;
const ADDRESS_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Identity and placement of one LUN.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub volume_name: String,
    pub hba_id: u32,
    pub lun: u32,
    pub wwn: NaaWwn,
    pub sizes: DataSizes,
    /// Directory receiving the block node, e.g. `/dev/tcmu`.
    pub dev_dir: PathBuf,
}

impl DeviceConfig {
    /// The TCMU dev-config string, also reported in VPD 0x83.
    pub fn dev_config(&self) -> String {
        format!("libtcmu//{}", self.volume_name)
    }

    /// The core backstore directory for this volume.
    pub fn core_dir(&self) -> PathBuf {
        Path::new(CONFIG_DIR)
            .join(format!("user_{}", self.hba_id))
            .join(&self.volume_name)
    }

    /// Where the kernel exposes `hw_block_size`, `hw_max_sectors`, ...
    pub fn attrib_dir(&self) -> PathBuf {
        self.core_dir().join("attrib")
    }

    pub fn tpgt_dir(&self) -> PathBuf {
        Path::new(LOOPBACK_DIR)
            .join(self.wwn.device_id())
            .join("tpgt_1")
    }

    pub fn lun_dir(&self) -> PathBuf {
        self.tpgt_dir().join("lun").join(format!("lun_{}", self.lun))
    }

    pub fn node_path(&self) -> PathBuf {
        self.dev_dir.join(&self.volume_name)
    }
}

/// The part of a device shared with its poll loop and workers.
pub(crate) struct DeviceCore {
    volume_name: String,
    ring: Ring,
    uio: File,
    handler: Arc<dyn ScsiCmdHandler>,
    /// Serializes response posting and the mailbox tail among workers.
    post_lock: Mutex<()>,
    shutdown_r: OwnedFd,
    shutdown_w: OwnedFd,
}

impl DeviceCore {
    pub(crate) fn new(
        volume_name: String,
        ring: Ring,
        uio: File,
        handler: Arc<dyn ScsiCmdHandler>,
    ) -> io::Result<Self> {
        let (shutdown_r, shutdown_w) = poll::byte_pipe()?;
        Ok(Self {
            volume_name,
            ring,
            uio,
            handler,
            post_lock: Mutex::new(()),
            shutdown_r,
            shutdown_w,
        })
    }

    pub(crate) fn volume_name(&self) -> &str {
        &self.volume_name
    }

    pub(crate) fn ring(&self) -> &Ring {
        &self.ring
    }

    pub(crate) fn uio(&self) -> &File {
        &self.uio
    }

    pub(crate) fn uio_fd(&self) -> RawFd {
        self.uio.as_raw_fd()
    }

    pub(crate) fn shutdown_fd(&self) -> RawFd {
        self.shutdown_r.as_raw_fd()
    }

    pub(crate) fn handler(&self) -> &dyn ScsiCmdHandler {
        self.handler.as_ref()
    }

    /// Wake the poll loop out of its wait. The pipe is non-blocking; a full
    /// pipe means the signal is already pending.
    pub(crate) fn signal_shutdown(&self) {
        let _ = poll::write_byte(self.shutdown_w.as_raw_fd());
    }

    /// Post one response and kick the kernel. Failures keep the loop alive.
    pub(crate) fn complete(&self, resp: &ScsiResponse) {
        let _post = self.post_lock.lock().unwrap();
        if let Err(e) = self.ring.post_response(resp) {
            error!(
                "device {}: posting response for command {} failed: {e}",
                self.volume_name,
                resp.id()
            );
            return;
        }
        if let Err(e) = (&self.uio).write_all(&0u32.to_ne_bytes()) {
            error!("device {}: uio kick failed: {e}", self.volume_name);
        }
    }
}

#[derive(Default)]
struct PollState {
    thread: Option<thread::JoinHandle<()>>,
    done: Option<Receiver<()>>,
}

/// One live TCMU device. Created through [`crate::tcmu::hba::Hba`].
pub struct TcmuDevice {
    config: DeviceConfig,
    core: Arc<DeviceCore>,
    /// Mailbox tail as cached at open; the poll loop takes over from here.
    first_tail: u32,
    poll: Mutex<PollState>,
    devnum: Mutex<Option<(u32, u32)>>,
}

impl TcmuDevice {
    /// Bring the LUN up through the enable-side protocol: stale-state
    /// teardown, core backstore setup, UIO discovery and mapping, loopback
    /// wiring. The device node and poll loop follow once the kernel's
    /// uevent supplies the device numbers.
    pub(crate) fn setup(config: DeviceConfig, handler: Arc<dyn ScsiCmdHandler>) -> Result<Self> {
        teardown_paths(&config)?;
        let cleanup = config.clone();
        let r = Self::bring_up(config, handler);
        if r.is_err() {
            if let Err(e) = teardown_paths(&cleanup) {
                warn!(
                    "cleanup after failed setup of {} failed too: {e}",
                    cleanup.volume_name
                );
            }
        }
        r
    }

    fn bring_up(config: DeviceConfig, handler: Arc<dyn ScsiCmdHandler>) -> Result<Self> {
        pre_enable(&config)?;

        let uio_name = find_uio(&config.dev_config())?;
        let (uio, region) = open_uio(&uio_name)?;
        let ring = Ring::new(Arc::new(region))?;
        debug!(
            "device {}: mailbox version {} flags {:#x} cmdr {}+{} head {} tail {}",
            config.volume_name,
            ring.mb_version()?,
            ring.mb_flags()?,
            ring.mb_cmdr_offset()?,
            ring.mb_cmdr_size()?,
            ring.mb_cmd_head()?,
            ring.mb_cmd_tail()?,
        );
        let first_tail = ring.mb_cmd_tail()?;

        post_enable(&config)?;

        let core = DeviceCore::new(config.volume_name.clone(), ring, uio, handler)?;
        Ok(Self {
            config,
            core: Arc::new(core),
            first_tail,
            poll: Mutex::new(PollState::default()),
            devnum: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn node_path(&self) -> PathBuf {
        self.config.node_path()
    }

    pub(crate) fn set_devnum(&self, major: u32, minor: u32) {
        *self.devnum.lock().unwrap() = Some((major, minor));
    }

    /// Create the block-special node once the kernel reported the device
    /// numbers.
    pub(crate) fn create_node(&self) -> Result<()> {
        let (major, minor) = self
            .devnum
            .lock()
            .unwrap()
            .ok_or_else(|| Error::DevNode {
                path: self.config.node_path(),
                source: io::Error::new(io::ErrorKind::NotFound, "no device numbers yet"),
            })?;
        let path = self.config.node_path();
        info!("creating {} as {major}:{minor}", path.display());
        mknod_blk(&path, major, minor).map_err(|source| Error::DevNode { path, source })
    }

    /// Spawn the poll loop. Idempotent.
    pub(crate) fn start_poll(&self) -> Result<()> {
        let mut state = self.poll.lock().unwrap();
        if state.thread.is_some() {
            return Ok(());
        }
        let (done_tx, done_rx) = mpsc::channel();
        let core = Arc::clone(&self.core);
        let first_tail = self.first_tail;
        let thread = thread::Builder::new()
            .name(format!("tcmu-poll-{}", self.config.volume_name))
            .spawn(move || poll::run(core, first_tail, done_tx))?;
        *state = PollState {
            thread: Some(thread),
            done: Some(done_rx),
        };
        Ok(())
    }

    /// Whether anything has this device mounted.
    pub fn is_busy(&self) -> bool {
        let Some((major, minor)) = *self.devnum.lock().unwrap() else {
            return false;
        };
        match fs::read_to_string("/proc/self/mountinfo") {
            Ok(data) => mountinfo_lists_dev(&data, major, minor),
            Err(e) => {
                warn!("cannot read mountinfo: {e}");
                false
            }
        }
    }

    /// Resolve the kernel-side block device (`/dev/sdX`) behind this LUN by
    /// way of the loopback target's SCSI address, polling while the SCSI
    /// midlayer catches up.
    pub fn block_device_path(&self) -> Result<PathBuf> {
        let address_path = self.config.tpgt_dir().join("address");
        let address = fs::read_to_string(&address_path).map_err(|source| Error::ConfigFs {
            path: address_path,
            source,
        })?;
        let address = address.trim();
        for attempt in 0..ADDRESS_POLL_ATTEMPTS {
            if let Some(name) = scan_scsi_block_dev(address)? {
                return Ok(Path::new("/dev").join(name));
            }
            debug!("waiting for a block device at address {address} (attempt {attempt})");
            thread::sleep(ADDRESS_POLL_INTERVAL);
        }
        Err(Error::BlockDeviceNotFound(address.to_string()))
    }

    /// Stop the poll loop and dismantle the configfs state and device node.
    pub fn close(&self) -> Result<()> {
        {
            let mut state = self.poll.lock().unwrap();
            if let (Some(thread), Some(done)) = (state.thread.take(), state.done.take()) {
                self.core.signal_shutdown();
                match done.recv_timeout(CLOSE_TIMEOUT) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        let _ = thread.join();
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        // release resources anyway; the detached thread can
                        // only see a dead pipe from here on
                        warn!(
                            "poll loop for {} did not confirm exit within {CLOSE_TIMEOUT:?}",
                            self.config.volume_name
                        );
                    }
                }
            }
        }
        teardown_paths(&self.config)
    }
}

/// Write each line as one full configfs attribute store to `path`.
fn write_attr_lines(path: &Path, lines: &[String]) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|source| Error::ConfigFs {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    for line in lines {
        debug!("configfs {} <- {line}", path.display());
        let write = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o755)
            .open(path)
            .and_then(|mut f| f.write_all(format!("{line}\n").as_bytes()));
        write.map_err(|source| Error::ConfigFs {
            path: path.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

/// Steps 2-3 of creation: populate the core backstore and enable it.
fn pre_enable(config: &DeviceConfig) -> Result<()> {
    let core_dir = config.core_dir();
    write_attr_lines(
        &core_dir.join("control"),
        &[
            format!("dev_size={}", config.sizes.volume_size),
            format!("dev_config={}", config.dev_config()),
            format!("hw_block_size={}", config.sizes.sector_size),
            "async=1".to_string(),
        ],
    )?;
    write_attr_lines(&core_dir.join("enable"), &["1".to_string()])
}

/// Step 7: wire the loopback fabric - nexus, LUN directory, and the symlink
/// binding the core device into the LUN.
fn post_enable(config: &DeviceConfig) -> Result<()> {
    let tpgt = config.tpgt_dir();
    write_attr_lines(&tpgt.join("nexus"), &[config.wwn.nexus_id()])?;

    let lun_dir = config.lun_dir();
    fs::create_dir_all(&lun_dir).map_err(|source| Error::ConfigFs {
        path: lun_dir.clone(),
        source,
    })?;

    let link = lun_dir.join(&config.volume_name);
    std::os::unix::fs::symlink(config.core_dir(), &link).map_err(|source| Error::ConfigFs {
        path: link,
        source,
    })
}

/// Step 4: find the UIO device the kernel created for our dev-config. The
/// sysfs name is a `tcm-user/<hba>/<vol>/<dev_config>` tuple.
fn find_uio(dev_config: &str) -> Result<String> {
    for entry in fs::read_dir("/dev")? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with("uio") {
            continue;
        }
        let sysfile = Path::new(UIO_SYS_DIR).join(name).join("name");
        let content = fs::read_to_string(&sysfile)?;
        let parts: Vec<&str> = content.trim_end_matches('\n').splitn(4, '/').collect();
        if parts.len() == 4 && parts[0] == "tcm-user" && parts[3] == dev_config {
            return Ok(name.to_string());
        }
    }
    Err(Error::UioNotFound(dev_config.to_string()))
}

/// Step 5: open the UIO carrier and map its first region.
fn open_uio(name: &str) -> Result<(File, MmapRegion)> {
    let path = Path::new("/dev").join(name);
    let uio = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
        .open(&path)
        .map_err(|source| Error::UioOpen {
            path: path.clone(),
            source,
        })?;

    let size_path = Path::new(UIO_SYS_DIR).join(name).join("maps/map0/size");
    let raw = fs::read_to_string(&size_path).map_err(|source| Error::UioOpen {
        path: size_path,
        source,
    })?;
    let size = parse_map_size(raw.trim())?;

    let map_file = uio.try_clone().map_err(|source| Error::UioOpen {
        path: path.clone(),
        source,
    })?;
    let region = MmapRegion::build(
        Some(FileOffset::new(map_file, 0)),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED,
    )
    .map_err(Error::Mmap)?;
    Ok((uio, region))
}

/// sysfs reports the map size as `0x`-prefixed hex on current kernels.
fn parse_map_size(raw: &str) -> Result<usize> {
    let parsed = match raw.strip_prefix("0x") {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    parsed.map_err(|e| Error::Io(io::Error::new(io::ErrorKind::InvalidData, e)))
}

/// Whether any mount uses the device with these numbers. Field 3 of a
/// mountinfo line is the `major:minor` of the mounted device.
pub(crate) fn mountinfo_lists_dev(data: &str, major: u32, minor: u32) -> bool {
    let devnum = format!("{major}:{minor}");
    data.lines()
        .any(|line| line.split_whitespace().nth(2) == Some(devnum.as_str()))
}

/// Scan the SCSI bus for a block device whose address starts with `addr`;
/// returns its kernel name (e.g. `sdb`).
fn scan_scsi_block_dev(addr: &str) -> Result<Option<String>> {
    let base = Path::new(SCSI_DEVICES_DIR);
    let entries = match fs::read_dir(base) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(addr) {
            continue;
        }
        let Ok(blocks) = fs::read_dir(entry.path().join("block")) else {
            continue;
        };
        for block in blocks.flatten() {
            if block.path().join("dev").exists() {
                if let Some(bname) = block.file_name().to_str() {
                    return Ok(Some(bname.to_string()));
                }
            }
        }
    }
    Ok(None)
}

fn mknod_blk(path: &Path, major: u32, minor: u32) -> io::Result<()> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: cpath is a valid NUL-terminated string; makedev is pure.
    let rc = unsafe {
        libc::mknod(
            cpath.as_ptr(),
            libc::S_IFBLK | 0o600,
            libc::makedev(major, minor),
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Remove the configfs footprint of a device, deepest first, then its node.
/// Also the stale-state sweep run before creation.
fn teardown_paths(config: &DeviceConfig) -> Result<()> {
    let tpgt = config.tpgt_dir();
    let lun_dir = config.lun_dir();
    let paths = [
        lun_dir.join(&config.volume_name),
        lun_dir,
        tpgt.clone(),
        tpgt.parent().map(Path::to_path_buf).unwrap_or_default(),
        config.core_dir(),
        config.node_path(),
    ];
    for path in paths {
        remove_path(&path)?;
    }
    Ok(())
}

/// Remove one path with a timeout guard: configfs rmdir can block while the
/// kernel drains references, and a wedged entry must not hang teardown.
fn remove_path(path: &Path) -> Result<()> {
    let (tx, rx) = mpsc::channel();
    let target = path.to_path_buf();
    thread::spawn(move || {
        let _ = tx.send(remove_entry(&target));
    });
    match rx.recv_timeout(REMOVE_TIMEOUT) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(source)) => Err(Error::ConfigFs {
            path: path.to_path_buf(),
            source,
        }),
        Err(_) => Err(Error::TeardownTimeout(path.to_path_buf())),
    }
}

fn remove_entry(path: &Path) -> io::Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    debug!("removing {}", path.display());
    let removed = if meta.is_dir() {
        fs::remove_dir(path)
    } else {
        fs::remove_file(path)
    };
    match removed {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DeviceConfig {
        DeviceConfig {
            volume_name: "vol1".to_string(),
            hba_id: 42,
            lun: 3,
            wwn: NaaWwn::for_volume("vol1"),
            sizes: DataSizes {
                volume_size: 1 << 30,
                sector_size: 512,
            },
            dev_dir: PathBuf::from("/dev/tcmu"),
        }
    }

    #[test]
    fn test_config_paths() {
        let config = config();
        assert_eq!(config.dev_config(), "libtcmu//vol1");
        assert_eq!(
            config.core_dir(),
            Path::new("/sys/kernel/config/target/core/user_42/vol1")
        );
        assert_eq!(
            config.attrib_dir(),
            Path::new("/sys/kernel/config/target/core/user_42/vol1/attrib")
        );
        let tpgt = config.tpgt_dir();
        assert!(tpgt.starts_with("/sys/kernel/config/target/loopback/naa.5"));
        assert!(tpgt.ends_with("tpgt_1"));
        assert_eq!(config.lun_dir(), tpgt.join("lun/lun_3"));
        assert_eq!(config.node_path(), Path::new("/dev/tcmu/vol1"));
    }

    #[test]
    fn test_parse_map_size() {
        assert_eq!(parse_map_size("0x10000").unwrap(), 0x10000);
        assert_eq!(parse_map_size("4194304").unwrap(), 4194304);
        assert!(parse_map_size("garbage").is_err());
    }

    #[test]
    fn test_mountinfo_lookup() {
        let data = "\
22 27 0:20 / /sys rw,nosuid,nodev,noexec,relatime shared:7 - sysfs sysfs rw
29 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
96 29 253:16 / /mnt/vol rw,relatime shared:50 - ext4 /dev/tcmu/vol1 rw
";
        assert!(mountinfo_lists_dev(data, 253, 16));
        assert!(mountinfo_lists_dev(data, 8, 1));
        assert!(!mountinfo_lists_dev(data, 253, 17));
        assert!(!mountinfo_lists_dev("", 253, 16));
    }

    #[test]
    fn test_remove_entry_kinds() {
        let dir = tempfile::tempdir().unwrap();

        let file = dir.path().join("f");
        fs::write(&file, b"x").unwrap();
        remove_entry(&file).unwrap();
        assert!(!file.exists());

        let sub = dir.path().join("d");
        fs::create_dir(&sub).unwrap();
        remove_entry(&sub).unwrap();
        assert!(!sub.exists());

        // absent paths are fine: teardown is idempotent
        remove_entry(&dir.path().join("missing")).unwrap();
    }

    #[test]
    fn test_write_attr_lines_each_write_is_a_full_store() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("sub").join("control");
        write_attr_lines(
            &target,
            &["dev_size=1024".to_string(), "async=1".to_string()],
        )
        .unwrap();
        // every line is its own truncating write, so only the last survives
        assert_eq!(fs::read_to_string(&target).unwrap(), "async=1\n");
    }
}
