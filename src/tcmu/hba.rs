// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! The host-level device registry and uevent correlation.
//!
//! One HBA per process: it owns the netlink monitor, hands out LUN ids,
//! serializes device creation, and keeps the volume-name registry. The
//! configfs namespace and the uevent stream are process-global, which is
//! why construction is keyed - asking again for the same module returns
//! the existing instance, asking for a different one is refused.

use std::{
    collections::HashMap,
    fs,
    os::fd::{AsRawFd, OwnedFd},
    path::{Path, PathBuf},
    sync::{
        mpsc::{Receiver, RecvTimeoutError, SyncSender},
        Arc, Mutex, Weak,
    },
    thread,
    time::Duration,
};

use log::{info, warn};

use crate::{
    scsi::{emulation::EmulatedLun, BlockBackend, DataSizes, InquiryInfo, ScsiCmdHandler},
    tcmu::{
        device::{DeviceConfig, TcmuDevice},
        uevent::{self, BlockDeviceEvent, UeventSocket},
        wwn::NaaWwn,
        Error, Result,
    },
};

/// The loopback HBA id used for every device we create.
pub const HBA_ID: u32 = 42;

const EVENT_CHANNEL_CAPACITY: usize = 32;
/// Budget for the kernel's `add` uevent after configfs enable.
const CREATE_TIMEOUT: Duration = Duration::from_secs(15);

static INSTANCE: Mutex<Option<(String, Weak<Hba>)>> = Mutex::new(None);

struct Inner {
    next_lun: u32,
    /// The single in-flight creation, if any. Guarded by the same lock as
    /// the registry; creation fails fast when occupied.
    pending: Option<String>,
    devices: HashMap<String, Arc<TcmuDevice>>,
}

#[derive(Default)]
struct MonitorState {
    thread: Option<thread::JoinHandle<()>>,
    stop_w: Option<OwnedFd>,
}

/// The process-scope owner of TCMU devices for one `/dev/<module>` namespace.
pub struct Hba {
    module: String,
    dev_dir: PathBuf,
    inner: Mutex<Inner>,
    events: Mutex<Receiver<BlockDeviceEvent>>,
    events_tx: SyncSender<BlockDeviceEvent>,
    monitor: Mutex<MonitorState>,
}

impl Hba {
    /// Get the process HBA for `module`, creating it on first call. Device
    /// nodes appear under `/dev/<module>`.
    pub fn new(module: &str) -> Result<Arc<Self>> {
        Self::new_with_dev_root(module, Path::new("/dev"))
    }

    /// Like [`Hba::new`] with an explicit parent for the module directory.
    pub fn new_with_dev_root(module: &str, dev_root: &Path) -> Result<Arc<Self>> {
        let mut slot = INSTANCE.lock().unwrap();
        if let Some((existing, weak)) = slot.as_ref() {
            if let Some(hba) = weak.upgrade() {
                if existing == module {
                    return Ok(hba);
                }
                return Err(Error::HbaExists(existing.clone()));
            }
        }
        let (events_tx, events_rx) = std::sync::mpsc::sync_channel(EVENT_CHANNEL_CAPACITY);
        let hba = Arc::new(Self {
            module: module.to_string(),
            dev_dir: dev_root.join(module),
            inner: Mutex::new(Inner {
                next_lun: 0,
                pending: None,
                devices: HashMap::new(),
            }),
            events: Mutex::new(events_rx),
            events_tx,
            monitor: Mutex::new(MonitorState::default()),
        });
        *slot = Some((module.to_string(), Arc::downgrade(&hba)));
        Ok(hba)
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn dev_dir(&self) -> &Path {
        &self.dev_dir
    }

    /// Start the uevent monitor. Idempotent.
    pub fn start(&self) -> Result<()> {
        let mut monitor = self.monitor.lock().unwrap();
        if monitor.thread.is_some() {
            return Ok(());
        }
        let sock = UeventSocket::open().map_err(Error::Netlink)?;
        let (stop_r, stop_w) = super::poll::byte_pipe()?;
        let events = self.events_tx.clone();
        let thread = thread::Builder::new()
            .name("tcmu-uevent".to_string())
            .spawn(move || uevent::run_monitor(sock, stop_r, events))?;
        *monitor = MonitorState {
            thread: Some(thread),
            stop_w: Some(stop_w),
        };
        Ok(())
    }

    /// Create a LUN over `backend` with the default emulator.
    pub fn create_device(
        &self,
        name: &str,
        size: u64,
        sector_size: u32,
        backend: Box<dyn BlockBackend>,
    ) -> Result<Arc<TcmuDevice>> {
        self.create_device_with(name, size, sector_size, move |config| {
            Arc::new(EmulatedLun::new(
                backend,
                InquiryInfo::default(),
                config.sizes,
                config.dev_config(),
                config.attrib_dir(),
            ))
        })
    }

    /// Create a LUN served by a caller-provided handler.
    pub fn create_device_with_handler(
        &self,
        name: &str,
        size: u64,
        sector_size: u32,
        handler: Arc<dyn ScsiCmdHandler>,
    ) -> Result<Arc<TcmuDevice>> {
        self.create_device_with(name, size, sector_size, move |_| handler)
    }

    fn create_device_with(
        &self,
        name: &str,
        size: u64,
        sector_size: u32,
        make_handler: impl FnOnce(&DeviceConfig) -> Arc<dyn ScsiCmdHandler>,
    ) -> Result<Arc<TcmuDevice>> {
        let lun = {
            let mut inner = self.inner.lock().unwrap();
            if inner.pending.is_some() {
                return Err(Error::AlreadyInitializing);
            }
            inner.pending = Some(name.to_string());
            let lun = inner.next_lun;
            inner.next_lun += 1;
            lun
        };

        let result = self.build_device(name, lun, size, sector_size, make_handler);

        let mut inner = self.inner.lock().unwrap();
        inner.pending = None;
        if let Ok(device) = &result {
            inner.devices.insert(name.to_string(), Arc::clone(device));
        }
        result
    }

    fn build_device(
        &self,
        name: &str,
        lun: u32,
        size: u64,
        sector_size: u32,
        make_handler: impl FnOnce(&DeviceConfig) -> Arc<dyn ScsiCmdHandler>,
    ) -> Result<Arc<TcmuDevice>> {
        fs::create_dir_all(&self.dev_dir)?;
        let config = DeviceConfig {
            volume_name: name.to_string(),
            hba_id: HBA_ID,
            lun,
            wwn: NaaWwn::for_volume(name),
            sizes: DataSizes {
                volume_size: size,
                sector_size,
            },
            dev_dir: self.dev_dir.clone(),
        };
        let handler = make_handler(&config);
        let device = Arc::new(TcmuDevice::setup(config, handler)?);

        match self.wait_for_devnum() {
            Ok((major, minor)) => {
                device.set_devnum(major, minor);
                if let Err(e) = device.create_node() {
                    let _ = device.close();
                    return Err(e);
                }
                device.start_poll()?;
                info!("device {name} attached at {}", device.node_path().display());
                Ok(device)
            }
            Err(e) => {
                warn!("creation of {name} failed while waiting for the kernel: {e}");
                let _ = device.close();
                Err(e)
            }
        }
    }

    /// Select on the monitor's channel until a TCMU disk shows up or the
    /// creation budget runs out. The monitor has already filtered by
    /// subsystem, devtype, action and model string.
    fn wait_for_devnum(&self) -> Result<(u32, u32)> {
        let events = self.events.lock().unwrap();
        match events.recv_timeout(CREATE_TIMEOUT) {
            Ok(event) => {
                info!(
                    "kernel reports {} at {}:{}",
                    event.devnode.display(),
                    event.major,
                    event.minor
                );
                Ok((event.major, event.minor))
            }
            Err(RecvTimeoutError::Timeout) => Err(Error::UeventTimeout),
            Err(RecvTimeoutError::Disconnected) => {
                warn!("uevent monitor is gone");
                Err(Error::UeventTimeout)
            }
        }
    }

    /// Remove a device by volume name. Success when it never existed.
    pub fn remove_device(&self, name: &str) -> Result<()> {
        let device = {
            let inner = self.inner.lock().unwrap();
            inner.devices.get(name).cloned()
        };
        let Some(device) = device else {
            return Ok(());
        };
        if device.is_busy() {
            return Err(Error::DeviceBusy);
        }
        device.close()?;
        self.inner.lock().unwrap().devices.remove(name);
        info!("device {name} removed");
        Ok(())
    }

    /// Remove every device, then stop and join the monitor.
    pub fn stop(&self) -> Result<()> {
        let names: Vec<String> = {
            let inner = self.inner.lock().unwrap();
            inner.devices.keys().cloned().collect()
        };
        for name in names {
            if let Err(e) = self.remove_device(&name) {
                warn!("removing {name} during stop failed: {e}");
            }
        }
        let mut monitor = self.monitor.lock().unwrap();
        if let Some(stop_w) = monitor.stop_w.take() {
            let _ = super::poll::write_byte(stop_w.as_raw_fd());
        }
        if let Some(thread) = monitor.thread.take() {
            let _ = thread.join();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyed_singleton() {
        let root = tempfile::tempdir().unwrap();
        let first = Hba::new_with_dev_root("tcmu-test", root.path()).unwrap();
        let again = Hba::new_with_dev_root("tcmu-test", root.path()).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(first.dev_dir(), root.path().join("tcmu-test"));

        match Hba::new_with_dev_root("other", root.path()) {
            Err(Error::HbaExists(module)) => assert_eq!(module, "tcmu-test"),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("a second module must be refused"),
        }
    }
}
