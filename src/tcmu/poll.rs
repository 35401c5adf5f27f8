// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! The per-device poll loop: wait on the UIO fd and the shutdown pipe,
//! drain the ring, fan commands out to workers, and confirm exit.

use std::{
    fs::File,
    io::{self, Read},
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    sync::{mpsc::Sender, Arc},
    thread,
};

use log::{debug, error};

use crate::{scsi::ScsiCmd, tcmu::device::DeviceCore};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum Wake {
    /// The first descriptor is readable.
    Ready,
    /// The second descriptor (the shutdown side) is readable.
    Shutdown,
}

/// A non-blocking byte pipe, read end first. One byte written to the write
/// end wakes anything polling the read end.
pub(crate) fn byte_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0; 2];
    // SAFETY: pipe2 fills the two descriptors; the result is checked.
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: both descriptors are freshly created and owned by us.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

pub(crate) fn write_byte(fd: RawFd) -> io::Result<()> {
    let buf = [0u8];
    // SAFETY: buf is valid for reads of one byte.
    let n = unsafe { libc::write(fd, buf.as_ptr().cast(), 1) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Block in `poll(2)` until one of the two descriptors is readable.
/// `EINTR` retries; unexpected revents on the first descriptor are an error.
pub(crate) fn wait_readable(ready_fd: RawFd, shutdown_fd: RawFd) -> io::Result<Wake> {
    let mut fds = [
        libc::pollfd {
            fd: ready_fd,
            events: libc::POLLIN,
            revents: 0,
        },
        libc::pollfd {
            fd: shutdown_fd,
            events: libc::POLLIN,
            revents: 0,
        },
    ];
    loop {
        // SAFETY: fds points at two initialized pollfd structs.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if rc < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }
        if fds[1].revents & libc::POLLIN != 0 {
            return Ok(Wake::Shutdown);
        }
        if fds[0].revents != 0 {
            if fds[0].revents & libc::POLLIN != 0 {
                return Ok(Wake::Ready);
            }
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("unexpected poll revents {:#x}", fds[0].revents),
            ));
        }
    }
}

/// Consume whatever is pending of the UIO event counter. The fd is
/// non-blocking; `EINTR` retries, `EAGAIN` or anything else ends the drain.
fn drain_events(uio: &File) {
    let mut buf = [0u8; 4];
    loop {
        match (&*uio).read(&mut buf) {
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

/// The loop proper. `cmd_tail` is the device's cached tail, owned by this
/// thread; the on-mailbox tail only moves when responses are posted. Exit is
/// confirmed on `done` so close can bound its wait.
pub(crate) fn run(core: Arc<DeviceCore>, mut cmd_tail: u32, done: Sender<()>) {
    let name = core.volume_name().to_string();
    debug!("poll loop for {name} running");
    loop {
        match wait_readable(core.uio_fd(), core.shutdown_fd()) {
            Ok(Wake::Shutdown) => break,
            Ok(Wake::Ready) => {}
            Err(e) => {
                error!("device {name}: poll failed: {e}");
                break;
            }
        }
        drain_events(core.uio());
        loop {
            match core.ring().pop_command(&mut cmd_tail) {
                Ok(Some(cmd)) => dispatch(Arc::clone(&core), cmd),
                Ok(None) => break,
                Err(e) => {
                    // a structural ring error; nothing further can be
                    // trusted on this device
                    error!("device {name}: command ring: {e}");
                    let _ = done.send(());
                    return;
                }
            }
        }
    }
    debug!("poll loop for {name} exiting");
    let _ = done.send(());
}

/// Run one command on its own worker. A handler error still produces a
/// response so the slot is answered.
fn dispatch(core: Arc<DeviceCore>, mut cmd: ScsiCmd) {
    thread::spawn(move || {
        let resp = match core.handler().handle_command(&mut cmd) {
            Ok(resp) => resp,
            Err(e) => {
                error!(
                    "device {}: handler failed on command {}: {e}",
                    core.volume_name(),
                    cmd.id()
                );
                cmd.target_failure()
            }
        };
        core.complete(&resp);
    });
}

#[cfg(test)]
mod tests {
    use std::{
        io::Write,
        sync::{
            mpsc::{self, RecvTimeoutError},
            Arc, Mutex,
        },
        time::{Duration, Instant},
    };

    use super::*;
    use crate::{
        scsi::{ScsiCmdHandler, ScsiResponse, SAM_STAT_GOOD},
        tcmu::{
            device::DeviceCore,
            ring::test_support::RingBuilder,
        },
    };

    struct RecordingHandler {
        seen: Mutex<Vec<u16>>,
    }

    impl ScsiCmdHandler for RecordingHandler {
        fn handle_command(&self, cmd: &mut ScsiCmd) -> io::Result<ScsiResponse> {
            self.seen.lock().unwrap().push(cmd.id());
            Ok(cmd.ok())
        }
    }

    fn fake_uio() -> (File, File) {
        let (r, w) = byte_pipe().unwrap();
        (File::from(r), File::from(w))
    }

    #[test]
    fn test_drains_ring_and_posts_responses() {
        let mut builder = RingBuilder::new();
        builder.push_cmd(21, &[0, 0, 0, 0, 0, 0], &[]);
        let ring = builder.ring();
        let tail = ring.mb_cmd_tail().unwrap();

        let handler = Arc::new(RecordingHandler {
            seen: Mutex::new(Vec::new()),
        });
        let (uio_rx, mut uio_tx) = fake_uio();
        let core = Arc::new(DeviceCore::new("t0".into(), ring, uio_rx, handler.clone()).unwrap());

        let (done_tx, done_rx) = mpsc::channel();
        let thread = {
            let core = Arc::clone(&core);
            thread::spawn(move || run(core, tail, done_tx))
        };

        // kick: the kernel writes its event counter to the uio fd
        uio_tx.write_all(&1u32.to_ne_bytes()).unwrap();

        // the worker posts GOOD and advances the mailbox tail
        let ring = builder.ring();
        let deadline = Instant::now() + Duration::from_secs(5);
        while ring.mb_cmd_tail().unwrap() == 0 {
            assert!(Instant::now() < deadline, "response never posted");
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(*handler.seen.lock().unwrap(), vec![21]);
        let status: u8 = {
            use vm_memory::{Bytes, VolatileMemory};
            builder
                .region
                .as_volatile_slice()
                .read_obj(crate::tcmu::ring::test_support::CMDR_OFF as usize + 8)
                .unwrap()
        };
        assert_eq!(status, SAM_STAT_GOOD);

        // one byte on the shutdown pipe ends the loop within one cycle
        core.signal_shutdown();
        match done_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(()) => {}
            Err(RecvTimeoutError::Timeout) => panic!("poll loop ignored shutdown"),
            Err(e) => panic!("poll loop died: {e}"),
        }
        thread.join().unwrap();
    }

    #[test]
    fn test_shutdown_without_traffic() {
        let builder = RingBuilder::new();
        let ring = builder.ring();
        let handler = Arc::new(RecordingHandler {
            seen: Mutex::new(Vec::new()),
        });
        let (uio_rx, _uio_tx) = fake_uio();
        let core = Arc::new(DeviceCore::new("t1".into(), ring, uio_rx, handler).unwrap());

        let (done_tx, done_rx) = mpsc::channel();
        let thread = {
            let core = Arc::clone(&core);
            thread::spawn(move || run(core, 0, done_tx))
        };

        core.signal_shutdown();
        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("shutdown byte must end an idle poll loop");
        thread.join().unwrap();
    }
}
