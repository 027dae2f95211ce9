//! Platform PTY wrapper: allocates a master/slave pair, forks the caller's
//! command attached to the slave, and exposes async read/write, resize, and
//! signal delivery to the child's process group.
//!
//! Grounded on the existing `TerminalSession` PTY plumbing (raw fd duplication
//! for independent read/write handles, `portable_pty` for the platform
//! backend), generalized from "always spawn a detected shell" to "spawn the
//! caller-provided `SpawnSpec`" and extended with real resize and
//! process-group signal delivery.

use crate::error::PtyError;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::unix::io::{FromRawFd, IntoRawFd, OwnedFd};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, trace, warn};

/// Maximum bytes returned by a single `read()` call.
pub const R_MAX: usize = 4096;

/// The command, arguments, environment, and working directory a caller
/// supplies when asking the Session Manager to create a new session. Opaque
/// to the rest of the subsystem beyond what is needed to spawn the child.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: PathBuf,
    pub resume_token: Option<String>,
}

impl SpawnSpec {
    pub fn new(command: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: cwd.into(),
            resume_token: None,
        }
    }
}

/// One of the signal kinds the Terminal Handler can forward to the child's
/// process group. `Eof` is not a real signal; it is delivered as the byte
/// `0x04` via `write`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Sigint,
    Sigterm,
}

struct PtyMaster {
    read_fd: OwnedFd,
    write_fd: OwnedFd,
}

impl PtyMaster {
    fn from_fd(master_fd: OwnedFd) -> Self {
        let master_fd_raw = master_fd.into_raw_fd();

        let read_fd_raw = unsafe { libc::dup(master_fd_raw) };
        if read_fd_raw < 0 {
            panic!(
                "failed to duplicate pty master fd for reading: {}",
                std::io::Error::last_os_error()
            );
        }
        let write_fd_raw = unsafe { libc::dup(master_fd_raw) };
        if write_fd_raw < 0 {
            unsafe {
                libc::close(read_fd_raw);
            }
            panic!(
                "failed to duplicate pty master fd for writing: {}",
                std::io::Error::last_os_error()
            );
        }
        unsafe {
            libc::close(master_fd_raw);
        }

        unsafe {
            PtyMaster {
                read_fd: OwnedFd::from_raw_fd(read_fd_raw),
                write_fd: OwnedFd::from_raw_fd(write_fd_raw),
            }
        }
    }
}

impl Read for PtyMaster {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        use std::os::unix::io::AsRawFd;
        let n = unsafe {
            libc::read(
                self.read_fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

impl Write for PtyMaster {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        use std::os::unix::io::AsRawFd;
        let n = unsafe {
            libc::write(
                self.write_fd.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// An open PTY pair with its forked child. Exclusively owned by the Session
/// that created it.
pub struct PtyDevice {
    child: Arc<Mutex<Option<Box<dyn Child + Send>>>>,
    master: Arc<Mutex<PtyMaster>>,
    controller: Arc<Mutex<Box<dyn MasterPty + Send>>>,
    child_pid: Option<u32>,
}

impl PtyDevice {
    /// Allocate a PTY pair and fork `spec.command` attached to the slave.
    pub fn spawn(spec: &SpawnSpec) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&spec.command);
        cmd.args(&spec.args);
        cmd.cwd(&spec.cwd);
        cmd.env("TERM", "xterm-256color");
        if let Ok(lang) = std::env::var("LANG") {
            cmd.env("LANG", lang);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
        let child_pid = child.process_id();

        drop(pair.slave);

        use std::os::unix::io::AsRawFd as _;
        let master_fd_raw = pair
            .master
            .as_raw_fd()
            .ok_or_else(|| PtyError::SpawnFailed("pty master has no raw fd".to_string()))?;
        let dup_fd = unsafe { libc::dup(master_fd_raw) };
        if dup_fd < 0 {
            return Err(PtyError::SpawnFailed(format!(
                "failed to duplicate pty master fd: {}",
                std::io::Error::last_os_error()
            )));
        }
        let master_fd = unsafe { OwnedFd::from_raw_fd(dup_fd) };
        let controller = pair.master;

        Ok(PtyDevice {
            child: Arc::new(Mutex::new(Some(child))),
            master: Arc::new(Mutex::new(PtyMaster::from_fd(master_fd))),
            controller: Arc::new(Mutex::new(controller)),
            child_pid,
        })
    }

    pub fn child_pid(&self) -> Option<u32> {
        self.child_pid
    }

    /// Read up to `R_MAX` bytes. Returns empty on EOF. Blocking reads are
    /// run on a blocking thread so the PTY never stalls the runtime.
    pub async fn read(&self) -> Result<Vec<u8>, PtyError> {
        let master = self.master.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; R_MAX];
            let mut master = master.blocking_lock();
            // EAGAIN on the non-blocking fd surfaces as WouldBlock, not a
            // hard error; the caller treats that as "no data yet".
            match std::io::Read::read(&mut *master, &mut buf) {
                Ok(n) => Ok(buf[..n].to_vec()),
                Err(e) => Err(e),
            }
        })
        .await
        .map_err(|e| PtyError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        match result {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(Vec::new()),
            Err(e) => Err(PtyError::Io(e)),
        }
    }

    /// Write all bytes, retrying on transient "would block".
    pub async fn write(&self, bytes: &[u8]) -> Result<(), PtyError> {
        let master = self.master.clone();
        let owned = bytes.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut master = master.blocking_lock();
            let mut written = 0usize;
            while written < owned.len() {
                match std::io::Write::write(&mut *master, &owned[written..]) {
                    Ok(0) => {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::WriteZero,
                            "pty write returned 0",
                        ))
                    }
                    Ok(n) => written += n,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::yield_now();
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        })
        .await
        .map_err(|e| PtyError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
        .map_err(PtyError::Io)
    }

    /// Issue the window-size ioctl. Dimensions are validated by the caller
    /// against the configured `resize_max_dim` before reaching here.
    pub async fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        if rows == 0 || cols == 0 {
            return Err(PtyError::InvalidResize { rows, cols });
        }
        let controller = self.controller.clone();
        tokio::task::spawn_blocking(move || {
            let controller = controller.blocking_lock();
            controller.resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
        })
        .await
        .map_err(|e| PtyError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
        .map_err(|e| PtyError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
    }

    /// Deliver a signal to the child's entire process group (the child is
    /// its own session and process group leader, so this reaches any
    /// grandchildren it has forked).
    #[cfg(unix)]
    pub fn signal(&self, kind: Signal) -> Result<(), PtyError> {
        let pid = self
            .child_pid
            .ok_or(PtyError::PtyClosed)?;
        let sig = match kind {
            Signal::Sigint => nix::sys::signal::Signal::SIGINT,
            Signal::Sigterm => nix::sys::signal::Signal::SIGTERM,
        };
        let pgid = nix::unistd::Pid::from_raw(pid as i32);
        match nix::sys::signal::killpg(pgid, sig) {
            Ok(()) => Ok(()),
            Err(nix::errno::Errno::ESRCH) => Err(PtyError::PtyClosed),
            Err(e) => Err(PtyError::Io(std::io::Error::from(e))),
        }
    }

    /// Wait for the child to be reaped, returning its exit code if known.
    pub async fn wait(&self) -> Result<Option<i32>, PtyError> {
        let child = self.child.clone();
        let status = tokio::task::spawn_blocking(move || {
            let mut guard = child.blocking_lock();
            if let Some(child) = guard.as_mut() {
                child.wait().map(Some)
            } else {
                Ok(None)
            }
        })
        .await
        .map_err(|e| PtyError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
        .map_err(PtyError::Io)?;

        Ok(status.and_then(|s| s.exit_code().try_into().ok()))
    }

    /// Terminate the child: SIGTERM, then SIGKILL after `grace` elapses if
    /// it hasn't exited, then release file descriptors. Idempotent.
    pub async fn close(&self, grace: std::time::Duration) {
        if let Some(pid) = self.child_pid {
            let pgid = nix::unistd::Pid::from_raw(pid as i32);
            let _ = nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGTERM);
        }

        let child = self.child.clone();
        let exited = tokio::time::timeout(grace, {
            let child = child.clone();
            async move {
                tokio::task::spawn_blocking(move || {
                    let mut guard = child.blocking_lock();
                    if let Some(c) = guard.as_mut() {
                        let _ = c.wait();
                    }
                })
                .await
            }
        })
        .await
        .is_ok();

        if !exited {
            warn!("child did not exit within grace period, sending SIGKILL");
            if let Some(pid) = self.child_pid {
                let pgid = nix::unistd::Pid::from_raw(pid as i32);
                let _ = nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGKILL);
            }
            let _ = tokio::task::spawn_blocking(move || {
                let mut guard = child.blocking_lock();
                if let Some(mut c) = guard.take() {
                    let _ = c.wait();
                }
            })
            .await;
        } else {
            let mut guard = self.child.lock().await;
            guard.take();
        }

        debug!("pty device closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn echo_spec() -> SpawnSpec {
        SpawnSpec::new("/bin/sh", std::env::temp_dir())
    }

    #[tokio::test]
    async fn spawn_and_write_read_round_trip() {
        let device = PtyDevice::spawn(&echo_spec()).expect("spawn");
        device.write(b"echo hello\n").await.expect("write");
        tokio::time::sleep(Duration::from_millis(200)).await;
        let out = device.read().await.expect("read");
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("hello"), "expected echo output, got {text:?}");
        device.close(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn resize_rejects_zero_dimension() {
        let device = PtyDevice::spawn(&echo_spec()).expect("spawn");
        let err = device.resize(0, 80).await.unwrap_err();
        assert!(matches!(err, PtyError::InvalidResize { .. }));
        device.close(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn resize_accepts_boundary_dimensions() {
        let device = PtyDevice::spawn(&echo_spec()).expect("spawn");
        device.resize(1, 1).await.expect("min dims");
        device.resize(500, 500).await.expect("max dims");
        device.close(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let device = PtyDevice::spawn(&echo_spec()).expect("spawn");
        device.close(Duration::from_secs(1)).await;
        device.close(Duration::from_secs(1)).await;
    }
}


