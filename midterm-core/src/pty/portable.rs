use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Mutex;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};

use super::{Pty, PtyConfig};
use crate::error::{CoreError, PtyErrorKind};

/// A `Pty` built on `portable-pty`. Spawns the child attached to the slave,
/// keeps the master and the writer half alive for the Session's lifetime,
/// and performs a fixed dispose sequence: kill the child, wait
/// briefly, then drop the streams before the master, so the kernel-buffered
/// slave-side data has a chance to flush before the fd closes.
pub struct PortablePty {
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    pid: u32,
    #[cfg(unix)]
    pgid: i32,
    killed: AtomicBool,
    exit_code: AtomicI32,
    has_exit_code: AtomicBool,
}

// SAFETY: all interior state is behind `Mutex`/atomics; `portable-pty`'s
// trait objects are `Send` but not necessarily `Sync`, which this wrapper
// restores by only ever touching them through a lock.
unsafe impl Sync for PortablePty {}

impl PortablePty {
    pub fn spawn(config: &PtyConfig) -> Result<Self, CoreError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: config.rows,
                cols: config.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| CoreError::pty(PtyErrorKind::OpenPt, e.to_string()))?;

        let mut cmd = CommandBuilder::new(&config.shell_cmd);
        cmd.args(&config.args);
        if let Some(cwd) = &config.cwd {
            cmd.cwd(cwd);
        }
        for (k, v) in &config.env {
            cmd.env(k, v);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| CoreError::pty(PtyErrorKind::Spawn, e.to_string()))?;
        let pid = child.process_id().unwrap_or(0);

        #[cfg(unix)]
        let pgid = pair
            .master
            .process_group_leader()
            .unwrap_or(pid as i32);

        // Drop the slave end in the parent; the child holds its own copy.
        drop(pair.slave);

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| CoreError::pty(PtyErrorKind::OpenPt, e.to_string()))?;

        Ok(Self {
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            child: Mutex::new(child),
            pid,
            #[cfg(unix)]
            pgid,
            killed: AtomicBool::new(false),
            exit_code: AtomicI32::new(0),
            has_exit_code: AtomicBool::new(false),
        })
    }

    fn record_exit(&self, code: i32) {
        self.exit_code.store(code, Ordering::SeqCst);
        self.has_exit_code.store(true, Ordering::SeqCst);
    }
}

impl Pty for PortablePty {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn take_reader(&self) -> Result<Box<dyn Read + Send>, CoreError> {
        self.master
            .lock()
            .unwrap()
            .try_clone_reader()
            .map_err(|e| CoreError::pty(PtyErrorKind::OpenPt, e.to_string()))
    }

    fn write_all(&self, data: &[u8]) -> Result<(), CoreError> {
        let mut writer = self.writer.lock().unwrap();
        writer
            .write_all(data)
            .and_then(|_| writer.flush())
            .map_err(|e| CoreError::pty(PtyErrorKind::Ioctl, e.to_string()))
    }

    fn resize(&self, cols: u16, rows: u16) {
        if let Ok(master) = self.master.lock() {
            let _ = master.resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            });
        }
    }

    fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.signal_term();
    }

    fn force_kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        self.signal_kill();
    }

    fn is_alive(&self) -> bool {
        self.is_alive_impl()
    }

    fn try_wait(&self) -> Option<i32> {
        if self.has_exit_code.load(Ordering::SeqCst) {
            return Some(self.exit_code.load(Ordering::SeqCst));
        }
        let mut child = self.child.lock().unwrap();
        match child.try_wait() {
            Ok(Some(status)) => {
                let code = status.exit_code() as i32;
                self.record_exit(code);
                Some(code)
            }
            _ => None,
        }
    }

    fn wait_blocking(&self) -> Option<i32> {
        if self.has_exit_code.load(Ordering::SeqCst) {
            return Some(self.exit_code.load(Ordering::SeqCst));
        }
        let mut child = self.child.lock().unwrap();
        match child.wait() {
            Ok(status) => {
                let code = status.exit_code() as i32;
                self.record_exit(code);
                Some(code)
            }
            Err(e) => {
                log::warn!("pty {}: wait failed: {e}", self.pid);
                None
            }
        }
    }

    #[cfg(unix)]
    fn master_fd(&self) -> Option<i32> {
        use portable_pty::unix::MasterPtyExt;
        self.master.lock().ok().and_then(|m| m.as_raw_fd())
    }

    #[cfg(windows)]
    fn master_fd(&self) -> Option<i32> {
        None
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl PortablePty {
    #[cfg(unix)]
    fn signal_term(&self) {
        // SAFETY: pgid is the process group leader captured at spawn time;
        // kill(2) on a negative pid targets the whole group.
        unsafe {
            libc::kill(-self.pgid, libc::SIGTERM);
        }
    }

    #[cfg(windows)]
    fn signal_term(&self) {
        let mut child = self.child.lock().unwrap();
        let _ = child.kill();
    }

    #[cfg(unix)]
    fn signal_kill(&self) {
        unsafe {
            libc::kill(-self.pgid, libc::SIGKILL);
        }
    }

    #[cfg(windows)]
    fn signal_kill(&self) {
        let mut child = self.child.lock().unwrap();
        let _ = child.kill();
    }

    #[cfg(unix)]
    fn is_alive_impl(&self) -> bool {
        unsafe { libc::kill(self.pid as i32, 0) == 0 }
    }

    #[cfg(windows)]
    fn is_alive_impl(&self) -> bool {
        !self.has_exit_code.load(Ordering::SeqCst) && self.try_wait().is_none()
    }

    /// Ordered teardown: kill, wait up to 1s (escalating
    /// to SIGKILL), then let `Drop` release the streams and master. Errors
    /// here are logged at `warn`/`trace` and never propagated -- disposal
    /// must never fail.
    pub async fn dispose(&self, grace: std::time::Duration) {
        self.kill();
        let alive_after_grace = tokio::time::timeout(grace, async {
            while self.is_alive_impl() {
                tokio::time::sleep(std::time::Duration::from_millis(25)).await;
            }
        })
        .await
        .is_err();

        if alive_after_grace {
            log::trace!("pty {}: still alive after grace period, sending kill", self.pid);
            self.signal_kill();
        }
    }
}

impl Drop for PortablePty {
    fn drop(&mut self) {
        if !self.killed.load(Ordering::SeqCst) {
            self.kill();
        }
    }
}
