//! Tracks the process at the head of the shell's foreground process group
//! (Unix) or the topmost ConPTY-attached descendant (Windows), and reports
//! name/command-line/cwd changes. Generalized from this codebase's existing
//! `sysinfo`-based process tree walk into a continuously polling monitor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sysinfo::{Pid, System};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{FOREGROUND_POLL_INTERVAL, FOREGROUND_RELOOKUP_INTERVAL};
use crate::pty::Pty;

/// Snapshot of the process currently at the head of the shell's foreground
/// group, or the shell itself if nothing else is running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForegroundProcessInfo {
    pub pid: u32,
    pub name: String,
    pub command_line: Option<String>,
    pub cwd: Option<String>,
}

struct MonitorState {
    current: ForegroundProcessInfo,
    last_lookup: Instant,
}

/// Polls at ~200ms, re-resolving an unchanged foreground process no more
/// than once every 2s. Emits on the `watch` channel only when pid, name,
/// command line, or cwd differ from the previous snapshot.
pub struct ForegroundMonitor {
    state: Arc<Mutex<MonitorState>>,
    tx: watch::Sender<ForegroundProcessInfo>,
    rx: watch::Receiver<ForegroundProcessInfo>,
    stopped: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ForegroundMonitor {
    /// Begins polling the given shell's foreground group.
    pub fn start(shell_pid: u32, pty: Arc<dyn Pty>) -> Self {
        let initial = shell_snapshot(shell_pid);
        let (tx, rx) = watch::channel(initial.clone());
        let state = Arc::new(Mutex::new(MonitorState {
            current: initial,
            last_lookup: Instant::now(),
        }));
        let stopped = Arc::new(AtomicBool::new(false));

        let poll_state = state.clone();
        let poll_tx = tx.clone();
        let poll_stopped = stopped.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FOREGROUND_POLL_INTERVAL);
            loop {
                ticker.tick().await;
                if poll_stopped.load(Ordering::SeqCst) {
                    break;
                }
                let mut guard = poll_state.lock().unwrap();
                if guard.last_lookup.elapsed() < FOREGROUND_RELOOKUP_INTERVAL
                    && !guard.current.is_shell(shell_pid)
                {
                    // Rate-limit re-lookup of an unchanged foreground.
                    continue;
                }
                let snapshot = resolve_foreground(shell_pid, pty.as_ref());
                guard.last_lookup = Instant::now();
                if snapshot != guard.current {
                    guard.current = snapshot.clone();
                    let _ = poll_tx.send(snapshot);
                }
            }
        });

        Self {
            state,
            tx,
            rx,
            stopped,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Stops polling and releases any handles opened against target
    /// processes (there are none held open between polls in this
    /// implementation -- each tick re-queries the OS).
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
            let _ = handle.await;
        }
    }

    pub fn current(&self) -> ForegroundProcessInfo {
        self.state.lock().unwrap().current.clone()
    }

    /// Subscribes to `OnForegroundChanged` events.
    pub fn subscribe(&self) -> watch::Receiver<ForegroundProcessInfo> {
        self.rx.clone()
    }

    pub fn sender_clone(&self) -> watch::Sender<ForegroundProcessInfo> {
        self.tx.clone()
    }
}

impl ForegroundProcessInfo {
    fn is_shell(&self, shell_pid: u32) -> bool {
        self.pid == shell_pid
    }
}

fn shell_snapshot(shell_pid: u32) -> ForegroundProcessInfo {
    let mut sys = System::new();
    sys.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[Pid::from_u32(shell_pid)]), true);
    process_info(shell_pid, &sys).unwrap_or(ForegroundProcessInfo {
        pid: shell_pid,
        name: String::new(),
        command_line: None,
        cwd: None,
    })
}

fn process_info(pid: u32, sys: &System) -> Option<ForegroundProcessInfo> {
    let process = sys.process(Pid::from_u32(pid))?;
    let cmd: Vec<String> = process
        .cmd()
        .iter()
        .map(|s| s.to_string_lossy().to_string())
        .collect();
    Some(ForegroundProcessInfo {
        pid,
        name: process.name().to_string_lossy().to_string(),
        command_line: if cmd.is_empty() { None } else { Some(cmd.join(" ")) },
        cwd: process.cwd().map(|p| p.to_string_lossy().to_string()),
    })
}

/// Shell's own cwd, via `/proc/<pid>/cwd` on Unix or the process's cwd
/// field under `sysinfo` elsewhere. `None` if unavailable.
pub fn shell_cwd(shell_pid: u32) -> Option<String> {
    #[cfg(unix)]
    {
        std::fs::read_link(format!("/proc/{shell_pid}/cwd"))
            .ok()
            .map(|p| p.to_string_lossy().to_string())
    }
    #[cfg(not(unix))]
    {
        let mut sys = System::new();
        sys.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[Pid::from_u32(shell_pid)]), true);
        sys.process(Pid::from_u32(shell_pid))
            .and_then(|p| p.cwd())
            .map(|p| p.to_string_lossy().to_string())
    }
}

#[cfg(unix)]
fn resolve_foreground(shell_pid: u32, pty: &dyn Pty) -> ForegroundProcessInfo {
    let Some(fd) = pty.master_fd() else {
        return shell_snapshot(shell_pid);
    };
    // SAFETY: fd is the live PTY master owned by this session.
    let pgrp = unsafe { libc::tcgetpgrp(fd) };
    if pgrp <= 0 {
        return shell_snapshot(shell_pid);
    }

    let mut sys = System::new();
    sys.refresh_processes(sysinfo::ProcessesToUpdate::All, true);

    let candidates = processes_in_group(pgrp as u32);
    if candidates.is_empty() {
        return shell_snapshot(shell_pid);
    }

    // Tie-break: newest process (highest pid as a proxy for creation order).
    let chosen = candidates.into_iter().max().unwrap_or(shell_pid);
    if chosen == shell_pid {
        return shell_snapshot(shell_pid);
    }
    process_info(chosen, &sys).unwrap_or_else(|| shell_snapshot(shell_pid))
}

#[cfg(windows)]
fn resolve_foreground(shell_pid: u32, _pty: &dyn Pty) -> ForegroundProcessInfo {
    let mut sys = System::new();
    sys.refresh_processes(sysinfo::ProcessesToUpdate::All, true);

    // Walk the process tree from the shell pid, picking the leaf closest
    // to the ConPTY (deepest descendant chain).
    let mut children: std::collections::HashMap<u32, Vec<u32>> = std::collections::HashMap::new();
    for (pid, process) in sys.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent.as_u32()).or_default().push(pid.as_u32());
        }
    }

    let mut leaf = shell_pid;
    let mut cursor = shell_pid;
    loop {
        match children.get(&cursor).and_then(|c| c.iter().max()) {
            Some(&next) => {
                leaf = next;
                cursor = next;
            }
            None => break,
        }
    }

    if leaf == shell_pid {
        return shell_snapshot(shell_pid);
    }
    process_info(leaf, &sys).unwrap_or_else(|| shell_snapshot(shell_pid))
}

/// Lists pids whose process group id matches `pgrp`, via `/proc/<pid>/stat`
/// (field 5). `sysinfo` does not expose pgid directly.
#[cfg(target_os = "linux")]
fn processes_in_group(pgrp: u32) -> Vec<u32> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return out;
    };
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        if let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            // Fields after the ")" closing the comm name are space-separated;
            // pgrp is the 3rd field from there (state, ppid, pgrp).
            if let Some(idx) = stat.rfind(')') {
                let rest: Vec<&str> = stat[idx + 2..].split_whitespace().collect();
                if rest.len() > 2 {
                    if let Ok(p) = rest[2].parse::<u32>() {
                        if p == pgrp {
                            out.push(pid);
                        }
                    }
                }
            }
        }
    }
    out
}

#[cfg(all(unix, not(target_os = "linux")))]
fn processes_in_group(pgrp: u32) -> Vec<u32> {
    // No /proc on macOS/BSD; fall back to the pgrp leader itself.
    vec![pgrp]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_snapshot_falls_back_gracefully_for_unknown_pid() {
        let info = shell_snapshot(u32::MAX);
        assert_eq!(info.pid, u32::MAX);
    }
}
