// Single-instance enforcement, PID/lock file management, and signal-driven
// shutdown (spec.md §4.14). Grounded on
// `original_source/ccbt/daemon/daemon_manager.py`'s `DaemonManager`:
// advisory file lock (here `fs2::FileExt` in place of `fcntl.flock`/
// Windows "create exclusively"), stale-PID reclaim via `sysinfo`, atomic
// PID-file write (temp + rename), SIGINT/SIGTERM/SIGHUP -> one shutdown
// event, shared by every task via `tokio::sync::watch` the way
// `nat::NatHandle` shares its latest-value state.
use std::{
    fs,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
    sync::Arc,
};

use fs2::FileExt;
use sysinfo::{Pid, System};
use tokio::sync::watch;

use crate::error::{DaemonError, Result};

pub struct Supervisor {
    pid_file: PathBuf,
    lock_file: PathBuf,
    lock_handle: fs::File,
    shutdown_requested: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
}

impl Supervisor {
    // Acquires the exclusive lock and reclaims a stale PID file if the
    // process that wrote it is no longer running, then returns a
    // supervisor ready to have `write_pid_file` called on it once the IPC
    // server is confirmed accepting connections.
    pub fn acquire(state_dir: &Path, pid_file: &Path, lock_file: &Path) -> Result<Self> {
        fs::create_dir_all(state_dir)?;

        if let Some(existing_pid) = read_pid(pid_file) {
            if process_is_running(existing_pid) {
                return Err(DaemonError::AlreadyRunning(existing_pid));
            }
            tracing::info!("reclaiming stale pid file for dead process {existing_pid}");
            let _ = fs::remove_file(pid_file);
        }

        let lock_handle = fs::OpenOptions::new().create(true).write(true).open(lock_file)?;
        lock_handle.try_lock_exclusive().map_err(|_| DaemonError::AlreadyRunning(0))?;

        let (shutdown_tx, _rx) = watch::channel(false);
        Ok(Self {
            pid_file: pid_file.to_path_buf(),
            lock_file: lock_file.to_path_buf(),
            lock_handle,
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        })
    }

    // Atomically (temp + rename) writes this process's PID. Callers
    // should only do this once the IPC server is confirmed live, per
    // spec.md §4.14 step 2.
    pub fn write_pid_file(&self) -> Result<()> {
        let pid = std::process::id();
        let temp_file = self.pid_file.with_extension("tmp");
        fs::write(&temp_file, pid.to_string())?;
        fs::rename(&temp_file, &self.pid_file)?;
        tracing::info!("wrote pid file {} (pid {pid})", self.pid_file.display());
        Ok(())
    }

    // A receiver that flips to `true` once a shutdown signal has been
    // observed; cheaply cloned and handed to every long-running task.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    // True once a shutdown signal has fired; propagation/cancellation
    // errors should be demoted to debug logs while this holds, per
    // spec.md §5's log-storm note.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
    }

    // Lets other tasks (the IPC server's `/shutdown` handler) trigger the
    // same shutdown path a signal would.
    pub fn trigger_shutdown(&self) {
        self.request_shutdown();
    }

    // Waits for SIGINT, or (non-Windows) SIGTERM/SIGHUP, then flips the
    // shutdown flag. Runs until the process is asked to stop; spawn as a
    // background task.
    pub async fn watch_signals(self: &Arc<Self>) {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
            let mut sighup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT"),
                _ = sigterm.recv() => tracing::info!("received SIGTERM"),
                _ = sighup.recv() => tracing::info!("received SIGHUP"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("received ctrl-c");
        }

        self.request_shutdown();
    }

    // Releases the lock and removes the PID file; called on a clean stop.
    pub fn release(&self) {
        let _ = fs2::FileExt::unlock(&self.lock_handle);
        let _ = fs::remove_file(&self.lock_file);
        let _ = fs::remove_file(&self.pid_file);
    }
}

fn read_pid(pid_file: &Path) -> Option<u32> {
    let text = fs::read_to_string(pid_file).ok()?;
    text.trim().parse().ok()
}

fn process_is_running(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_processes();
    system.process(Pid::from_u32(pid)).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_second_acquire_fails() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("daemon.pid");
        let lock_file = dir.path().join("daemon.lock");

        let first = Supervisor::acquire(dir.path(), &pid_file, &lock_file).unwrap();
        let second = Supervisor::acquire(dir.path(), &pid_file, &lock_file);
        assert!(second.is_err());
        first.release();
    }

    #[test]
    fn write_pid_file_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("daemon.pid");
        let lock_file = dir.path().join("daemon.lock");

        let supervisor = Supervisor::acquire(dir.path(), &pid_file, &lock_file).unwrap();
        supervisor.write_pid_file().unwrap();
        assert_eq!(read_pid(&pid_file), Some(std::process::id()));
        supervisor.release();
    }

    #[test]
    fn stale_pid_file_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("daemon.pid");
        let lock_file = dir.path().join("daemon.lock");
        fs::write(&pid_file, "999999999").unwrap();

        let supervisor = Supervisor::acquire(dir.path(), &pid_file, &lock_file);
        assert!(supervisor.is_ok());
        supervisor.unwrap().release();
    }
}
