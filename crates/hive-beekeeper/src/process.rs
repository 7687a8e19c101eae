//! Supervision of a spawned Beekeeper process.

use crate::error::Result;
use crate::settings::BeekeeperSettings;
use hive_harness::{wait_for, FatalErrorRelay};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

/// File receiving the process stdout, inside the working directory.
pub const STDOUT_LOG: &str = "stdout.log";

/// File receiving the process stderr, inside the working directory.
pub const STDERR_LOG: &str = "stderr.log";

/// Interval at which the exit watcher checks the process.
const WATCH_INTERVAL: Duration = Duration::from_millis(100);

/// Time a terminated process gets to close its sessions before it is killed.
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Time allowed for a killed process to be reaped.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// A running Beekeeper executable with its output captured to files.
#[derive(Debug)]
pub struct BeekeeperProcess {
    name: String,
    pid: u32,
    child: Arc<Mutex<Child>>,
    working_directory: PathBuf,
    stopping: Arc<AtomicBool>,
    watcher: Option<JoinHandle<()>>,
    terminate_timeout: Duration,
}

impl BeekeeperProcess {
    /// Start the executable described by `settings`.
    ///
    /// Creates the working and wallet directories and redirects stdout and
    /// stderr to [`STDOUT_LOG`] and [`STDERR_LOG`].
    pub fn spawn(settings: &BeekeeperSettings) -> Result<Self> {
        std::fs::create_dir_all(&settings.working_directory)?;
        std::fs::create_dir_all(settings.wallet_directory())?;
        let stdout = File::create(settings.working_directory.join(STDOUT_LOG))?;
        let stderr = File::create(settings.working_directory.join(STDERR_LOG))?;

        let args = settings.to_args();
        tracing::debug!(
            name = %settings.name,
            binary = %settings.binary_path.display(),
            ?args,
            "Spawning beekeeper"
        );
        let child = Command::new(&settings.binary_path)
            .args(&args)
            .current_dir(&settings.working_directory)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()?;
        let pid = child.id();
        tracing::info!(name = %settings.name, pid, "Beekeeper process started");

        Ok(Self {
            name: settings.name.clone(),
            pid,
            child: Arc::new(Mutex::new(child)),
            working_directory: settings.working_directory.clone(),
            stopping: Arc::new(AtomicBool::new(false)),
            watcher: None,
            terminate_timeout: TERMINATE_TIMEOUT,
        })
    }

    /// OS process id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Directory holding the output logs.
    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    /// Path of the captured stderr.
    pub fn stderr_path(&self) -> PathBuf {
        self.working_directory.join(STDERR_LOG)
    }

    /// Path of the captured stdout.
    pub fn stdout_path(&self) -> PathBuf {
        self.working_directory.join(STDOUT_LOG)
    }

    /// Exit status, if the process has exited.
    pub fn exit_status(&self) -> Result<Option<ExitStatus>> {
        Ok(self.lock_child().try_wait()?)
    }

    /// Whether the process is still running.
    pub fn is_running(&self) -> bool {
        matches!(self.exit_status(), Ok(None))
    }

    /// Whether the captured stderr contains `pattern`.
    pub fn stderr_contains(&self, pattern: &str) -> Result<bool> {
        match std::fs::read_to_string(self.stderr_path()) {
            Ok(content) => Ok(content.contains(pattern)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Last `lines` lines of the captured stderr.
    pub fn stderr_tail(&self, lines: usize) -> String {
        let content = std::fs::read_to_string(self.stderr_path()).unwrap_or_default();
        let all: Vec<&str> = content.lines().collect();
        all[all.len().saturating_sub(lines)..].join("\n")
    }

    /// Relay an exit that was not requested through [`stop`](Self::stop)
    /// to `relay`'s receiving thread.
    pub fn watch_exit(&mut self, relay: &'static FatalErrorRelay) -> Result<()> {
        if self.watcher.is_some() {
            return Ok(());
        }
        if !relay.is_initialized() {
            tracing::debug!(name = %self.name, "Fatal error relay not initialized, exit not watched");
            return Ok(());
        }
        let child = Arc::clone(&self.child);
        let stopping = Arc::clone(&self.stopping);
        let name = self.name.clone();
        let pid = self.pid;

        let watcher = relay.spawn_worker(format!("{name}-watcher"), move || {
            let mut status = None;
            wait_for(
                "beekeeper exit",
                || {
                    if stopping.load(Ordering::SeqCst) {
                        return true;
                    }
                    status = child
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .try_wait()
                        .ok()
                        .flatten();
                    status.is_some()
                },
                None,
                WATCH_INTERVAL,
            )?;
            match status {
                Some(status) if !stopping.load(Ordering::SeqCst) => {
                    tracing::error!(name = %name, pid, %status, "Beekeeper exited unexpectedly");
                    Err(format!("{name} (pid {pid}) exited unexpectedly with {status}").into())
                }
                _ => Ok(()),
            }
        })?;
        self.watcher = Some(watcher);
        Ok(())
    }

    /// Block until the process exits or `timeout` passes.
    pub fn wait_for_exit(&self, timeout: Duration) -> Result<ExitStatus> {
        let mut status = None;
        wait_for(
            &format!("{} exit", self.name),
            || {
                status = self.lock_child().try_wait().ok().flatten();
                status.is_some()
            },
            Some(timeout),
            WATCH_INTERVAL,
        )?;
        status.ok_or_else(|| std::io::Error::other("exit status vanished").into())
    }

    /// Stop the process if it is still running and reap it.
    ///
    /// SIGTERM comes first so the service can force-close its wallets and
    /// notify the sessions; SIGKILL follows if it has not exited in time.
    /// Blocks the calling thread until the process is gone.
    pub fn stop(&mut self) -> Result<()> {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.lock_child().try_wait()?.is_none() {
            let terminated = self.terminate()
                && match self.wait_for_exit(self.terminate_timeout) {
                    Ok(_) => true,
                    Err(e) => {
                        tracing::warn!(name = %self.name, pid = self.pid, error = %e, "Beekeeper ignored SIGTERM");
                        false
                    }
                };
            if !terminated {
                let mut child = self.lock_child();
                if child.try_wait()?.is_none() {
                    tracing::debug!(name = %self.name, pid = self.pid, "Killing beekeeper");
                    child.kill()?;
                }
            }
        }
        let status = self.wait_for_exit(STOP_TIMEOUT)?;
        if let Some(watcher) = self.watcher.take() {
            let _ = watcher.join();
        }
        tracing::info!(name = %self.name, pid = self.pid, %status, "Beekeeper process stopped");
        Ok(())
    }

    /// Send SIGTERM. False when the signal could not be delivered.
    #[cfg(unix)]
    fn terminate(&self) -> bool {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        let Ok(pid) = i32::try_from(self.pid) else {
            return false;
        };
        match signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) => {
                tracing::debug!(name = %self.name, pid, "Sent SIGTERM to beekeeper");
                true
            }
            Err(nix::errno::Errno::ESRCH) => true,
            Err(e) => {
                tracing::warn!(name = %self.name, pid, error = %e, "Failed to send SIGTERM");
                false
            }
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self) -> bool {
        false
    }

    fn lock_child(&self) -> std::sync::MutexGuard<'_, Child> {
        self.child.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for BeekeeperProcess {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::error!(name = %self.name, pid = self.pid, error = %e, "Failed to stop beekeeper");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    /// Settings running `body` as the "beekeeper" executable.
    fn script(dir: &Path, body: &str) -> BeekeeperSettings {
        let path = dir.join("fake-beekeeper.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        BeekeeperSettings::builder()
            .name("FakeBeekeeper")
            .binary(path)
            .working_directory(dir.join("work"))
            .build()
    }

    /// Spawn, retrying while another test thread still holds the freshly
    /// written script open (ETXTBSY).
    fn spawn(settings: &BeekeeperSettings) -> BeekeeperProcess {
        for _ in 0..20 {
            match BeekeeperProcess::spawn(settings) {
                Err(crate::BeekeeperError::Io(e)) if e.raw_os_error() == Some(26) => {
                    std::thread::sleep(Duration::from_millis(20));
                }
                other => return other.unwrap(),
            }
        }
        panic!("script stayed busy");
    }

    #[test]
    fn test_stderr_is_captured() {
        let dir = tempfile::tempdir().unwrap();
        let mut process = spawn(&script(
            dir.path(),
            "echo starting >&2\necho ready >&2\nsleep 30",
        ));

        wait_for(
            "ready on stderr",
            || process.stderr_contains("ready").unwrap(),
            Some(Duration::from_secs(5)),
            Duration::from_millis(20),
        )
        .unwrap();
        assert!(process.is_running());
        assert_eq!(process.stderr_tail(1), "ready");
        assert_eq!(process.stderr_tail(5), "starting\nready");

        process.stop().unwrap();
        assert!(!process.is_running());
    }

    #[test]
    fn test_exit_status_reported() {
        let dir = tempfile::tempdir().unwrap();
        let process = spawn(&script(dir.path(), "exit 3"));
        let status = process.wait_for_exit(Duration::from_secs(5)).unwrap();
        assert_eq!(status.code(), Some(3));
        assert!(process.stdout_path().is_file());
    }

    fn wait_ready(process: &BeekeeperProcess) {
        wait_for(
            "ready on stderr",
            || process.stderr_contains("ready").unwrap(),
            Some(Duration::from_secs(5)),
            Duration::from_millis(20),
        )
        .unwrap();
    }

    #[test]
    fn test_stop_terminates_gracefully() {
        let dir = tempfile::tempdir().unwrap();
        let mut process = spawn(&script(
            dir.path(),
            "trap 'echo terminated >&2; exit 0' TERM\necho ready >&2\nwhile true; do sleep 0.1; done",
        ));
        wait_ready(&process);

        process.stop().unwrap();
        assert!(!process.is_running());
        assert!(process.stderr_contains("terminated").unwrap());
    }

    #[test]
    fn test_stop_kills_when_sigterm_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut process = spawn(&script(
            dir.path(),
            "trap '' TERM\necho ready >&2\nwhile true; do sleep 0.1; done",
        ));
        process.terminate_timeout = Duration::from_millis(300);
        wait_ready(&process);

        process.stop().unwrap();
        assert!(!process.is_running());
    }

    #[test]
    fn test_unexpected_exit_is_relayed() {
        let relay: &'static FatalErrorRelay = Box::leak(Box::new(FatalErrorRelay::new()));
        relay.initialize();
        let dir = tempfile::tempdir().unwrap();
        let mut process = spawn(&script(dir.path(), "sleep 0.2\nexit 4"));
        process.watch_exit(relay).unwrap();

        let relayed = relay.wait(Duration::from_secs(5)).expect("exit is relayed");
        assert_eq!(relayed.thread, "FakeBeekeeper-watcher");
        let message = relayed.source.to_string();
        assert!(message.contains("FakeBeekeeper"), "{message}");
        assert!(message.contains("exited unexpectedly"), "{message}");
        process.stop().unwrap();
    }

    #[test]
    fn test_requested_stop_is_not_relayed() {
        let relay: &'static FatalErrorRelay = Box::leak(Box::new(FatalErrorRelay::new()));
        relay.initialize();
        let dir = tempfile::tempdir().unwrap();
        let mut process = spawn(&script(dir.path(), "echo ready >&2\nsleep 30"));
        process.watch_exit(relay).unwrap();
        wait_ready(&process);

        process.stop().unwrap();
        assert!(relay.wait(Duration::from_millis(300)).is_none());
    }

    #[test]
    fn test_missing_binary_fails_to_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let settings = BeekeeperSettings::builder()
            .binary(dir.path().join("does-not-exist"))
            .working_directory(dir.path())
            .build();
        assert!(matches!(
            BeekeeperProcess::spawn(&settings),
            Err(crate::BeekeeperError::Io(_))
        ));
    }
}
