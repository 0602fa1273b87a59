// SPDX-License-Identifier: MIT OR Apache-2.0
//! Handle to a spawned process: wait, kill, retained pipe ends.

use crate::error::SpawnError;
use crate::plan::ParentEnds;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fs::File;
use tracing::debug;

/// How a process finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    /// Exit code, when the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal number, when it was killed by a signal.
    pub signal: Option<i32>,
}

impl ExitStatus {
    /// True when the process exited normally with code zero.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Handle to a process created by [`SpawnExecutor`](crate::SpawnExecutor).
///
/// Created the instant the OS spawn call succeeds. The pid is assigned once
/// and never changes. Parent-side pipe ends from
/// [`StdioSpec::Piped`](crate::StdioSpec::Piped) streams are surfaced here
/// and closed when the handle is dropped.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: i32,
    status: Option<ExitStatus>,
    /// Write end of the child's stdin, when stdin was piped.
    pub stdin_writer: Option<File>,
    /// Read end of the child's stdout, when stdout was piped.
    pub stdout_reader: Option<File>,
    /// Read end of the child's stderr, when stderr was piped.
    pub stderr_reader: Option<File>,
    cancel_watch: Option<tokio::task::JoinHandle<()>>,
}

impl ProcessHandle {
    pub(crate) fn new(
        pid: i32,
        parent: ParentEnds,
        cancel_watch: Option<tokio::task::JoinHandle<()>>,
    ) -> Self {
        Self {
            pid,
            status: None,
            stdin_writer: parent.stdin.map(File::from),
            stdout_reader: parent.stdout.map(File::from),
            stderr_reader: parent.stderr.map(File::from),
            cancel_watch,
        }
    }

    /// OS process id.
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Wait for the process to exit.
    ///
    /// Suspends only the calling task; the blocking `waitpid` runs off the
    /// async runtime's worker threads. Repeated calls after completion
    /// return the cached status.
    pub async fn wait(&mut self) -> Result<ExitStatus, SpawnError> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let pid = self.pid;
        let status = tokio::task::spawn_blocking(move || Self::blocking_wait(pid))
            .await
            .map_err(|e| SpawnError::Worker(e.to_string()))??;
        debug!(target: "pspawn.spawn", pid, ?status, "process exited");
        self.status = Some(status);
        // The advisory kill watcher has nothing left to do.
        if let Some(watch) = self.cancel_watch.take() {
            watch.abort();
        }
        Ok(status)
    }

    /// Send SIGKILL to the process.
    ///
    /// Killing an already-exited pid reports ESRCH, which is treated as
    /// success so cancellation races stay harmless.
    pub fn kill(&self) -> Result<(), SpawnError> {
        match kill(Pid::from_raw(self.pid), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(SpawnError::Kill {
                pid: self.pid,
                errno,
            }),
        }
    }

    fn blocking_wait(pid: i32) -> Result<ExitStatus, SpawnError> {
        loop {
            match waitpid(Pid::from_raw(pid), None) {
                Ok(WaitStatus::Exited(_, code)) => {
                    return Ok(ExitStatus {
                        code: Some(code),
                        signal: None,
                    });
                }
                Ok(WaitStatus::Signaled(_, sig, _)) => {
                    return Ok(ExitStatus {
                        code: None,
                        signal: Some(sig as i32),
                    });
                }
                // Stop/continue notifications are not requested, but tolerate
                // them and keep waiting for the exit.
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(SpawnError::Wait { pid, errno }),
            }
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if let Some(watch) = self.cancel_watch.take() {
            watch.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_status_success() {
        let ok = ExitStatus {
            code: Some(0),
            signal: None,
        };
        assert!(ok.success());
        let failed = ExitStatus {
            code: Some(2),
            signal: None,
        };
        assert!(!failed.success());
        let killed = ExitStatus {
            code: None,
            signal: Some(9),
        };
        assert!(!killed.success());
    }

    #[test]
    fn exit_status_serializes() {
        let status = ExitStatus {
            code: Some(0),
            signal: None,
        };
        let json = serde_json::to_string(&status).expect("serialize");
        assert!(json.contains("\"code\":0"));
        let back: ExitStatus = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, status);
    }
}
