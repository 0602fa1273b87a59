// SPDX-License-Identifier: MIT OR Apache-2.0
//! Launch request model: what to run and how its streams are wired.

use crate::CancelToken;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

/// How one of the child's standard streams is provided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioSpec {
    /// Connect the stream to the platform null device.
    Null,
    /// Connect the stream directly to an existing descriptor.
    ///
    /// The descriptor is borrowed: the caller keeps ownership and must keep
    /// it open until the spawn call returns.
    Inherit(RawFd),
    /// Create a pipe; the child gets one end, the parent end is surfaced on
    /// the resulting [`ProcessHandle`](crate::ProcessHandle).
    Piped,
}

/// Session and controlling-terminal placement for the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionControl {
    /// Stay in the caller's session.
    None,
    /// Create a new session for the child (`POSIX_SPAWN_SETSID`).
    NewSession,
    /// Create a new session and make the given terminal descriptor the
    /// child's controlling terminal. Requires the two-phase helper relaunch;
    /// see the crate docs.
    NewSessionWithControllingTty(RawFd),
}

/// Immutable description of a process to launch.
///
/// A request is single-use: the first call to
/// [`SpawnExecutor::spawn`](crate::SpawnExecutor::spawn) claims it, and every
/// later call fails with [`SpawnError::AlreadyStarted`](crate::SpawnError)
/// without touching the OS.
#[derive(Debug)]
pub struct LaunchRequest {
    /// Resolved executable path.
    pub path: String,
    /// Argument vector; `args[0]` is conventionally the program name. When
    /// empty, `path` is restated as `args[0]`.
    pub args: Vec<String>,
    /// Environment as `"KEY=value"` entries. `None` inherits the caller's
    /// environment. Duplicate keys: last entry wins.
    pub env: Option<Vec<String>>,
    /// Working directory for the child. `None` inherits the caller's cwd.
    pub working_directory: Option<PathBuf>,
    /// Standard input wiring.
    pub stdin: StdioSpec,
    /// Standard output wiring.
    pub stdout: StdioSpec,
    /// Standard error wiring.
    pub stderr: StdioSpec,
    /// Extra descriptors inherited by the child at their current numbers
    /// (close-on-exec is cleared before the spawn call). Borrowed from the
    /// caller, never closed by this crate.
    pub extra_descriptors: Vec<RawFd>,
    /// Session and controlling-terminal placement.
    pub session: SessionControl,
    /// Explicit process group for the child (`POSIX_SPAWN_SETPGROUP`).
    /// Combinable with [`SessionControl::NewSession`].
    pub process_group: Option<i32>,
    /// Optional cancellation token.
    pub cancel: Option<CancelToken>,
    started: AtomicBool,
}

impl LaunchRequest {
    /// Create a request for the given executable with null stdio and no
    /// arguments beyond the conventional `args[0]`.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            args: Vec::new(),
            env: None,
            working_directory: None,
            stdin: StdioSpec::Null,
            stdout: StdioSpec::Null,
            stderr: StdioSpec::Null,
            extra_descriptors: Vec::new(),
            session: SessionControl::None,
            process_group: None,
            cancel: None,
            started: AtomicBool::new(false),
        }
    }

    /// Replace the argument vector.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the working directory.
    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    /// Attach a cancellation token.
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token.clone());
        self
    }

    /// Whether the request has been claimed by a spawn attempt.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Atomically claim the request. Returns `false` if it was already
    /// claimed; the caller must then refuse to launch.
    pub(crate) fn mark_started(&self) -> bool {
        !self.started.swap(true, Ordering::SeqCst)
    }
}
