// SPDX-License-Identifier: MIT OR Apache-2.0
//! Error types for launch and spawn operations.

use nix::errno::Errno;
use std::fmt;
use thiserror::Error;

/// Identifies the sub-step of the spawn sequence that failed.
///
/// Every OS-level failure carries one of these so callers can tell a
/// configuration problem (attribute or file-action setup) apart from a
/// kernel-level refusal of the spawn call itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnStage {
    /// `posix_spawnattr_init`.
    AttrInit,
    /// `posix_spawnattr_setflags`.
    AttrSetFlags,
    /// `posix_spawnattr_setpgroup`.
    AttrSetPgroup,
    /// `posix_spawn_file_actions_init`.
    FileActionsInit,
    /// `posix_spawn_file_actions_adddup2`.
    FileActionsDup2,
    /// Clearing `FD_CLOEXEC` on a descriptor that must cross the spawn
    /// boundary by number.
    ClearCloexec,
    /// The thread-scoped working-directory switch.
    ThreadChdir,
    /// The `posix_spawnp` call itself.
    SpawnCall,
}

impl fmt::Display for SpawnStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AttrInit => "spawn attribute init",
            Self::AttrSetFlags => "spawn attribute flags",
            Self::AttrSetPgroup => "spawn attribute pgroup",
            Self::FileActionsInit => "file action init",
            Self::FileActionsDup2 => "file action dup2",
            Self::ClearCloexec => "clearing close-on-exec",
            Self::ThreadChdir => "thread-scoped chdir",
            Self::SpawnCall => "posix_spawnp",
        };
        f.write_str(s)
    }
}

/// Errors from building a launch request, resolving its descriptors, or
/// driving the OS spawn primitive.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The request's executable path is empty.
    #[error("launch request has an empty path")]
    EmptyPath,

    /// The request was already started once; a `LaunchRequest` is single-use.
    #[error("launch request was already started")]
    AlreadyStarted,

    /// An argument or environment entry contained an interior NUL byte.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The cancellation token fired before the spawn call was made.
    #[error("launch cancelled before the spawn call")]
    Cancelled,

    /// Opening a pipe or the null device failed while resolving descriptors.
    #[error("descriptor setup failed: {0}")]
    DescriptorSetup(#[source] std::io::Error),

    /// Switching the calling thread's working directory failed.
    #[error("working directory setup failed: {0}")]
    Directory(#[source] std::io::Error),

    /// An OS-level spawn sub-step failed.
    #[error("{stage} failed: {errno}")]
    Os {
        /// Which sub-step failed.
        stage: SpawnStage,
        /// The OS error code it reported.
        errno: Errno,
    },

    /// The helper executable path could not be determined.
    #[error("helper executable path unavailable: {0}")]
    HelperProgram(#[source] std::io::Error),

    /// Waiting for the process failed.
    #[error("failed to wait for pid {pid}: {errno}")]
    Wait {
        /// The process id being waited on.
        pid: i32,
        /// The OS error code.
        errno: Errno,
    },

    /// Signalling the process failed with something other than ESRCH.
    #[error("failed to signal pid {pid}: {errno}")]
    Kill {
        /// The process id being signalled.
        pid: i32,
        /// The OS error code.
        errno: Errno,
    },

    /// The dedicated spawn thread disappeared without reporting a result.
    #[error("spawn worker thread lost: {0}")]
    Worker(String),
}

impl SpawnError {
    /// True for errors rejected before touching the OS: these are caller
    /// mistakes and are never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::EmptyPath | Self::AlreadyStarted | Self::InvalidArgument(_)
        )
    }

    /// Shorthand for the OS-stage error constructor.
    pub(crate) fn os(stage: SpawnStage, errno: Errno) -> Self {
        Self::Os { stage, errno }
    }
}
