// SPDX-License-Identifier: MIT OR Apache-2.0
//! Process launching on top of `posix_spawn` instead of fork/exec.
//!
//! The spawn primitive avoids duplicating the parent's address space but is
//! narrower than fork/exec, so two gaps are bridged here:
//!
//! - **Working directory.** `posix_spawn` has no per-call cwd. Each spawn
//!   runs on a dedicated OS thread whose working directory is switched in a
//!   thread-scoped way and restored afterwards, so concurrent launches with
//!   different directories never race.
//! - **Controlling terminal.** Spawn attributes can create a new session but
//!   cannot assign a controlling terminal. Requests that need one relaunch
//!   this program's own executable in a hidden helper mode which performs
//!   the assignment and then replaces itself with the real target (see
//!   [`helper`]).
//!
//! The entry points are [`LaunchRequest`] (what to run), [`SpawnExecutor`]
//! (run it), and [`ProcessHandle`] (wait, kill, piped streams).
//!
//! ```no_run
//! use pspawn_core::{LaunchRequest, SpawnExecutor, StdioSpec};
//!
//! # async fn demo() -> Result<(), pspawn_core::SpawnError> {
//! let mut request = LaunchRequest::new("/bin/echo").with_args(["echo", "hello"]);
//! request.stdout = StdioSpec::Piped;
//! let mut handle = SpawnExecutor::new().spawn(&request).await?;
//! let status = handle.wait().await?;
//! assert!(status.success());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod cancel;
mod error;
mod executor;
mod handle;
pub mod helper;
mod plan;
mod posix;
mod request;

pub use cancel::CancelToken;
pub use error::{SpawnError, SpawnStage};
pub use executor::SpawnExecutor;
pub use handle::{ExitStatus, ProcessHandle};
pub use helper::{HELPER_MODE, HelperError, HelperInvocation, LaunchMode, run_phase_two};
pub use plan::{DescriptorPlan, ParentEnds};
pub use request::{LaunchRequest, SessionControl, StdioSpec};
