// SPDX-License-Identifier: MIT OR Apache-2.0
//! The spawn executor: drives `posix_spawnp` for a launch request.

use crate::error::SpawnError;
use crate::handle::ProcessHandle;
use crate::helper::HelperInvocation;
use crate::plan::DescriptorPlan;
use crate::posix::{self, FileActions, ScopedThreadCwd, SpawnAttrs};
use crate::request::{LaunchRequest, SessionControl};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::ffi::CString;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStringExt;
use std::path::PathBuf;
use tracing::debug;

/// Spawns processes described by [`LaunchRequest`]s.
///
/// Stateless apart from the optional helper-program override, so a single
/// executor may serve many concurrent launches. Each spawn call runs on its
/// own dedicated OS thread: the working-directory workaround mutates
/// calling-thread state and must not migrate across a cooperative
/// scheduler's workers.
#[derive(Debug, Clone, Default)]
pub struct SpawnExecutor {
    helper_program: Option<PathBuf>,
}

impl SpawnExecutor {
    /// Create an executor with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the executable spawned as the helper image for
    /// controlling-terminal requests. Defaults to the current executable.
    pub fn with_helper_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.helper_program = Some(program.into());
        self
    }

    /// Launch the process described by `request`.
    ///
    /// Produces exactly one outcome per request: a [`ProcessHandle`] or an
    /// error. All `closeAfterStart` descriptors are released on every path;
    /// on failure the `closeAfterWait` set is released as well.
    pub async fn spawn(&self, request: &LaunchRequest) -> Result<ProcessHandle, SpawnError> {
        if request.path.is_empty() {
            return Err(SpawnError::EmptyPath);
        }
        if !request.mark_started() {
            return Err(SpawnError::AlreadyStarted);
        }

        let plan = DescriptorPlan::resolve(request)?;

        if let Some(token) = &request.cancel {
            if token.is_cancelled() {
                drop(plan);
                return Err(SpawnError::Cancelled);
            }
        }

        // Controlling-terminal requests detour through the helper image:
        // phase one only creates the session, the terminal takeover happens
        // inside the helper before it replaces itself with the target.
        let helper = matches!(
            request.session,
            SessionControl::NewSessionWithControllingTty(_)
        );
        let (target_path, target_args) =
            if let SessionControl::NewSessionWithControllingTty(tty) = request.session {
                posix::clear_cloexec(tty)?;
                let program = self.helper_program()?;
                let invocation =
                    HelperInvocation::new(tty, request.path.clone(), effective_args(request));
                (program.clone(), invocation.argv(&program))
            } else {
                (request.path.clone(), effective_args(request))
            };

        let path_c = CString::new(target_path.as_str())
            .map_err(|_| SpawnError::InvalidArgument("NUL byte in path".into()))?;
        let argv_c = to_cstrings(target_args.into_iter().map(String::into_bytes).collect())?;
        let envp_c = match &request.env {
            Some(entries) => to_cstrings(dedup_env(
                entries.iter().map(|e| e.clone().into_bytes()).collect(),
            ))?,
            None => inherited_env_cstrings()?,
        };

        let mut flags: libc::c_short = 0;
        if !matches!(request.session, SessionControl::None) {
            flags |= libc::POSIX_SPAWN_SETSID as libc::c_short;
        }
        let pgroup = request.process_group;
        if pgroup.is_some() {
            flags |= libc::POSIX_SPAWN_SETPGROUP as libc::c_short;
        }

        let (stdio, extras, close_after_start, parent) = plan.into_parts();
        let cwd = request.working_directory.clone();

        debug!(
            target: "pspawn.spawn",
            path = %target_path,
            helper,
            slots = 3 + extras.len(),
            cwd = ?cwd,
            "spawning"
        );

        let spawned = run_pinned("pspawn-spawn", move || {
            // Child-side descriptors stay open across the spawn call and are
            // released when this closure returns, success or not.
            let _start_scoped = close_after_start;

            let mut attrs = SpawnAttrs::new()?;
            attrs.set_flags(flags)?;
            if let Some(pg) = pgroup {
                attrs.set_pgroup(pg as libc::pid_t)?;
            }

            let mut actions = FileActions::new()?;
            if helper {
                // The helper inherits the outer caller's own stdio; the real
                // redirection to the terminal happens in phase two.
                for slot in 0..3 {
                    actions.add_dup2(slot, slot)?;
                }
            } else {
                for (slot, fd) in stdio.into_iter().enumerate() {
                    actions.add_dup2(fd, slot as RawFd)?;
                }
            }
            // Descriptors beyond the first three cross the boundary by
            // number, so they must not be close-on-exec.
            for fd in extras {
                posix::clear_cloexec(fd)?;
            }

            let _cwd_guard = match cwd {
                Some(dir) => {
                    Some(ScopedThreadCwd::enter(&dir).map_err(SpawnError::Directory)?)
                }
                None => None,
            };

            posix::spawnp(&path_c, &actions, &attrs, &argv_c, &envp_c)
        })
        .await?;

        let pid = match spawned {
            Ok(pid) => pid as i32,
            Err(err) => {
                // closeAfterWait descriptors go with the failure too.
                drop(parent);
                return Err(err);
            }
        };

        debug!(target: "pspawn.spawn", pid, "spawned");

        let cancel_watch = request.cancel.clone().map(|token| {
            tokio::spawn(async move {
                token.cancelled().await;
                // Advisory: the process may already be gone, and ESRCH on an
                // exited pid is exactly the race this is allowed to lose.
                let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
            })
        });

        Ok(ProcessHandle::new(pid, parent, cancel_watch))
    }

    fn helper_program(&self) -> Result<String, SpawnError> {
        let program = match &self.helper_program {
            Some(p) => p.clone(),
            None => std::env::current_exe().map_err(SpawnError::HelperProgram)?,
        };
        program
            .into_os_string()
            .into_string()
            .map_err(|_| SpawnError::InvalidArgument("non-UTF-8 helper program path".into()))
    }
}

/// `args[0]` is conventionally the program name; restate the path when the
/// caller left the vector empty.
fn effective_args(request: &LaunchRequest) -> Vec<String> {
    if request.args.is_empty() {
        vec![request.path.clone()]
    } else {
        request.args.clone()
    }
}

/// Collapse duplicate `KEY=value` entries, last occurrence wins, first-seen
/// order otherwise preserved.
pub(crate) fn dedup_env(entries: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
    fn key(entry: &[u8]) -> &[u8] {
        match entry.iter().position(|&b| b == b'=') {
            Some(i) => &entry[..i],
            None => entry,
        }
    }
    let mut out: Vec<Vec<u8>> = Vec::with_capacity(entries.len());
    for entry in entries {
        if let Some(slot) = out.iter_mut().find(|e| key(e) == key(&entry)) {
            *slot = entry;
        } else {
            out.push(entry);
        }
    }
    out
}

/// The caller's environment as `KEY=value` C strings, for requests that
/// leave `env` unset.
pub(crate) fn inherited_env_cstrings() -> Result<Vec<CString>, SpawnError> {
    let mut entries = Vec::new();
    for (key, value) in std::env::vars_os() {
        let mut entry = key.into_vec();
        entry.push(b'=');
        entry.extend(value.into_vec());
        entries.push(entry);
    }
    to_cstrings(entries)
}

fn to_cstrings(entries: Vec<Vec<u8>>) -> Result<Vec<CString>, SpawnError> {
    entries
        .into_iter()
        .map(|e| {
            CString::new(e).map_err(|_| {
                SpawnError::InvalidArgument("NUL byte in argument or environment entry".into())
            })
        })
        .collect()
}

/// Run `f` to completion on a dedicated OS thread, suspending only the
/// calling task. The closure owns thread-affine state (the cwd guard), so a
/// work-stealing pool is not an option here.
async fn run_pinned<T: Send + 'static>(
    name: &str,
    f: impl FnOnce() -> T + Send + 'static,
) -> Result<T, SpawnError> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let _ = tx.send(f());
        })
        .map_err(|e| SpawnError::Worker(e.to_string()))?;
    rx.await
        .map_err(|_| SpawnError::Worker("spawn thread exited without reporting".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(items: &[&str]) -> Vec<Vec<u8>> {
        items.iter().map(|s| s.as_bytes().to_vec()).collect()
    }

    #[test]
    fn dedup_env_last_wins_keeps_order() {
        let out = dedup_env(entries(&["A=1", "B=2", "A=3", "C=4"]));
        assert_eq!(out, entries(&["A=3", "B=2", "C=4"]));
    }

    #[test]
    fn dedup_env_distinguishes_prefix_keys() {
        let out = dedup_env(entries(&["PATH=/bin", "PATH2=/sbin", "PATH=/usr/bin"]));
        assert_eq!(out, entries(&["PATH=/usr/bin", "PATH2=/sbin"]));
    }

    #[test]
    fn effective_args_restates_path() {
        let req = LaunchRequest::new("/bin/true");
        assert_eq!(effective_args(&req), vec!["/bin/true".to_string()]);
        let req = LaunchRequest::new("/bin/echo").with_args(["echo", "hi"]);
        assert_eq!(
            effective_args(&req),
            vec!["echo".to_string(), "hi".to_string()]
        );
    }

    #[test]
    fn nul_bytes_are_rejected() {
        let err = to_cstrings(vec![b"A=\0B".to_vec()]).expect_err("NUL must fail");
        assert!(err.is_configuration());
    }

    #[test]
    fn inherited_env_is_nonempty() {
        // The test runner always has at least PATH or similar set.
        let env = inherited_env_cstrings().expect("env");
        assert!(!env.is_empty());
    }
}
