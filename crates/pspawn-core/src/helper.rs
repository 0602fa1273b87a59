// SPDX-License-Identifier: MIT OR Apache-2.0
//! Two-phase relaunch protocol for controlling-terminal assignment.
//!
//! A controlling terminal can only be assigned by a process that is already
//! its own session leader, and the spawn attributes cannot request both the
//! session transition and the terminal assignment in one step. So when a
//! request asks for [`NewSessionWithControllingTty`], phase one spawns this
//! program's own executable in a hidden helper mode (session creation is
//! safe as a spawn attribute), and phase two — inside the helper image —
//! verifies the terminal descriptor, assigns it to the new session, and
//! replaces itself with the real target.
//!
//! The argument vector is the only channel between the phases:
//! `[self_exe, "spawn-helper", tty_fd, path, args...]`. Phase-two failures
//! cannot be reported back to the original caller (it already holds the
//! helper's pid); they surface as a logged fatal exit of that pid.
//!
//! [`NewSessionWithControllingTty`]: crate::SessionControl::NewSessionWithControllingTty

use crate::posix;
use nix::errno::Errno;
use std::ffi::CString;
use std::os::fd::RawFd;
use thiserror::Error;
use tracing::{debug, warn};

/// The hidden argv\[1\] marker selecting helper mode.
pub const HELPER_MODE: &str = "spawn-helper";

/// Errors from the helper side of the relaunch protocol.
#[derive(Debug, Error)]
pub enum HelperError {
    /// The helper argv did not match the expected shape.
    #[error("malformed helper invocation: {0}")]
    Invocation(String),

    /// The named descriptor is not usable as a terminal.
    #[error("terminal descriptor {fd} is not usable: {errno}")]
    InvalidTty {
        /// The descriptor number passed to the helper.
        fd: RawFd,
        /// The OS error it produced.
        errno: Errno,
    },

    /// Replacing the helper image with the target program failed. There is
    /// no parent to report to; the helper exits fatally.
    #[error("replacing the helper image failed: {errno}")]
    ExecFailed {
        /// The OS error code.
        errno: Errno,
    },
}

/// The synthesized first-phase target: which terminal to take over and what
/// to finally exec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperInvocation {
    /// Descriptor number of the terminal, valid in the helper process.
    pub tty_fd: RawFd,
    /// The real executable to end up running.
    pub path: String,
    /// The real argument vector (`args[0]` is the program name).
    pub args: Vec<String>,
}

impl HelperInvocation {
    /// Build an invocation for the given terminal and target.
    pub fn new(tty_fd: RawFd, path: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            tty_fd,
            path: path.into(),
            args,
        }
    }

    /// Render the full phase-one argument vector.
    pub fn argv(&self, helper_program: &str) -> Vec<String> {
        let mut argv = Vec::with_capacity(4 + self.args.len());
        argv.push(helper_program.to_string());
        argv.push(HELPER_MODE.to_string());
        argv.push(self.tty_fd.to_string());
        argv.push(self.path.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }

    /// Parse a full process argv previously produced by [`argv`](Self::argv).
    pub fn parse(argv: &[String]) -> Result<Self, HelperError> {
        if argv.get(1).map(String::as_str) != Some(HELPER_MODE) {
            return Err(HelperError::Invocation(format!(
                "argv[1] is not {HELPER_MODE:?}"
            )));
        }
        let fd_arg = argv
            .get(2)
            .ok_or_else(|| HelperError::Invocation("missing tty descriptor".into()))?;
        let tty_fd: RawFd = fd_arg
            .parse()
            .map_err(|_| HelperError::Invocation(format!("invalid tty descriptor {fd_arg:?}")))?;
        let path = argv
            .get(3)
            .cloned()
            .ok_or_else(|| HelperError::Invocation("missing target path".into()))?;
        Ok(Self {
            tty_fd,
            path,
            args: argv[4..].to_vec(),
        })
    }

    fn exec_argv(&self) -> Result<(CString, Vec<CString>), HelperError> {
        let path = CString::new(self.path.as_str())
            .map_err(|_| HelperError::Invocation("NUL in target path".into()))?;
        let args = if self.args.is_empty() {
            std::slice::from_ref(&self.path)
        } else {
            self.args.as_slice()
        };
        let argv = args
            .iter()
            .map(|a| CString::new(a.as_str()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| HelperError::Invocation("NUL in target argument".into()))?;
        Ok((path, argv))
    }
}

/// How this process was entered.
#[derive(Debug)]
pub enum LaunchMode {
    /// Normal invocation; proceed to the public surface.
    Direct,
    /// The hidden helper entry point with a parsed invocation.
    HelperPhase2(HelperInvocation),
}

impl LaunchMode {
    /// Classify a process argv. Anything not carrying the helper marker is
    /// a direct launch; a malformed helper argv is an error.
    pub fn detect(argv: &[String]) -> Result<Self, HelperError> {
        if argv.get(1).map(String::as_str) == Some(HELPER_MODE) {
            HelperInvocation::parse(argv).map(Self::HelperPhase2)
        } else {
            Ok(Self::Direct)
        }
    }
}

/// Phase two, run inside the freshly spawned helper image.
///
/// `Start → VerifyTty → EnsureSessionLeader → AssignControllingTty
/// (best-effort) → ExecReplace`. Each step is attempted exactly once. On
/// success the process image is replaced and this function never returns;
/// the returned error is fatal for the helper process.
pub fn run_phase_two(inv: &HelperInvocation) -> HelperError {
    // VerifyTty: an unusable descriptor is fatal; "not a terminal" is the
    // one benign answer (the surrounding context may not be a terminal yet).
    match nix::unistd::isatty(inv.tty_fd) {
        Ok(true) => {}
        Ok(false) => {
            debug!(target: "pspawn.helper", fd = inv.tty_fd, "descriptor is not a tty, continuing");
        }
        Err(errno) => {
            return HelperError::InvalidTty {
                fd: inv.tty_fd,
                errno,
            };
        }
    }

    // EnsureSessionLeader: phase one normally spawned us with the
    // new-session attribute, in which case we already lead our own session
    // and a second setsid would fail.
    let pid = nix::unistd::getpid();
    match nix::unistd::getsid(None) {
        Ok(sid) if sid == pid => {
            debug!(target: "pspawn.helper", "already session leader");
        }
        _ => {
            if let Err(errno) = nix::unistd::setsid() {
                warn!(target: "pspawn.helper", %errno, "setsid failed");
            }
        }
    }

    // AssignControllingTty: best-effort. On some kernels a session leader
    // that acquired the terminal as a side effect of session creation
    // reports an error here while already holding it.
    if let Err(errno) = posix::set_controlling_tty(inv.tty_fd) {
        warn!(target: "pspawn.helper", fd = inv.tty_fd, %errno, "TIOCSCTTY failed");
    }

    debug!(target: "pspawn.helper", path = %inv.path, "replacing helper image with target");
    exec_replace(inv)
}

/// Replace the current process image with the target, terminal on stdio.
///
/// Environment and working directory default to the current process's
/// (inherited across exec). On success this never returns.
#[cfg(target_os = "macos")]
fn exec_replace(inv: &HelperInvocation) -> HelperError {
    use crate::error::SpawnError;
    use crate::executor::inherited_env_cstrings;
    use crate::posix::{FileActions, SpawnAttrs, spawnp};

    let (path, argv) = match inv.exec_argv() {
        Ok(v) => v,
        Err(e) => return e,
    };
    let envp = match inherited_env_cstrings() {
        Ok(v) => v,
        Err(_) => Vec::new(),
    };
    let errno = (|| -> Result<(), SpawnError> {
        let mut attrs = SpawnAttrs::new()?;
        // SETEXEC: reuse this pid instead of creating a grandchild.
        attrs.set_flags(libc::POSIX_SPAWN_SETEXEC as libc::c_short)?;
        let mut actions = FileActions::new()?;
        for slot in 0..3 {
            actions.add_dup2(inv.tty_fd, slot)?;
        }
        spawnp(&path, &actions, &attrs, &argv, &envp)?;
        Ok(())
    })()
    .err()
    .and_then(|e| match e {
        SpawnError::Os { errno, .. } => Some(errno),
        _ => None,
    })
    .unwrap_or(Errno::UnknownErrno);
    HelperError::ExecFailed { errno }
}

/// Replace the current process image with the target, terminal on stdio.
///
/// Platforms without a "replace image" spawn attribute reach the same state
/// with explicit dup2 and a plain exec, which is safe here: the helper is a
/// single-purpose process with nothing else running.
#[cfg(not(target_os = "macos"))]
fn exec_replace(inv: &HelperInvocation) -> HelperError {
    let (path, argv) = match inv.exec_argv() {
        Ok(v) => v,
        Err(e) => return e,
    };
    for slot in 0..3 {
        if let Err(errno) = nix::unistd::dup2(inv.tty_fd, slot) {
            return HelperError::ExecFailed { errno };
        }
    }
    if inv.tty_fd > 2 {
        let _ = nix::unistd::close(inv.tty_fd);
    }
    match nix::unistd::execvp(&path, &argv) {
        Ok(infallible) => match infallible {},
        Err(errno) => HelperError::ExecFailed { errno },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn argv_roundtrip() {
        let inv = HelperInvocation::new(7, "/bin/sh", strings(&["sh", "-c", "tty"]));
        let argv = inv.argv("/usr/local/bin/pspawn");
        assert_eq!(
            argv,
            strings(&[
                "/usr/local/bin/pspawn",
                "spawn-helper",
                "7",
                "/bin/sh",
                "sh",
                "-c",
                "tty"
            ])
        );
        let parsed = HelperInvocation::parse(&argv).expect("parse");
        assert_eq!(parsed, inv);
    }

    #[test]
    fn argv_roundtrip_without_args() {
        let inv = HelperInvocation::new(3, "/bin/true", Vec::new());
        let argv = inv.argv("pspawn");
        let parsed = HelperInvocation::parse(&argv).expect("parse");
        assert_eq!(parsed, inv);
        assert!(parsed.args.is_empty());
    }

    #[test]
    fn parse_rejects_missing_fields() {
        assert!(HelperInvocation::parse(&strings(&["pspawn", "spawn-helper"])).is_err());
        assert!(HelperInvocation::parse(&strings(&["pspawn", "spawn-helper", "9"])).is_err());
        assert!(
            HelperInvocation::parse(&strings(&["pspawn", "spawn-helper", "nine", "/bin/sh"]))
                .is_err()
        );
    }

    #[test]
    fn detect_direct_vs_helper() {
        match LaunchMode::detect(&strings(&["pspawn", "run", "--", "/bin/true"])) {
            Ok(LaunchMode::Direct) => {}
            other => panic!("expected direct mode, got {other:?}"),
        }
        match LaunchMode::detect(&strings(&["pspawn", "spawn-helper", "5", "/bin/true"])) {
            Ok(LaunchMode::HelperPhase2(inv)) => {
                assert_eq!(inv.tty_fd, 5);
                assert_eq!(inv.path, "/bin/true");
            }
            other => panic!("expected helper mode, got {other:?}"),
        }
        assert!(LaunchMode::detect(&strings(&["pspawn", "spawn-helper"])).is_err());
    }

    #[test]
    fn verify_rejects_bad_descriptor() {
        let inv = HelperInvocation::new(-1, "/bin/true", Vec::new());
        match run_phase_two(&inv) {
            HelperError::InvalidTty { fd: -1, errno } => assert_eq!(errno, Errno::EBADF),
            other => panic!("unexpected outcome: {other}"),
        }
    }
}
