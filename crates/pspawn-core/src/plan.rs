// SPDX-License-Identifier: MIT OR Apache-2.0
//! Resolves a launch request's stream specs into concrete descriptors.

use crate::error::SpawnError;
use crate::posix;
use crate::request::{LaunchRequest, StdioSpec};
use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

/// Parent-side pipe ends retained until the child's exit is observed.
///
/// These are the `closeAfterWait` set: they outlive the spawn call and are
/// surfaced on the [`ProcessHandle`](crate::ProcessHandle).
#[derive(Debug, Default)]
pub struct ParentEnds {
    /// Write end of the child's stdin pipe.
    pub stdin: Option<OwnedFd>,
    /// Read end of the child's stdout pipe.
    pub stdout: Option<OwnedFd>,
    /// Read end of the child's stderr pipe.
    pub stderr: Option<OwnedFd>,
}

/// Concrete open descriptors for child slots `0, 1, 2, 3..`.
///
/// Child-side descriptors that exist only so the child can inherit a copy
/// (pipe ends, null-device handles) are owned here and released as soon as
/// the spawn call has been made — the `closeAfterStart` set. Extra
/// descriptors are borrowed from the caller and never closed.
#[derive(Debug)]
pub struct DescriptorPlan {
    stdio: [RawFd; 3],
    extras: Vec<RawFd>,
    close_after_start: Vec<OwnedFd>,
    parent: ParentEnds,
}

// A plan always has the three stdio slots, so there is no empty state.
#[allow(clippy::len_without_is_empty)]
impl DescriptorPlan {
    /// Resolve the request's stream specs.
    ///
    /// Every descriptor opened here carries close-on-exec so it cannot leak
    /// into unrelated concurrent spawns; the child receives its copies via
    /// explicit dup2 file actions. Failure at any step drops everything
    /// already opened.
    pub fn resolve(request: &LaunchRequest) -> Result<Self, SpawnError> {
        let mut plan = Self {
            stdio: [-1; 3],
            extras: request.extra_descriptors.clone(),
            close_after_start: Vec::new(),
            parent: ParentEnds::default(),
        };

        plan.stdio[0] = match request.stdin {
            StdioSpec::Null => plan.open_null(false)?,
            StdioSpec::Inherit(fd) => fd,
            StdioSpec::Piped => {
                let (child, parent) = plan.pipe_for_stdin()?;
                plan.parent.stdin = Some(parent);
                child
            }
        };
        plan.stdio[1] = match request.stdout {
            StdioSpec::Null => plan.open_null(true)?,
            StdioSpec::Inherit(fd) => fd,
            StdioSpec::Piped => {
                let (parent, child) = plan.pipe_for_output()?;
                plan.parent.stdout = Some(parent);
                child
            }
        };
        plan.stdio[2] = match request.stderr {
            StdioSpec::Null => plan.open_null(true)?,
            StdioSpec::Inherit(fd) => fd,
            StdioSpec::Piped => {
                let (parent, child) = plan.pipe_for_output()?;
                plan.parent.stderr = Some(parent);
                child
            }
        };

        Ok(plan)
    }

    /// Total number of child slots: stdin, stdout, stderr, extras.
    pub fn len(&self) -> usize {
        3 + self.extras.len()
    }

    /// Raw descriptors destined for child slots 0, 1, 2.
    pub fn stdio(&self) -> [RawFd; 3] {
        self.stdio
    }

    /// Borrowed descriptors the child inherits at their current numbers.
    pub fn extras(&self) -> &[RawFd] {
        &self.extras
    }

    /// Number of descriptors in the `closeAfterStart` set.
    pub fn close_after_start_len(&self) -> usize {
        self.close_after_start.len()
    }

    pub(crate) fn into_parts(self) -> ([RawFd; 3], Vec<RawFd>, Vec<OwnedFd>, ParentEnds) {
        (self.stdio, self.extras, self.close_after_start, self.parent)
    }

    /// Open the null device for the given direction; the handle lives in the
    /// `closeAfterStart` set.
    fn open_null(&mut self, write: bool) -> Result<RawFd, SpawnError> {
        let file = if write {
            OpenOptions::new().write(true).open("/dev/null")
        } else {
            File::open("/dev/null")
        }
        .map_err(SpawnError::DescriptorSetup)?;
        // std opens with O_CLOEXEC already.
        let fd = OwnedFd::from(file);
        let raw = fd.as_raw_fd();
        self.close_after_start.push(fd);
        Ok(raw)
    }

    /// Pipe for the child's stdin: the child inherits the read end
    /// (`closeAfterStart`), the parent keeps the write end.
    fn pipe_for_stdin(&mut self) -> Result<(RawFd, OwnedFd), SpawnError> {
        let (read, write) = Self::cloexec_pipe()?;
        let child = read.as_raw_fd();
        self.close_after_start.push(read);
        Ok((child, write))
    }

    /// Pipe for the child's stdout/stderr: the child inherits the write end
    /// (`closeAfterStart`), the parent keeps the read end.
    fn pipe_for_output(&mut self) -> Result<(OwnedFd, RawFd), SpawnError> {
        let (read, write) = Self::cloexec_pipe()?;
        let child = write.as_raw_fd();
        self.close_after_start.push(write);
        Ok((read, child))
    }

    /// `pipe(2)` with close-on-exec set on both ends, so neither end leaks
    /// into concurrently spawned children.
    fn cloexec_pipe() -> Result<(OwnedFd, OwnedFd), SpawnError> {
        let (read, write) =
            nix::unistd::pipe().map_err(|e| SpawnError::DescriptorSetup(std::io::Error::from(e)))?;
        posix::set_cloexec(read.as_raw_fd())?;
        posix::set_cloexec(write.as_raw_fd())?;
        Ok((read, write))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with(stdin: StdioSpec, stdout: StdioSpec, stderr: StdioSpec) -> LaunchRequest {
        let mut req = LaunchRequest::new("/bin/true");
        req.stdin = stdin;
        req.stdout = stdout;
        req.stderr = stderr;
        req
    }

    #[test]
    fn null_streams_open_three_start_scoped_fds() {
        let req = request_with(StdioSpec::Null, StdioSpec::Null, StdioSpec::Null);
        let plan = DescriptorPlan::resolve(&req).expect("resolve");
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.close_after_start_len(), 3);
        for fd in plan.stdio() {
            assert!(fd >= 0);
        }
    }

    #[test]
    fn inherit_adds_no_owned_descriptors() {
        let req = request_with(
            StdioSpec::Inherit(0),
            StdioSpec::Inherit(1),
            StdioSpec::Inherit(2),
        );
        let plan = DescriptorPlan::resolve(&req).expect("resolve");
        assert_eq!(plan.stdio(), [0, 1, 2]);
        assert_eq!(plan.close_after_start_len(), 0);
    }

    #[test]
    fn piped_stdout_keeps_parent_read_end() {
        let req = request_with(StdioSpec::Null, StdioSpec::Piped, StdioSpec::Null);
        let plan = DescriptorPlan::resolve(&req).expect("resolve");
        // two null devices + the child's write end
        assert_eq!(plan.close_after_start_len(), 3);
        let (_, _, _, parent) = plan.into_parts();
        assert!(parent.stdout.is_some());
        assert!(parent.stdin.is_none());
        assert!(parent.stderr.is_none());
    }

    #[test]
    fn fully_piped_surfaces_all_three_parent_ends() {
        let req = request_with(StdioSpec::Piped, StdioSpec::Piped, StdioSpec::Piped);
        let plan = DescriptorPlan::resolve(&req).expect("resolve");
        assert_eq!(plan.close_after_start_len(), 3);
        let (_, _, _, parent) = plan.into_parts();
        assert!(parent.stdin.is_some());
        assert!(parent.stdout.is_some());
        assert!(parent.stderr.is_some());
    }

    #[test]
    fn extras_are_counted_and_borrowed() {
        let mut req = request_with(StdioSpec::Null, StdioSpec::Null, StdioSpec::Null);
        req.extra_descriptors = vec![1, 2];
        let plan = DescriptorPlan::resolve(&req).expect("resolve");
        assert_eq!(plan.len(), 5);
        assert_eq!(plan.extras(), &[1, 2]);
        // borrowed fds never enter the owned sets
        assert_eq!(plan.close_after_start_len(), 3);
    }
}
