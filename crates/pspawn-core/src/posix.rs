// SPDX-License-Identifier: MIT OR Apache-2.0
//! Thin wrappers over the `posix_spawn` family and descriptor flags.
//!
//! All `unsafe` in the crate lives here. The wrapper shapes follow the
//! attribute/file-action objects of `posix_spawn(3)`: init, mutate, pass by
//! pointer, destroy on drop.

use crate::error::{SpawnError, SpawnStage};
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use std::ffi::{CStr, CString};
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::RawFd;
use std::path::Path;
use std::ptr;

/// Spawn attribute set (`posix_spawnattr_t`).
pub(crate) struct SpawnAttrs(libc::posix_spawnattr_t);

impl SpawnAttrs {
    pub(crate) fn new() -> Result<Self, SpawnError> {
        let mut attr = MaybeUninit::uninit();
        let rc = unsafe { libc::posix_spawnattr_init(attr.as_mut_ptr()) };
        if rc != 0 {
            return Err(SpawnError::os(SpawnStage::AttrInit, Errno::from_raw(rc)));
        }
        Ok(Self(unsafe { attr.assume_init() }))
    }

    pub(crate) fn set_flags(&mut self, flags: libc::c_short) -> Result<(), SpawnError> {
        let rc = unsafe { libc::posix_spawnattr_setflags(&mut self.0, flags) };
        if rc != 0 {
            return Err(SpawnError::os(SpawnStage::AttrSetFlags, Errno::from_raw(rc)));
        }
        Ok(())
    }

    pub(crate) fn set_pgroup(&mut self, pgid: libc::pid_t) -> Result<(), SpawnError> {
        let rc = unsafe { libc::posix_spawnattr_setpgroup(&mut self.0, pgid) };
        if rc != 0 {
            return Err(SpawnError::os(SpawnStage::AttrSetPgroup, Errno::from_raw(rc)));
        }
        Ok(())
    }

    fn as_ptr(&self) -> *const libc::posix_spawnattr_t {
        &self.0
    }
}

impl Drop for SpawnAttrs {
    fn drop(&mut self) {
        unsafe {
            libc::posix_spawnattr_destroy(&mut self.0);
        }
    }
}

/// File-action list (`posix_spawn_file_actions_t`). Actions run in the child
/// in the order they were added.
pub(crate) struct FileActions(libc::posix_spawn_file_actions_t);

impl FileActions {
    pub(crate) fn new() -> Result<Self, SpawnError> {
        let mut actions = MaybeUninit::uninit();
        let rc = unsafe { libc::posix_spawn_file_actions_init(actions.as_mut_ptr()) };
        if rc != 0 {
            return Err(SpawnError::os(
                SpawnStage::FileActionsInit,
                Errno::from_raw(rc),
            ));
        }
        Ok(Self(unsafe { actions.assume_init() }))
    }

    /// Equivalent to `dup2(src, dst)` in the child. The duplicate at `dst`
    /// never carries close-on-exec, so a close-on-exec `src` in the parent
    /// still lands in the child at `dst`.
    pub(crate) fn add_dup2(&mut self, src: RawFd, dst: RawFd) -> Result<(), SpawnError> {
        let rc = unsafe { libc::posix_spawn_file_actions_adddup2(&mut self.0, src, dst) };
        if rc != 0 {
            return Err(SpawnError::os(
                SpawnStage::FileActionsDup2,
                Errno::from_raw(rc),
            ));
        }
        Ok(())
    }

    fn as_ptr(&self) -> *const libc::posix_spawn_file_actions_t {
        &self.0
    }
}

impl Drop for FileActions {
    fn drop(&mut self) {
        unsafe {
            libc::posix_spawn_file_actions_destroy(&mut self.0);
        }
    }
}

/// Build a NULL-terminated pointer vector over a `CString` slice. The
/// returned vector borrows `items`; keep it alive across the call.
fn ptr_vec(items: &[CString]) -> Vec<*mut libc::c_char> {
    let mut out: Vec<*mut libc::c_char> = items
        .iter()
        .map(|s| s.as_ptr() as *mut libc::c_char)
        .collect();
    out.push(ptr::null_mut());
    out
}

/// Invoke `posix_spawnp(3)` and return the child pid.
///
/// The spawn family reports failure through its return value, not `errno`.
pub(crate) fn spawnp(
    path: &CStr,
    actions: &FileActions,
    attrs: &SpawnAttrs,
    argv: &[CString],
    envp: &[CString],
) -> Result<libc::pid_t, SpawnError> {
    let argv_ptrs = ptr_vec(argv);
    let envp_ptrs = ptr_vec(envp);
    let mut pid: libc::pid_t = -1;
    let rc = unsafe {
        libc::posix_spawnp(
            &mut pid,
            path.as_ptr(),
            actions.as_ptr(),
            attrs.as_ptr(),
            argv_ptrs.as_ptr(),
            envp_ptrs.as_ptr(),
        )
    };
    if rc != 0 {
        return Err(SpawnError::os(SpawnStage::SpawnCall, Errno::from_raw(rc)));
    }
    Ok(pid)
}

/// Set `FD_CLOEXEC` on a descriptor.
pub(crate) fn set_cloexec(fd: RawFd) -> Result<(), SpawnError> {
    update_fd_flags(fd, true)
        .map_err(|e| SpawnError::DescriptorSetup(io::Error::from(e)))
}

/// Clear `FD_CLOEXEC` so the descriptor survives the spawn boundary at its
/// current number (the spawn primitive has no "keep open" action beyond dup2
/// for the first three slots).
pub(crate) fn clear_cloexec(fd: RawFd) -> Result<(), SpawnError> {
    update_fd_flags(fd, false).map_err(|e| SpawnError::os(SpawnStage::ClearCloexec, e))
}

/// `ioctl(fd, TIOCSCTTY)`: make `fd` the controlling terminal of the current
/// session. Only legal for a session leader.
pub(crate) fn set_controlling_tty(fd: RawFd) -> Result<(), Errno> {
    let rc = unsafe { libc::ioctl(fd, libc::TIOCSCTTY, 0) };
    if rc != 0 {
        return Err(Errno::last());
    }
    Ok(())
}

fn update_fd_flags(fd: RawFd, cloexec: bool) -> Result<(), Errno> {
    let current = fcntl(fd, FcntlArg::F_GETFD)?;
    let mut flags = FdFlag::from_bits_truncate(current);
    flags.set(FdFlag::FD_CLOEXEC, cloexec);
    fcntl(fd, FcntlArg::F_SETFD(flags))?;
    Ok(())
}

#[cfg(target_os = "macos")]
unsafe extern "C" {
    fn pthread_chdir_np(path: *const libc::c_char) -> libc::c_int;
}

/// Scoped, thread-local working-directory override.
///
/// `posix_spawn` has no per-call working-directory parameter, and a
/// process-wide `chdir` would race every other concurrently spawning caller.
/// The guard therefore switches only the calling thread's directory and
/// restores it on drop, including on spawn failure. It must be used from a
/// dedicated OS thread that does not migrate for the guard's lifetime.
///
/// Per platform:
/// - macOS: `pthread_chdir_np`, a genuinely thread-scoped chdir;
/// - Linux: `unshare(CLONE_FS)` detaches the thread's fs context, after
///   which a plain `chdir` is thread-scoped;
/// - elsewhere: degraded mode, a process-wide mutex around the
///   chdir/spawn/restore sequence.
pub(crate) struct ScopedThreadCwd {
    original: std::path::PathBuf,
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    _guard: std::sync::MutexGuard<'static, ()>,
}

impl ScopedThreadCwd {
    #[cfg(target_os = "linux")]
    pub(crate) fn enter(dir: &Path) -> io::Result<Self> {
        nix::sched::unshare(nix::sched::CloneFlags::CLONE_FS).map_err(io::Error::from)?;
        let original = std::env::current_dir()?;
        nix::unistd::chdir(dir).map_err(io::Error::from)?;
        Ok(Self { original })
    }

    #[cfg(target_os = "macos")]
    pub(crate) fn enter(dir: &Path) -> io::Result<Self> {
        let original = std::env::current_dir()?;
        Self::thread_chdir(dir)?;
        Ok(Self { original })
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    pub(crate) fn enter(dir: &Path) -> io::Result<Self> {
        static CWD_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
        let guard = CWD_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let original = std::env::current_dir()?;
        std::env::set_current_dir(dir)?;
        Ok(Self {
            original,
            _guard: guard,
        })
    }

    #[cfg(target_os = "macos")]
    fn thread_chdir(dir: &Path) -> io::Result<()> {
        use std::os::unix::ffi::OsStrExt;
        let c = CString::new(dir.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in directory path"))?;
        let rc = unsafe { pthread_chdir_np(c.as_ptr()) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for ScopedThreadCwd {
    fn drop(&mut self) {
        // Restore unconditionally, even after a failed spawn.
        #[cfg(target_os = "linux")]
        let _ = nix::unistd::chdir(&self.original);
        #[cfg(target_os = "macos")]
        let _ = Self::thread_chdir(&self.original);
        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        let _ = std::env::set_current_dir(&self.original);
    }
}
