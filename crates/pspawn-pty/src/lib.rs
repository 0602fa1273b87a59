// SPDX-License-Identifier: MIT OR Apache-2.0
//! Pseudo-terminal allocation and wiring for launch requests.
//!
//! [`PtyPair`] owns a master/slave descriptor pair from `openpty(3)`. The
//! slave side is handed to a [`LaunchRequest`] via [`PtyPair::attach`], which
//! also asks for a new session with the slave as controlling terminal; the
//! master side stays with the caller for reading output, writing input, and
//! window resizing.
//!
//! After the child has been spawned the caller should drop the slave end
//! ([`PtyPair::close_slave`]) so that reads on the master report EOF once
//! the child exits.

#![warn(missing_docs)]

use nix::errno::Errno;
use pspawn_core::{LaunchRequest, SessionControl, StdioSpec};
use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Errors from pseudo-terminal allocation and control.
#[derive(Debug, Error)]
pub enum PtyError {
    /// The system refused to allocate a terminal pair.
    #[error("pseudo-terminal allocation failed: {0}")]
    DeviceUnavailable(Errno),

    /// A terminal ioctl failed.
    #[error("terminal ioctl failed: {0}")]
    IoctlFailed(Errno),

    /// The requested end of the pair has already been closed.
    #[error("terminal descriptor already closed")]
    Closed,

    /// Duplicating a terminal descriptor for an I/O bridge failed.
    #[error("duplicating terminal descriptor failed: {0}")]
    Dup(#[source] std::io::Error),
}

/// Terminal window geometry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Window {
    /// Rows, in character cells.
    pub rows: u16,
    /// Columns, in character cells.
    pub cols: u16,
    /// Horizontal size in pixels; zero when unknown.
    pub xpixel: u16,
    /// Vertical size in pixels; zero when unknown.
    pub ypixel: u16,
}

impl Window {
    /// Geometry with the given cell dimensions and no pixel information.
    pub fn cells(rows: u16, cols: u16) -> Self {
        Self {
            rows,
            cols,
            xpixel: 0,
            ypixel: 0,
        }
    }
}

/// An allocated pseudo-terminal pair.
///
/// Both ends close on drop. [`close`](Self::close) and
/// [`close_slave`](Self::close_slave) are idempotent.
#[derive(Debug)]
pub struct PtyPair {
    master: Option<OwnedFd>,
    slave: Option<OwnedFd>,
    window: Window,
}

impl PtyPair {
    /// Allocate a new pseudo-terminal pair with the system's default
    /// settings and geometry.
    pub fn open() -> Result<Self, PtyError> {
        let pair = nix::pty::openpty(None, None).map_err(PtyError::DeviceUnavailable)?;
        let window = read_window(pair.slave.as_raw_fd())?;
        debug!(
            target: "pspawn.pty",
            master = pair.master.as_raw_fd(),
            slave = pair.slave.as_raw_fd(),
            "allocated pseudo-terminal"
        );
        Ok(Self {
            master: Some(pair.master),
            slave: Some(pair.slave),
            window,
        })
    }

    /// The master descriptor number, while open.
    pub fn master_fd(&self) -> Result<RawFd, PtyError> {
        self.master.as_ref().map(AsRawFd::as_raw_fd).ok_or(PtyError::Closed)
    }

    /// The slave descriptor number, while open.
    pub fn slave_fd(&self) -> Result<RawFd, PtyError> {
        self.slave.as_ref().map(AsRawFd::as_raw_fd).ok_or(PtyError::Closed)
    }

    /// Current window geometry as last set (or as allocated).
    pub fn window(&self) -> Window {
        self.window
    }

    /// Wire the request's standard streams to the slave end and request a
    /// new session with the slave as controlling terminal.
    pub fn attach(&self, request: &mut LaunchRequest) -> Result<(), PtyError> {
        let slave = self.slave_fd()?;
        request.stdin = StdioSpec::Inherit(slave);
        request.stdout = StdioSpec::Inherit(slave);
        request.stderr = StdioSpec::Inherit(slave);
        request.session = SessionControl::NewSessionWithControllingTty(slave);
        Ok(())
    }

    /// Change the terminal's window geometry.
    ///
    /// The foreground process group receives SIGWINCH as a side effect of
    /// the ioctl. The stored geometry is only updated on success.
    pub fn resize(&mut self, window: Window) -> Result<(), PtyError> {
        let slave = self.slave_fd()?;
        let size = libc::winsize {
            ws_row: window.rows,
            ws_col: window.cols,
            ws_xpixel: window.xpixel,
            ws_ypixel: window.ypixel,
        };
        let rc = unsafe { libc::ioctl(slave, libc::TIOCSWINSZ, &size) };
        if rc != 0 {
            return Err(PtyError::IoctlFailed(Errno::last()));
        }
        self.window = window;
        Ok(())
    }

    /// Bridge the master end to an external stream pair.
    ///
    /// Two detached pump tasks are started: one copies `reader` into the
    /// terminal (the child's input), the other copies terminal output into
    /// `writer`. Each task ends on EOF or the first I/O error; for a
    /// terminal the usual end of stream surfaces as an error (EIO) once the
    /// slave side is fully closed, which is treated the same as EOF.
    pub fn attach_io<R, W>(&self, reader: R, writer: W) -> Result<(), PtyError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let master_read = self.clone_master()?;
        let master_write = self.clone_master()?;

        tokio::spawn(async move {
            let mut master = tokio::fs::File::from_std(master_read);
            let mut writer = writer;
            match tokio::io::copy(&mut master, &mut writer).await {
                Ok(n) => debug!(target: "pspawn.pty", bytes = n, "output pump finished"),
                Err(e) => debug!(target: "pspawn.pty", error = %e, "output pump stopped"),
            }
        });
        tokio::spawn(async move {
            let mut master = tokio::fs::File::from_std(master_write);
            let mut reader = reader;
            match tokio::io::copy(&mut reader, &mut master).await {
                Ok(n) => debug!(target: "pspawn.pty", bytes = n, "input pump finished"),
                Err(e) => debug!(target: "pspawn.pty", error = %e, "input pump stopped"),
            }
        });
        Ok(())
    }

    /// Close the slave end, leaving the master open. Call after the child
    /// has been spawned so master reads can observe its exit.
    pub fn close_slave(&mut self) {
        self.slave = None;
    }

    /// Close both ends.
    pub fn close(&mut self) {
        self.slave = None;
        self.master = None;
    }

    fn clone_master(&self) -> Result<File, PtyError> {
        let master = self.master.as_ref().ok_or(PtyError::Closed)?;
        let dup = master.try_clone().map_err(PtyError::Dup)?;
        Ok(File::from(dup))
    }
}

fn read_window(fd: RawFd) -> Result<Window, PtyError> {
    let mut size = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let rc = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut size) };
    if rc != 0 {
        return Err(PtyError::IoctlFailed(Errno::last()));
    }
    Ok(Window {
        rows: size.ws_row,
        cols: size.ws_col,
        xpixel: size.ws_xpixel,
        ypixel: size.ws_ypixel,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio::io::AsyncReadExt;

    #[test]
    fn open_yields_a_real_terminal() {
        let pty = PtyPair::open().expect("open");
        let slave = pty.slave_fd().expect("slave");
        assert!(nix::unistd::isatty(slave).expect("isatty"));
        assert!(pty.master_fd().expect("master") >= 0);
    }

    #[test]
    fn resize_is_observable_on_the_slave() {
        let mut pty = PtyPair::open().expect("open");
        pty.resize(Window::cells(48, 120)).expect("resize");
        assert_eq!(pty.window(), Window::cells(48, 120));
        let readback = read_window(pty.slave_fd().expect("slave")).expect("winsize");
        assert_eq!(readback, Window::cells(48, 120));
    }

    #[test]
    fn close_is_idempotent_and_poisons_accessors() {
        let mut pty = PtyPair::open().expect("open");
        pty.close();
        pty.close();
        assert!(matches!(pty.master_fd(), Err(PtyError::Closed)));
        assert!(matches!(pty.slave_fd(), Err(PtyError::Closed)));
        assert!(matches!(pty.resize(Window::cells(24, 80)), Err(PtyError::Closed)));
    }

    #[test]
    fn attach_wires_all_streams_and_the_session() {
        let pty = PtyPair::open().expect("open");
        let slave = pty.slave_fd().expect("slave");
        let mut request = LaunchRequest::new("/bin/sh");
        pty.attach(&mut request).expect("attach");
        assert_eq!(request.stdin, StdioSpec::Inherit(slave));
        assert_eq!(request.stdout, StdioSpec::Inherit(slave));
        assert_eq!(request.stderr, StdioSpec::Inherit(slave));
        assert_eq!(
            request.session,
            SessionControl::NewSessionWithControllingTty(slave)
        );
    }

    #[test]
    fn attach_after_close_slave_is_refused() {
        let mut pty = PtyPair::open().expect("open");
        pty.close_slave();
        let mut request = LaunchRequest::new("/bin/sh");
        assert!(matches!(pty.attach(&mut request), Err(PtyError::Closed)));
        // The master survives for draining.
        assert!(pty.master_fd().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bridges_terminal_output_to_the_writer() {
        let pty = PtyPair::open().expect("open");
        let (mut ours, theirs) = tokio::io::duplex(64);
        let (their_read, their_write) = tokio::io::split(theirs);
        pty.attach_io(their_read, their_write).expect("attach_io");

        // Anything written to the slave surfaces on the master and must be
        // pumped into the writer side of the bridge. No newline, so the
        // line discipline passes the bytes through untouched.
        let slave = pty.slave.as_ref().expect("slave").try_clone().expect("dup");
        let mut slave_file = File::from(slave);
        slave_file.write_all(b"pong").expect("write");

        let mut buf = [0u8; 4];
        tokio::time::timeout(std::time::Duration::from_secs(5), ours.read_exact(&mut buf))
            .await
            .expect("timely")
            .expect("read");
        assert_eq!(&buf, b"pong");
    }
}
