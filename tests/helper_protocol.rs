// SPDX-License-Identifier: MIT OR Apache-2.0
//! Controlling-terminal launches through the real helper executable.

#![cfg(target_os = "linux")]

use pspawn_core::{LaunchRequest, SpawnExecutor};
use pspawn_pty::PtyPair;
use std::fs::File;
use std::io::Read;
use std::os::fd::{FromRawFd, OwnedFd};

/// Drain a terminal master until the far side is gone. A pty master
/// reports EIO instead of a zero-length read once the slave side is fully
/// closed; both mean the same thing here.
fn drain_master(fd: OwnedFd) -> String {
    let mut file = File::from(fd);
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) if e.raw_os_error() == Some(libc::EIO) => break,
            Err(e) => panic!("master read failed: {e}"),
        }
    }
    String::from_utf8_lossy(&out).replace('\r', "")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn helper_assigns_the_controlling_terminal() {
    let mut pty = PtyPair::open().expect("open pty");
    let mut request = LaunchRequest::new("/bin/sh").with_args([
        "sh",
        "-c",
        // Session id of this shell, then the terminal it controls.
        "cut -d' ' -f6 /proc/$$/stat; tty",
    ]);
    pty.attach(&mut request).expect("attach");

    let executor = SpawnExecutor::new().with_helper_program(env!("CARGO_BIN_EXE_pspawn"));
    let mut handle = executor.spawn(&request).await.expect("spawn");
    pty.close_slave();

    // Duplicate the master for the blocking drain, then drop the pair so
    // the child's exit is the only thing keeping the terminal alive.
    let master = {
        let raw = nix::unistd::dup(pty.master_fd().expect("master")).expect("dup master");
        // Safety: dup returned a fresh descriptor that nothing else owns.
        unsafe { OwnedFd::from_raw_fd(raw) }
    };
    pty.close();

    let output = tokio::task::spawn_blocking(move || drain_master(master))
        .await
        .expect("join");

    let status = handle.wait().await.expect("wait");
    assert!(status.success(), "child failed: {status:?}");

    let mut lines = output.lines();
    let sid: i32 = lines
        .next()
        .expect("sid line")
        .trim()
        .parse()
        .expect("numeric sid");
    let tty_line = lines.next().expect("tty line");

    // The helper execs in place, so the final program keeps the helper's
    // pid, which leads the new session.
    assert_eq!(sid, handle.pid());
    assert!(
        tty_line.starts_with("/dev/pts/"),
        "expected a pty device, got {tty_line:?}"
    );
}

#[test]
fn malformed_helper_invocation_exits_nonzero() {
    let status = std::process::Command::new(env!("CARGO_BIN_EXE_pspawn"))
        .args(["spawn-helper"])
        .status()
        .expect("run helper");
    assert_eq!(status.code(), Some(70));
}
