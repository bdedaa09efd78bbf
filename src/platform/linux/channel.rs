//! Parent/child rendezvous over a pair of one-shot pipes.
//!
//! Each direction carries exactly one 8-byte token. A pipe (rather than an
//! eventfd) is used so that a peer dying with the token unsent surfaces as
//! EOF on the reader instead of blocking it forever.

use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};

use anyhow::{bail, Context, Result};
use nix::fcntl::OFlag;

/// The one token value either side is willing to accept.
const TOKEN: u64 = 0x6a61_696c_7275_6e21;

/// Both rendezvous pipes. The parent keeps the `ready` read end and the `go`
/// write end; the child uses the opposite ends. All four fds are
/// close-on-exec, so nothing leaks into the untrusted program.
pub(crate) struct Channel {
    /// Child -> parent: "I am set up enough to take limits".
    pub ready_rx: OwnedFd,
    pub ready_tx: OwnedFd,
    /// Parent -> child: "limits installed, enter the jail".
    pub go_rx: OwnedFd,
    pub go_tx: OwnedFd,
}

impl Channel {
    pub fn open() -> Result<Self> {
        let (ready_rx, ready_tx) =
            nix::unistd::pipe2(OFlag::O_CLOEXEC).context("failed to create readiness pipe")?;
        let (go_rx, go_tx) =
            nix::unistd::pipe2(OFlag::O_CLOEXEC).context("failed to create release pipe")?;
        Ok(Self {
            ready_rx,
            ready_tx,
            go_rx,
            go_tx,
        })
    }

    /// Raw fds the child-side bootstrap works with. The child runs in its own
    /// copy of the address space, so it cannot use the parent's `OwnedFd`
    /// values; it gets plain descriptors and closes them itself.
    pub fn child_fds(&self) -> ChildFds {
        ChildFds {
            ready_tx: self.ready_tx.as_raw_fd(),
            go_rx: self.go_rx.as_raw_fd(),
            parent_ends: [self.ready_rx.as_raw_fd(), self.go_tx.as_raw_fd()],
        }
    }
}

#[derive(Clone, Copy)]
pub(crate) struct ChildFds {
    pub ready_tx: RawFd,
    pub go_rx: RawFd,
    /// The parent's ends, which the child must close right after clone so
    /// that EOF semantics work in both directions.
    pub parent_ends: [RawFd; 2],
}

/// Send the rendezvous token. Token I/O goes through libc on raw fds because
/// it runs on both sides of the clone boundary.
pub(crate) fn send_token(fd: RawFd) -> Result<()> {
    let buf = TOKEN.to_ne_bytes();
    let mut written = 0;
    while written < buf.len() {
        let n = unsafe {
            libc::write(
                fd,
                buf[written..].as_ptr().cast(),
                buf.len() - written,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err).context("rendezvous write failed");
        }
        written += n as usize;
    }
    Ok(())
}

/// Receive and verify the rendezvous token. EOF (the peer closed without
/// writing) and a wrong token value are both failures.
pub(crate) fn recv_token(fd: RawFd) -> Result<()> {
    let mut buf = [0u8; 8];
    let mut read = 0;
    while read < buf.len() {
        let n = unsafe {
            libc::read(
                fd,
                buf[read..].as_mut_ptr().cast(),
                buf.len() - read,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err).context("rendezvous read failed");
        }
        if n == 0 {
            bail!("rendezvous peer closed after {read} of 8 bytes");
        }
        read += n as usize;
    }
    if u64::from_ne_bytes(buf) != TOKEN {
        bail!("rendezvous token mismatch");
    }
    Ok(())
}

pub(crate) fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}
