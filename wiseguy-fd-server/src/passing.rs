//! SCM_RIGHTS transfer of a single file descriptor over a connected
//! Unix stream socket.
//!
//! The descriptor rides as ancillary data on a one-byte payload, issued
//! directly after the `OK` response frame; the receiver picks both up in
//! a single `recvmsg` as part of the same protocol step.

use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use anyhow::{bail, Context, Error};
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};

pub fn send_fd(stream: &UnixStream, fd: RawFd) -> Result<(), Error> {
    let iov = [IoSlice::new(b"F")];
    let fds = [fd];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    let sent = sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)
        .context("sendmsg failed")?;
    if sent != 1 {
        bail!("short sendmsg while passing fd");
    }
    Ok(())
}

pub fn recv_fd(stream: &UnixStream) -> Result<OwnedFd, Error> {
    let mut buf = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut buf)];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; 1]);
    let msg = recvmsg::<()>(
        stream.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buffer),
        MsgFlags::empty(),
    )
    .context("recvmsg failed")?;
    if msg.bytes == 0 {
        bail!("connection closed while waiting for fd");
    }
    for cmsg in msg.cmsgs().context("failed to parse ancillary data")? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(&fd) = fds.first() {
                return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
            }
        }
    }
    bail!("no file descriptor in ancillary data");
}

/// Duplicate a descriptor with `FD_CLOEXEC` set on the copy.
pub fn dup_fd(fd: RawFd) -> Result<OwnedFd, Error> {
    let duped = nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_DUPFD_CLOEXEC(0))
        .context("failed to duplicate fd")?;
    Ok(unsafe { OwnedFd::from_raw_fd(duped) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn test_fd_round_trip() {
        let (tx, rx) = UnixStream::pair().unwrap();
        let (data_near, mut data_far) = UnixStream::pair().unwrap();
        send_fd(&tx, data_near.as_raw_fd()).unwrap();
        let received = recv_fd(&rx).unwrap();

        // prove the received descriptor refers to the same socket
        data_far.write_all(b"ping").unwrap();
        drop(data_far);
        drop(data_near);
        let mut copy = UnixStream::from(received);
        let mut out = Vec::new();
        copy.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"ping");
    }

    #[test]
    fn test_recv_fd_on_closed_stream() {
        let (tx, rx) = UnixStream::pair().unwrap();
        drop(tx);
        assert!(recv_fd(&rx).is_err());
    }
}
