//! File descriptor passing over Unix-domain sockets.
//!
//! Control frames travel with at most one ancillary descriptor. Sockets here
//! are blocking with `SO_SNDTIMEO`/`SO_RCVTIMEO` deadlines set by the
//! caller; a deadline expiry surfaces from the kernel as `EAGAIN` and is
//! mapped to [`io::ErrorKind::TimedOut`].

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{
    recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr,
};

fn map_errno(e: Errno) -> io::Error {
    match e {
        Errno::EAGAIN => io::Error::new(io::ErrorKind::TimedOut, "socket deadline exceeded"),
        other => other.into(),
    }
}

/// Send `bytes`, attaching `fd` as ancillary data on the first segment.
///
/// The descriptor is delivered with the leading bytes; any remainder is
/// flushed with plain writes.
pub fn send_with_fd(
    sock: &impl AsRawFd,
    bytes: &[u8],
    fd: Option<BorrowedFd<'_>>,
) -> io::Result<()> {
    let raw = sock.as_raw_fd();
    let fds: Vec<RawFd> = fd.iter().map(|f| f.as_raw_fd()).collect();
    let cmsgs: Vec<ControlMessage<'_>> = if fds.is_empty() {
        Vec::new()
    } else {
        vec![ControlMessage::ScmRights(&fds)]
    };

    let mut sent = loop {
        let iov = [IoSlice::new(bytes)];
        match sendmsg::<UnixAddr>(raw, &iov, &cmsgs, MsgFlags::empty(), None) {
            Ok(n) => break n,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(map_errno(e)),
        }
    };

    while sent < bytes.len() {
        match nix::unistd::write(raw, &bytes[sent..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "socket closed mid-frame",
                ))
            }
            Ok(n) => sent += n,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(map_errno(e)),
        }
    }
    Ok(())
}

/// Receive up to `buf.len()` bytes plus an optional ancillary descriptor.
///
/// Returns `(0, None)` on clean EOF. Received descriptors are opened
/// close-on-exec.
pub fn recv_with_fd(sock: &impl AsRawFd, buf: &mut [u8]) -> io::Result<(usize, Option<OwnedFd>)> {
    let raw = sock.as_raw_fd();
    let mut cmsg_buf = nix::cmsg_space!([RawFd; 2]);
    loop {
        let mut iov = [IoSliceMut::new(buf)];
        match recvmsg::<UnixAddr>(
            raw,
            &mut iov,
            Some(&mut cmsg_buf),
            MsgFlags::MSG_CMSG_CLOEXEC,
        ) {
            Ok(msg) => {
                let mut fd = None;
                for cmsg in msg.cmsgs() {
                    if let ControlMessageOwned::ScmRights(fds) = cmsg {
                        for received in fds {
                            // SAFETY: the kernel just installed this fd for us.
                            let owned = unsafe { OwnedFd::from_raw_fd(received) };
                            // only the first one is part of the protocol
                            if fd.is_none() {
                                fd = Some(owned);
                            }
                        }
                    }
                }
                return Ok((msg.bytes, fd));
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(map_errno(e)),
        }
    }
}

/// Like [`recv_with_fd`] but loops until `buf` is full; EOF mid-frame is an
/// error. The descriptor may arrive with any of the segments.
pub fn recv_exact_with_fd(sock: &impl AsRawFd, buf: &mut [u8]) -> io::Result<Option<OwnedFd>> {
    let mut got = 0;
    let mut fd = None;
    while got < buf.len() {
        let (n, received) = recv_with_fd(sock, &mut buf[got..])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed mid-frame",
            ));
        }
        if fd.is_none() {
            fd = received;
        }
        got += n;
    }
    Ok(fd)
}
