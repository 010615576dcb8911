//! A monotonic 8-byte event counter shared across processes as a plain file
//! descriptor.
//!
//! On Linux this is an `eventfd(2)`: writers add to the counter, a blocking
//! read returns the accumulated count and resets it. On other Unixes a pipe
//! stands in; each bump is one 8-byte message, so a reader wakes per event
//! instead of per batch, which is good enough for a wakeup channel.
//!
//! The writing side is inherited by worker processes (fd 4 by convention);
//! the reading side stays with the supervisor's evictor.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::unistd;

pub struct EventCounter {
    rx: OwnedFd,
    tx: OwnedFd,
}

impl EventCounter {
    pub fn new() -> io::Result<EventCounter> {
        cfg_if::cfg_if! {
            if #[cfg(target_os = "linux")] {
                let raw = nix::sys::eventfd::eventfd(0, nix::sys::eventfd::EfdFlags::EFD_CLOEXEC)?;
                // SAFETY: eventfd returned a fresh descriptor we now own.
                let rx = unsafe { OwnedFd::from_raw_fd(raw) };
                let tx = rx.try_clone()?;
                Ok(EventCounter { rx, tx })
            } else {
                let (r, w) = unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)?;
                // SAFETY: pipe2 returned fresh descriptors we now own.
                let rx = unsafe { OwnedFd::from_raw_fd(r) };
                let tx = unsafe { OwnedFd::from_raw_fd(w) };
                Ok(EventCounter { rx, tx })
            }
        }
    }

    /// Rebuild a counter around an inherited writer fd (the worker side).
    ///
    /// # Safety
    /// `fd` must be an open descriptor for an event counter created by
    /// [`EventCounter::new`] in an ancestor process, not owned elsewhere.
    pub unsafe fn from_inherited_fd(fd: RawFd) -> io::Result<EventCounter> {
        let tx = OwnedFd::from_raw_fd(fd);
        let rx = tx.try_clone()?;
        Ok(EventCounter { rx, tx })
    }

    /// Add `n` to the counter, waking a blocked [`Self::wait`].
    pub fn add(&self, n: u64) -> io::Result<()> {
        let buf = n.to_ne_bytes();
        loop {
            match unistd::write(self.tx.as_raw_fd(), &buf) {
                Ok(8) => return Ok(()),
                Ok(n) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("short event counter write: {n}"),
                    ))
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn bump(&self) -> io::Result<()> {
        self.add(1)
    }

    /// Block until the counter is nonzero, then return and reset it.
    pub fn wait(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        let mut got = 0;
        while got < 8 {
            match unistd::read(self.rx.as_raw_fd(), &mut buf[got..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "event counter closed",
                    ))
                }
                Ok(n) => got += n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(u64::from_ne_bytes(buf))
    }

    /// The fd a spawned worker should inherit for bumping.
    pub fn writer_fd(&self) -> BorrowedFd<'_> {
        use std::os::fd::AsFd;
        self.tx.as_fd()
    }
}
