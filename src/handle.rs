use std::{
    fmt,
    net::SocketAddrV6,
    os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd},
};

use socket2::SockRef;

use crate::error::{Error, Result};

/// Opaque reference to a caller-owned socket descriptor.
///
/// The handle only borrows the descriptor: it never closes it and never
/// outlives the socket it was created from.
#[derive(Clone, Copy)]
pub struct SocketHandle<'fd> {
    fd: Option<BorrowedFd<'fd>>,
}

impl<'fd> SocketHandle<'fd> {
    pub fn new<S: AsFd>(socket: &'fd S) -> Self {
        SocketHandle {
            fd: Some(socket.as_fd()),
        }
    }

    /// Wrap a raw descriptor, e.g. one handed over from another runtime.
    ///
    /// A negative descriptor yields a handle that fails every operation with
    /// [`Error::InvalidHandle`].
    ///
    /// # Safety
    ///
    /// A non-negative `fd` must stay open for `'fd` (or be a descriptor
    /// number the caller knows is unused, in which case the kernel reports
    /// `EBADF`).
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        let fd = if fd < 0 {
            None
        } else {
            // SAFETY: fd is not -1 and the caller guarantees its lifetime
            Some(unsafe { BorrowedFd::borrow_raw(fd) })
        };
        SocketHandle { fd }
    }

    pub(crate) fn fd(&self) -> Result<BorrowedFd<'fd>> {
        self.fd.ok_or(Error::InvalidHandle)
    }

    pub(crate) fn raw(&self) -> Result<RawFd> {
        self.fd().map(|fd| fd.as_raw_fd())
    }

    /// Address of the connected peer, or `None` when not connected.
    pub fn peer_addr_v6(&self) -> Result<Option<SocketAddrV6>> {
        let fd = self.fd()?;
        match SockRef::from(&fd).peer_addr() {
            Ok(addr) => match addr.as_socket_ipv6() {
                Some(addr) => Ok(Some(addr)),
                None => Err(Error::NotIpv6),
            },
            Err(err) => match err.raw_os_error() {
                Some(libc::ENOTCONN) => Ok(None),
                _ => Err(os_error(err)),
            },
        }
    }

    /// Local address the socket is bound to.
    pub fn local_addr_v6(&self) -> Result<SocketAddrV6> {
        let fd = self.fd()?;
        let addr = SockRef::from(&fd).local_addr().map_err(os_error)?;
        addr.as_socket_ipv6().ok_or(Error::NotIpv6)
    }
}

impl<'fd, S: AsFd> From<&'fd S> for SocketHandle<'fd> {
    fn from(socket: &'fd S) -> Self {
        SocketHandle::new(socket)
    }
}

impl fmt::Debug for SocketHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.fd {
            Some(fd) => write!(f, "SocketHandle({})", fd.as_raw_fd()),
            None => f.write_str("SocketHandle(invalid)"),
        }
    }
}

pub(crate) fn os_error(err: std::io::Error) -> Error {
    match err.raw_os_error().map(nix::errno::Errno::from_raw) {
        Some(nix::errno::Errno::EBADF | nix::errno::Errno::ENOTSOCK) => Error::InvalidHandle,
        Some(errno) => Error::Os(errno),
        None => Error::Os(nix::errno::Errno::UnknownErrno),
    }
}
