use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use crate::error::{Result, TransportError};
use crate::handle::PlatformHandle;

/// Most descriptors a single `recvmsg` will accept as ancillary data.
///
/// Senders attach all of a frame's handles to one `sendmsg`, so this also
/// bounds the handles one frame may carry on the wire.
pub const MAX_HANDLES_PER_MESSAGE: usize = 64;

/// A connected IPC stream that can carry OS handles alongside bytes.
///
/// Wraps a Unix-domain stream socket. Plain `Read`/`Write` move bytes only;
/// [`send_with_handles`](IpcStream::send_with_handles) and
/// [`recv_with_handles`](IpcStream::recv_with_handles) additionally move file
/// descriptors via `SCM_RIGHTS`.
pub struct IpcStream {
    inner: UnixStream,
}

impl IpcStream {
    pub(crate) fn from_unix(inner: UnixStream) -> Self {
        Self { inner }
    }

    /// Create a connected pair of streams (socketpair).
    ///
    /// The broker mints one of these per process introduction and ships each
    /// end to a child inside a control frame.
    pub fn pair() -> Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::from_unix(a), Self::from_unix(b)))
    }

    /// Rehydrate a stream from a handle received in a frame.
    pub fn from_handle(handle: PlatformHandle) -> Self {
        Self::from_unix(UnixStream::from(handle.into_fd()))
    }

    /// Detach into a transferable handle.
    pub fn into_handle(self) -> PlatformHandle {
        PlatformHandle::from(OwnedFd::from(self.inner))
    }

    /// Clone the stream (new descriptor, same socket).
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self::from_unix(self.inner.try_clone()?))
    }

    /// Shut down both directions. Unblocks any reader parked in `recvmsg`.
    pub fn shutdown(&self) -> Result<()> {
        self.inner.shutdown(Shutdown::Both)?;
        Ok(())
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.inner.set_read_timeout(timeout)?;
        Ok(())
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.inner.set_write_timeout(timeout)?;
        Ok(())
    }

    /// Send bytes with descriptors attached as a single `SCM_RIGHTS` block.
    ///
    /// The descriptors ride with whatever prefix of `buf` this call manages
    /// to send; callers sending the remainder must do so without handles.
    /// Returns the number of bytes written. The handles stay open in this
    /// process; the caller drops them once the whole frame is out.
    pub fn send_with_handles(&self, buf: &[u8], handles: &[PlatformHandle]) -> io::Result<usize> {
        if handles.is_empty() {
            return (&self.inner).write(buf);
        }
        if handles.len() > MAX_HANDLES_PER_MESSAGE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "too many handles for one message: {} (max {})",
                    handles.len(),
                    MAX_HANDLES_PER_MESSAGE
                ),
            ));
        }

        let fd_bytes = handles.len() * std::mem::size_of::<libc::c_int>();
        let cmsg_space = unsafe { libc::CMSG_SPACE(fd_bytes as u32) } as usize;
        let mut cmsg_buf = vec![0u8; cmsg_space];

        let mut iov = libc::iovec {
            iov_base: buf.as_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };

        // SAFETY: zeroed msghdr is a valid "empty" value on all Unix targets;
        // every pointer stored below outlives the sendmsg call.
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr().cast::<libc::c_void>();
        msg.msg_controllen = cmsg_space as _;

        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(fd_bytes as u32) as _;
            let data = libc::CMSG_DATA(cmsg).cast::<libc::c_int>();
            for (i, handle) in handles.iter().enumerate() {
                std::ptr::write_unaligned(data.add(i), handle.as_raw_fd());
            }
        }

        let n = unsafe { libc::sendmsg(self.inner.as_raw_fd(), &msg, 0) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Receive bytes, collecting any `SCM_RIGHTS` descriptors into `handles`.
    ///
    /// Received descriptors are owned immediately and close-on-exec. Returns
    /// the number of bytes read (0 at end of stream).
    pub fn recv_with_handles(
        &self,
        buf: &mut [u8],
        handles: &mut Vec<PlatformHandle>,
    ) -> io::Result<usize> {
        let fd_bytes = MAX_HANDLES_PER_MESSAGE * std::mem::size_of::<libc::c_int>();
        let cmsg_space = unsafe { libc::CMSG_SPACE(fd_bytes as u32) } as usize;
        let mut cmsg_buf = vec![0u8; cmsg_space];

        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr().cast::<libc::c_void>(),
            iov_len: buf.len(),
        };

        // SAFETY: see send_with_handles.
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr().cast::<libc::c_void>();
        msg.msg_controllen = cmsg_space as _;

        #[cfg(target_os = "linux")]
        let flags = libc::MSG_CMSG_CLOEXEC;
        #[cfg(not(target_os = "linux"))]
        let flags = 0;

        let n = unsafe { libc::recvmsg(self.inner.as_raw_fd(), &mut msg, flags) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: the kernel filled cmsg_buf; CMSG_* walk it per its own
        // length fields, and each SCM_RIGHTS fd is open and unowned until we
        // wrap it here.
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS
                {
                    let data = libc::CMSG_DATA(cmsg).cast::<libc::c_int>();
                    let count = ((*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize)
                        / std::mem::size_of::<libc::c_int>();
                    for i in 0..count {
                        let fd = std::ptr::read_unaligned(data.add(i));
                        #[cfg(not(target_os = "linux"))]
                        let _ = libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
                        handles.push(PlatformHandle::from_raw_fd(fd));
                    }
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }

        if msg.msg_flags & libc::MSG_CTRUNC != 0 {
            // Descriptors were dropped by the kernel; pairing handles with
            // frames is no longer possible on this stream.
            return Err(io::Error::other(TransportError::AncillaryTruncated));
        }

        Ok(n as usize)
    }
}

impl Read for IpcStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for IpcStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl std::fmt::Debug for IpcStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcStream")
            .field("fd", &self.inner.as_raw_fd())
            .finish()
    }
}
