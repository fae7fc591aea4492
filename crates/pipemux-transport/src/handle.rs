use std::fmt;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

use crate::error::Result;

/// An exclusively-owned OS handle that may be attached to a message.
///
/// Transfer is move, not copy: sending a handle with a frame consumes it
/// (the kernel installs a duplicate in the receiving process), and receiving
/// a frame produces handles owned by the caller. Dropping a `PlatformHandle`
/// closes the descriptor, so a handle that enters the system is either
/// delivered once or closed once.
pub struct PlatformHandle {
    fd: OwnedFd,
}

impl PlatformHandle {
    /// Take ownership of a raw descriptor.
    ///
    /// # Safety
    ///
    /// `fd` must be open and not owned by any other wrapper.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self {
            fd: OwnedFd::from_raw_fd(fd),
        }
    }

    /// Duplicate the underlying descriptor.
    pub fn try_clone(&self) -> Result<Self> {
        let fd = self.fd.try_clone()?;
        Ok(Self { fd })
    }

    /// Unwrap into the owned descriptor.
    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }
}

impl From<OwnedFd> for PlatformHandle {
    fn from(fd: OwnedFd) -> Self {
        Self { fd }
    }
}

impl AsRawFd for PlatformHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl IntoRawFd for PlatformHandle {
    fn into_raw_fd(self) -> RawFd {
        self.fd.into_raw_fd()
    }
}

impl fmt::Debug for PlatformHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformHandle")
            .field("fd", &self.fd.as_raw_fd())
            .finish()
    }
}
