// Resumable chunked array transport over non-blocking sockets.
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2021-2025 by
//     Dr. Maxim Orlovsky <orlovsky@ubideco.org>
//     Alexis Sellier <alexis@cloudhead.io>
//
// Copyright 2022-2025 UBIDECO Labs, InDCS, Lugano, Switzerland. All Rights reserved.
// Copyright 2021-2023 Alexis Sellier <alexis@cloudhead.io>. All Rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

//! I/O failure taxonomy.
//!
//! Every failure on the I/O path is either an [`IoWarning`] (the peer has gone away gracefully:
//! end of flow, hang-up) or an [`IoError`] (a hard, errno-reported failure). Both are plain values
//! returned through [`IoFailure`]; there is no shared failure object which could be mutated while
//! still being inspected by some caller.

use std::fmt::{self, Display, Formatter};
use std::io;
use std::os::unix::io::RawFd;
use std::panic::Location;

use crate::nonblock::Device;

/// Descriptor value used for failures which are not bound to any file descriptor (in-memory
/// streams, decoders).
pub const DETACHED_FD: RawFd = -1;

/// Graceful end of the data flow on a descriptor.
#[derive(Clone, Debug)]
pub struct IoWarning {
    fd: RawFd,
    message: &'static str,
    location: &'static Location<'static>,
}

impl IoWarning {
    #[track_caller]
    pub fn new(fd: RawFd, message: &'static str) -> Self {
        IoWarning {
            fd,
            message,
            location: Location::caller(),
        }
    }

    pub fn fd(&self) -> RawFd { self.fd }
    pub fn message(&self) -> &'static str { self.message }
    pub fn location(&self) -> &'static Location<'static> { self.location }
}

impl Display for IoWarning {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} (fd {})", self.message, self.fd)
    }
}

impl std::error::Error for IoWarning {}

/// Hard I/O failure, usually reported by the operating system through `errno`.
#[derive(Clone, Debug)]
pub struct IoError {
    fd: RawFd,
    errnum: i32,
    kind: io::ErrorKind,
    message: &'static str,
    location: &'static Location<'static>,
}

impl IoError {
    /// Constructs an error from an explicit `errno` value. Zero means that no system error is
    /// associated with the failure.
    #[track_caller]
    pub fn with_errno(fd: RawFd, errnum: i32, message: &'static str) -> Self {
        let kind = if errnum == 0 {
            io::ErrorKind::Other
        } else {
            io::Error::from_raw_os_error(errnum).kind()
        };
        IoError {
            fd,
            errnum,
            kind,
            message,
            location: Location::caller(),
        }
    }

    /// Constructs an error which carries no system error number but a specific [`io::ErrorKind`].
    #[track_caller]
    pub fn with_kind(fd: RawFd, kind: io::ErrorKind, message: &'static str) -> Self {
        IoError {
            fd,
            errnum: 0,
            kind,
            message,
            location: Location::caller(),
        }
    }

    #[track_caller]
    pub fn from_io(fd: RawFd, err: &io::Error, message: &'static str) -> Self {
        IoError {
            fd,
            errnum: err.raw_os_error().unwrap_or(0),
            kind: err.kind(),
            message,
            location: Location::caller(),
        }
    }

    /// Queries the pending socket-level error of the device (`SO_ERROR`).
    ///
    /// # Errors
    ///
    /// Only if the device has an error pending; otherwise this is a no-op.
    #[track_caller]
    pub fn check_device_error<D: Device + ?Sized>(device: &D) -> Result<(), IoError> {
        match device.pending_error() {
            None => Ok(()),
            Some(errnum) => {
                Err(IoError::with_errno(device.as_raw_fd(), errnum, "socket device error"))
            }
        }
    }

    pub fn fd(&self) -> RawFd { self.fd }
    pub fn errnum(&self) -> i32 { self.errnum }
    pub fn kind(&self) -> io::ErrorKind { self.kind }
    pub fn message(&self) -> &'static str { self.message }
    pub fn location(&self) -> &'static Location<'static> { self.location }

    /// Human-readable description of the system error.
    pub fn description(&self) -> String {
        if self.errnum == 0 {
            io::Error::from(self.kind).to_string()
        } else {
            io::Error::from_raw_os_error(self.errnum).to_string()
        }
    }
}

impl Display for IoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} (fd {}): {}", self.message, self.fd, self.description())
    }
}

impl std::error::Error for IoError {}

/// Any failure happening on the I/O path.
#[derive(Clone, Debug, Display, Error, From)]
pub enum IoFailure {
    /// Graceful end of flow. The connection must stop reading but this is not a failure.
    #[from]
    #[display(inner)]
    Warning(IoWarning),

    /// Hard failure; the socket must be considered shut down by the OS.
    #[from]
    #[display(inner)]
    Error(IoError),
}

impl IoFailure {
    pub fn is_warning(&self) -> bool { matches!(self, IoFailure::Warning(_)) }

    pub fn fd(&self) -> RawFd {
        match self {
            IoFailure::Warning(warning) => warning.fd(),
            IoFailure::Error(err) => err.fd(),
        }
    }

    pub fn location(&self) -> &'static Location<'static> {
        match self {
            IoFailure::Warning(warning) => warning.location(),
            IoFailure::Error(err) => err.location(),
        }
    }
}

/// Errors of the connection pool.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum PoolError {
    /// connection pool is exhausted: all {0} items are busy.
    Exhausted(usize),
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nonblock::mock::ScriptedDevice;

    #[test]
    fn errno_description() {
        let err = IoError::with_errno(7, libc::ECONNRESET, "read failure");
        assert_eq!(err.errnum(), libc::ECONNRESET);
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(err.fd(), 7);
        assert!(err.to_string().starts_with("read failure (fd 7): "));
        assert!(err.location().file().ends_with("error.rs"));
    }

    #[test]
    fn device_error_is_noop_without_pending_error() {
        let device = ScriptedDevice::new();
        assert!(IoError::check_device_error(&device).is_ok());

        device.set_pending_error(libc::ETIMEDOUT);
        let err = IoError::check_device_error(&device).unwrap_err();
        assert_eq!(err.errnum(), libc::ETIMEDOUT);
        assert_eq!(err.fd(), device.fd());
    }

    #[test]
    fn failure_classification() {
        let warning = IoFailure::from(IoWarning::new(3, "end of flow whilst reading"));
        assert!(warning.is_warning());
        assert_eq!(warning.fd(), 3);
        assert_eq!(warning.to_string(), "end of flow whilst reading (fd 3)");

        let io = io::Error::from_raw_os_error(libc::EPIPE);
        let err = IoFailure::from(IoError::from_io(4, &io, "write failure"));
        assert!(!err.is_warning());
        assert_eq!(err.fd(), 4);
    }

    #[test]
    fn pool_error_display() {
        assert!(PoolError::Exhausted(8).to_string().contains("all 8 items are busy"));
    }
}
