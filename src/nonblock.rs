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

//! Non-blocking device abstraction.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;

/// Result of a single non-blocking I/O syscall.
#[derive(Debug)]
pub enum IoStatus {
    /// Some bytes were transferred.
    Success(usize),
    /// The call would block (`EAGAIN`, `EWOULDBLOCK`) or was interrupted (`EINTR`).
    WouldBlock,
    /// Zero bytes were transferred: the flow has ended.
    Shutdown,
    Err(io::Error),
}

impl IoStatus {
    pub fn classify(res: io::Result<usize>) -> Self {
        match res {
            Ok(0) => IoStatus::Shutdown,
            Ok(len) => IoStatus::Success(len),
            Err(err) if is_retry(&err) => IoStatus::WouldBlock,
            Err(err) => IoStatus::Err(err),
        }
    }
}

/// Whether an error means "no progress now, try again on the next readiness notification".
pub fn is_retry(err: &io::Error) -> bool {
    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted)
}

/// Byte stream device which can be read from and written to in a non-blocking way.
pub trait Device: Read + Write + AsRawFd {
    /// Takes the pending socket-level error (`SO_ERROR`), if any.
    fn pending_error(&self) -> Option<i32>;

    /// Shuts down both halves of the device.
    fn shutdown(&self) -> io::Result<()>;

    fn read_nonblocking(&mut self, buf: &mut [u8]) -> IoStatus { IoStatus::classify(self.read(buf)) }

    fn write_nonblocking(&mut self, buf: &[u8]) -> IoStatus {
        if buf.is_empty() {
            return IoStatus::Success(0);
        }
        IoStatus::classify(self.write(buf))
    }
}

impl Device for TcpStream {
    fn pending_error(&self) -> Option<i32> {
        self.take_error().ok().flatten().and_then(|err| err.raw_os_error())
    }

    fn shutdown(&self) -> io::Result<()> { TcpStream::shutdown(self, Shutdown::Both) }
}

impl Device for UnixStream {
    fn pending_error(&self) -> Option<i32> {
        self.take_error().ok().flatten().and_then(|err| err.raw_os_error())
    }

    fn shutdown(&self) -> io::Result<()> { UnixStream::shutdown(self, Shutdown::Both) }
}
