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

//! Poll engines delivering readiness notifications for file descriptors.

#[cfg(feature = "popol")]
pub mod popol;

use std::fmt::{self, Display, Formatter};
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;
use std::{io, ops};

/// Interest of a descriptor in I/O readiness.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Default)]
pub struct IoType {
    /// Wait for the descriptor to have data to read.
    pub read: bool,
    /// Wait for the descriptor to be ready for write operations.
    pub write: bool,
}

impl IoType {
    pub fn none() -> Self {
        Self {
            read: false,
            write: false,
        }
    }

    pub fn read_only() -> Self {
        Self {
            read: true,
            write: false,
        }
    }

    pub fn write_only() -> Self {
        Self {
            read: false,
            write: true,
        }
    }

    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
        }
    }

    pub fn is_none(self) -> bool { !self.read && !self.write }
    pub fn is_read_only(self) -> bool { self.read && !self.write }
    pub fn is_write_only(self) -> bool { !self.read && self.write }
    pub fn is_read_write(self) -> bool { self.read && self.write }
}

impl ops::Not for IoType {
    type Output = Self;

    fn not(self) -> Self::Output {
        Self {
            read: !self.read,
            write: !self.write,
        }
    }
}

impl Display for IoType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("none")
        } else if self.is_read_write() {
            f.write_str("read-write")
        } else if self.read {
            f.write_str("read")
        } else {
            f.write_str("write")
        }
    }
}

/// Events fired for a descriptor by a single poll call.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Default)]
pub struct Events {
    pub readable: bool,
    pub writable: bool,
    /// Peer has closed its writing half (`POLLRDHUP`).
    pub read_hangup: bool,
    /// Descriptor hang up (`POLLHUP`).
    pub hangup: bool,
    /// Error condition or invalid descriptor (`POLLERR`, `POLLNVAL`).
    pub error: bool,
}

impl Events {
    pub fn readable() -> Self {
        Events {
            readable: true,
            ..default!()
        }
    }

    pub fn writable() -> Self {
        Events {
            writable: true,
            ..default!()
        }
    }

    /// Any of the hang-up flags is set.
    pub fn is_hangup(self) -> bool { self.hangup || self.read_hangup }
}

impl Display for Events {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let flags = [
            (self.readable, "readable"),
            (self.writable, "writable"),
            (self.read_hangup, "read-hangup"),
            (self.hangup, "hangup"),
            (self.error, "error"),
        ];
        let mut first = true;
        for (_, name) in flags.into_iter().filter(|(set, _)| *set) {
            if !first {
                f.write_str("|")?;
            }
            f.write_str(name)?;
            first = false;
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}

/// Sending half of a waker which interrupts a blocking poll call from another thread.
pub trait WakerSend: Send + Sync + Clone {
    fn wake(&self) -> io::Result<()>;
}

/// Receiving half of a waker; it is registered in the poll engine like any other descriptor.
pub trait WakerRecv: AsRawFd + Send {
    fn reset(&self);
}

pub trait Waker {
    type Send: WakerSend;
    type Recv: WakerRecv;

    fn pair() -> Result<(Self::Send, Self::Recv), io::Error>;
}

/// Waker built on a pair of connected non-blocking unix sockets.
pub struct SocketWaker;

#[derive(Clone)]
pub struct SocketWakerSend(Arc<UnixStream>);

pub struct SocketWakerRecv(UnixStream);

impl Waker for SocketWaker {
    type Send = SocketWakerSend;
    type Recv = SocketWakerRecv;

    fn pair() -> Result<(Self::Send, Self::Recv), io::Error> {
        let (writer, reader) = UnixStream::pair()?;
        writer.set_nonblocking(true)?;
        reader.set_nonblocking(true)?;
        Ok((SocketWakerSend(Arc::new(writer)), SocketWakerRecv(reader)))
    }
}

impl WakerSend for SocketWakerSend {
    fn wake(&self) -> io::Result<()> {
        match (&*self.0).write(&[0x1]) {
            Ok(_) => Ok(()),
            // The socket buffer is full, so the reactor has pending wake-ups already.
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl WakerRecv for SocketWakerRecv {
    fn reset(&self) {
        let mut buf = [0u8; 64];
        while let Ok(len) = (&self.0).read(&mut buf) {
            if len == 0 {
                break;
            }
        }
    }
}

impl AsRawFd for SocketWakerRecv {
    fn as_raw_fd(&self) -> RawFd { self.0.as_raw_fd() }
}

/// Poll engine (the "select dispatcher"): keeps a set of descriptors with their interests and
/// blocks until some of them get ready. Fired events are retrieved through the iterator
/// interface.
pub trait Poll
where Self: Send + Iterator<Item = (RawFd, Events)>
{
    type Waker: Waker;

    fn register_waker(&mut self, waker: &<Self::Waker as Waker>::Recv);
    fn register(&mut self, fd: RawFd, interest: IoType);
    /// Removes the descriptor, including the events fired for it which were not consumed yet.
    fn unregister(&mut self, fd: RawFd);
    fn set_interest(&mut self, fd: RawFd, interest: IoType) -> bool;

    /// Blocks for at most `timeout` and returns the number of new events.
    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize>;
}
