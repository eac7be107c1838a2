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

//! Connection handlers: a socket accepted from a listener together with the protocol state
//! machine running over it.

use std::fmt::{Debug, Display};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};

use crate::error::{IoError, IoFailure, DETACHED_FD};
use crate::nonblock::{is_retry, Device};
use crate::poller::{Events, IoType};
use crate::pool::Recycle;

/// Listening socket handing out non-blocking connected streams.
pub trait Listen: AsRawFd {
    type Stream: Device;
    type Addr: Clone + Display;

    fn accept_nonblocking(&self) -> io::Result<(Self::Stream, Self::Addr)>;
}

impl Listen for TcpListener {
    type Stream = TcpStream;
    type Addr = SocketAddr;

    fn accept_nonblocking(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, addr) = self.accept()?;
        stream.set_nonblocking(true)?;
        Ok((stream, addr))
    }
}

impl Listen for UnixListener {
    type Stream = UnixStream;
    type Addr = String;

    fn accept_nonblocking(&self) -> io::Result<(UnixStream, String)> {
        let (stream, addr) = self.accept()?;
        stream.set_nonblocking(true)?;
        let addr = addr
            .as_pathname()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "unnamed".to_owned());
        Ok((stream, addr))
    }
}

/// What the connection should do after an event was handled.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
pub enum Flow {
    #[display("continue")]
    Continue,
    #[display("close")]
    Close,
}

/// Application-specific logic run over a connected socket.
pub trait Protocol {
    /// Readiness the protocol waits for in its current state.
    fn interests(&self) -> IoType;

    /// Called once the socket is accepted, before any event is delivered.
    fn connected(&mut self, _fd: RawFd) {}

    /// Handles a readiness notification. Errors are caught by the [`Connection`], which then
    /// finalizes itself.
    fn handle_connection<D: Device + ?Sized>(
        &mut self,
        device: &mut D,
        events: Events,
    ) -> Result<Flow, IoFailure>;

    /// Input which was already taken from the socket and can make progress without waiting for
    /// readiness. While it returns `true` the handler is dispatched again with empty [`Events`];
    /// it must turn `false` once the pending input is handled.
    fn has_pending(&self) -> bool { false }

    /// Drops all the state of the previous connection.
    fn reset(&mut self);

    /// Notification about a failure which is about to finalize the connection.
    fn on_error(&mut self, _failure: &IoFailure) {}
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Display)]
pub enum ConnectionState {
    #[default]
    #[display("idle")]
    Idle,
    #[display("connected")]
    Connected,
    #[display("finalizing")]
    Finalizing,
}

/// Non-mutating view of a connection for diagnostics.
pub trait ConnectionInfo {
    /// Socket descriptor, [`DETACHED_FD`] unless connected.
    fn fd(&self) -> RawFd;
    fn remote(&self) -> Option<String>;
    fn has_io_error(&self) -> bool;
    fn state(&self) -> ConnectionState;

    /// Appends a one-line summary `fd=<n>, remote=<addr>, ioerr=<bool>`.
    fn format_info(&self, out: &mut String) {
        let remote = self.remote().unwrap_or_else(|| "-".to_owned());
        out.push_str(&format!("fd={}, remote={remote}, ioerr={}", self.fd(), self.has_io_error()));
    }
}

/// Outcome of [`Connection::assign`].
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
pub enum Assignment {
    #[display("connected")]
    Connected,
    /// No connection is waiting on the listener.
    #[display("pending")]
    Pending,
    /// Accepting has failed; the failure went through [`Connection::error`] and the handler is
    /// finalized.
    #[display("failed")]
    Failed,
}

/// External hook run by [`Connection::finalize`], usually returning the handler to its pool.
pub type Finalizer = Box<dyn FnMut(RawFd) -> Result<(), IoFailure> + Send>;

pub struct Connection<L: Listen, P: Protocol> {
    state: ConnectionState,
    stream: Option<L::Stream>,
    remote: Option<L::Addr>,
    fd: RawFd,
    io_error: bool,
    finalized: bool,
    protocol: P,
    finalizer: Option<Finalizer>,
    last_error: Option<IoFailure>,
}

impl<L: Listen, P: Protocol + Debug> Debug for Connection<L, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("fd", &self.fd)
            .field("remote", &self.remote.as_ref().map(|addr| addr.to_string()))
            .field("io_error", &self.io_error)
            .field("protocol", &self.protocol)
            .finish()
    }
}

impl<L: Listen, P: Protocol> Connection<L, P> {
    pub fn new(protocol: P) -> Self {
        Connection {
            state: ConnectionState::Idle,
            stream: None,
            remote: None,
            fd: DETACHED_FD,
            io_error: false,
            finalized: false,
            protocol,
            finalizer: None,
            last_error: None,
        }
    }

    pub fn with_finalizer(
        mut self,
        finalizer: impl FnMut(RawFd) -> Result<(), IoFailure> + Send + 'static,
    ) -> Self {
        self.finalizer = Some(Box::new(finalizer));
        self
    }

    pub fn is_connected(&self) -> bool { self.state == ConnectionState::Connected }

    pub fn protocol(&self) -> &P { &self.protocol }

    pub fn protocol_mut(&mut self) -> &mut P { &mut self.protocol }

    pub fn stream(&self) -> Option<&L::Stream> { self.stream.as_ref() }

    pub fn remote_addr(&self) -> Option<&L::Addr> { self.remote.as_ref() }

    /// Failure which caused the last finalization, if any.
    pub fn last_error(&self) -> Option<&IoFailure> { self.last_error.as_ref() }

    pub fn has_pending(&self) -> bool { self.is_connected() && self.protocol.has_pending() }

    /// Interests to register for the socket; none unless connected.
    pub fn interests(&self) -> IoType {
        if self.is_connected() {
            self.protocol.interests()
        } else {
            IoType::none()
        }
    }

    /// Accepts a pending connection from the listener.
    ///
    /// # Panics
    ///
    /// If the handler is already connected.
    pub fn assign(&mut self, listener: &L) -> Assignment {
        assert_eq!(
            self.state,
            ConnectionState::Idle,
            "connection handler is already assigned to fd {}",
            self.fd
        );

        match listener.accept_nonblocking() {
            Ok((stream, remote)) => {
                self.fd = stream.as_raw_fd();
                #[cfg(feature = "log")]
                log::debug!(target: "connection", "Accepted connection {} from {remote}", self.fd);
                self.stream = Some(stream);
                self.remote = Some(remote);
                self.state = ConnectionState::Connected;
                self.io_error = false;
                self.finalized = false;
                self.last_error = None;
                self.protocol.reset();
                self.protocol.connected(self.fd);
                Assignment::Connected
            }
            Err(err) if is_retry(&err) => Assignment::Pending,
            Err(err) => {
                let failure = IoError::from_io(listener.as_raw_fd(), &err, "accept failure");
                self.error(failure.into());
                self.finalize();
                Assignment::Failed
            }
        }
    }

    /// Dispatches an event to the protocol. Once [`Flow::Close`] is returned the handler is
    /// already finalized.
    ///
    /// # Panics
    ///
    /// If the handler is not connected.
    pub fn handle(&mut self, events: Events) -> Flow {
        assert!(self.is_connected(), "event {events} for a connection handler which is {}", self.state);
        let Some(stream) = self.stream.as_mut() else {
            unreachable!("connected handler always has a stream")
        };

        match self.protocol.handle_connection(stream, events) {
            Ok(Flow::Continue) => Flow::Continue,
            Ok(Flow::Close) => {
                self.finalize();
                Flow::Close
            }
            Err(failure) => {
                self.error(failure);
                self.finalize();
                Flow::Close
            }
        }
    }

    /// Error-reporting contract: logs the failure and records whether the OS has already torn
    /// the socket down.
    #[cfg_attr(not(feature = "log"), allow(unused_variables))]
    pub fn error(&mut self, failure: IoFailure) {
        match &failure {
            IoFailure::Warning(warning) => {
                #[cfg(feature = "log")]
                log::debug!(target: "connection", "Connection {} has ended: {warning}", self.fd);
            }
            IoFailure::Error(err) => {
                #[cfg(feature = "log")]
                log::error!(target: "connection", "Connection {} has failed at {}: {err}", self.fd, err.location());
                self.io_error = true;
            }
        }
        self.protocol.on_error(&failure);
        self.last_error = Some(failure);
    }

    /// Closes the socket and runs the finalizer. Repeated calls do nothing until the handler is
    /// recycled.
    pub fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        let fd = self.fd;

        if let Some(stream) = self.stream.take() {
            self.state = ConnectionState::Finalizing;
            if !self.io_error {
                if let Err(err) = stream.shutdown() {
                    if err.raw_os_error() != Some(libc::ENOTCONN) {
                        self.error(IoError::from_io(fd, &err, "shutdown failure").into());
                    }
                }
            }
            #[cfg(feature = "log")]
            log::debug!(target: "connection", "Connection {fd} is closed");
        }
        self.state = ConnectionState::Idle;
        self.fd = DETACHED_FD;

        let res = self.finalizer.as_mut().map(|finalizer| finalizer(fd));
        if let Some(Err(failure)) = res {
            self.error(failure);
        }
    }
}

impl<L: Listen, P: Protocol> Recycle for Connection<L, P> {
    fn recycle(&mut self) {
        self.finalize();
        self.remote = None;
        self.io_error = false;
        self.finalized = false;
        self.last_error = None;
        self.protocol.reset();
    }
}

impl<L: Listen, P: Protocol> ConnectionInfo for Connection<L, P> {
    fn fd(&self) -> RawFd { self.fd }
    fn remote(&self) -> Option<String> { self.remote.as_ref().map(|addr| addr.to_string()) }
    fn has_io_error(&self) -> bool { self.io_error }
    fn state(&self) -> ConnectionState { self.state }
}
