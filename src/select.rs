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

//! Select-driven reader and writer: exactly one non-blocking syscall per readiness notification.

use std::io;

use crate::error::{IoError, IoFailure, IoWarning};
use crate::nonblock::{Device, IoStatus};
use crate::poller::Events;

/// Reader performing one non-blocking read per readability notification.
#[derive(Clone, Debug)]
pub struct SelectReader {
    buf: Box<[u8]>,
    received: u64,
}

impl SelectReader {
    /// # Panics
    ///
    /// If `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "read buffer must not be empty");
        SelectReader {
            buf: vec![0u8; capacity].into_boxed_slice(),
            received: 0,
        }
    }

    pub fn capacity(&self) -> usize { self.buf.len() }

    /// Total bytes received by this reader.
    pub fn received(&self) -> u64 { self.received }

    /// Performs a single read syscall into `buf`.
    ///
    /// Returns the number of bytes read; zero means no data is available right now (`EAGAIN`,
    /// `EWOULDBLOCK`, `EINTR`) and the caller should wait for the next notification.
    ///
    /// # Errors
    ///
    /// In the order of precedence when nothing was read:
    /// - [`IoError`] if the socket has a pending device error;
    /// - [`IoWarning`] if the events carry a hang-up flag;
    /// - [`IoError`] for any read error other than a retry condition;
    /// - [`IoWarning`] if the read returned zero bytes: the flow has ended.
    ///
    /// # Panics
    ///
    /// If `buf` is empty.
    pub fn read_into<D: Device + ?Sized>(
        device: &mut D,
        events: Events,
        buf: &mut [u8],
    ) -> Result<usize, IoFailure> {
        assert!(!buf.is_empty(), "read buffer must not be empty");
        let fd = device.as_raw_fd();
        let status = match device.read_nonblocking(buf) {
            IoStatus::Success(len) => return Ok(len),
            status => status,
        };

        IoError::check_device_error(device)?;
        if events.is_hangup() {
            return Err(IoWarning::new(fd, "connection hung up").into());
        }
        match status {
            IoStatus::WouldBlock => Ok(0),
            IoStatus::Err(err) => Err(IoError::from_io(fd, &err, "read failure").into()),
            IoStatus::Shutdown | IoStatus::Success(_) => {
                Err(IoWarning::new(fd, "end of flow whilst reading").into())
            }
        }
    }

    /// Reads into the internal buffer and hands the received bytes to `consume`. The consumer is
    /// not called if nothing was read.
    pub fn read<D, F>(
        &mut self,
        device: &mut D,
        events: Events,
        consume: F,
    ) -> Result<usize, IoFailure>
    where
        D: Device + ?Sized,
        F: FnOnce(&[u8]) -> Result<(), IoFailure>,
    {
        let len = Self::read_into(device, events, &mut self.buf)?;
        if len > 0 {
            #[cfg(feature = "log")]
            log::trace!(target: "transmit", "Received {len} bytes from {}", device.as_raw_fd());
            self.received += len as u64;
            consume(&self.buf[..len])?;
        }
        Ok(len)
    }
}

/// Writer flushing a pending buffer with one non-blocking write per writability notification.
///
/// The writer does not own the buffer: it keeps the send cursor inside the buffer passed to
/// [`Self::write`], which must stay the same until the writer reports it flushed.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct SelectWriter {
    cursor: usize,
    sent: u64,
}

impl SelectWriter {
    pub fn new() -> Self { default!() }

    /// Total bytes sent by this writer.
    pub fn sent(&self) -> u64 { self.sent }

    /// A buffer is partially flushed.
    pub fn is_flushing(&self) -> bool { self.cursor > 0 }

    /// Forgets the partially flushed buffer.
    pub fn reset(&mut self) { self.cursor = 0 }

    /// Writes as much of the unsent part of `data` as the device accepts in a single call,
    /// invoking `on_sent` with exactly the bytes sent.
    ///
    /// Returns `true` once `data` was flushed in full (the send cursor then returns to zero),
    /// `false` if the caller must wait for the next writability notification.
    ///
    /// # Errors
    ///
    /// Mirrors [`SelectReader::read_into`]: device error, hang-up, hard write error, zero-byte
    /// write.
    pub fn write<D, F>(
        &mut self,
        device: &mut D,
        events: Events,
        data: &[u8],
        on_sent: F,
    ) -> Result<bool, IoFailure>
    where
        D: Device + ?Sized,
        F: FnOnce(&[u8]),
    {
        assert!(self.cursor <= data.len(), "writer buffer has changed while being flushed");
        if self.cursor == data.len() {
            self.cursor = 0;
            return Ok(true);
        }

        let fd = device.as_raw_fd();
        let pending = &data[self.cursor..];
        let status = match device.write_nonblocking(pending) {
            IoStatus::Success(len) => {
                on_sent(&pending[..len]);
                self.cursor += len;
                self.sent += len as u64;
                #[cfg(feature = "log")]
                log::trace!(target: "transmit", "Sent {len} of {} pending bytes to {fd}", pending.len());
                if self.cursor < data.len() {
                    return Ok(false);
                }
                self.cursor = 0;
                return Ok(true);
            }
            status => status,
        };

        IoError::check_device_error(device)?;
        if events.is_hangup() {
            return Err(IoWarning::new(fd, "connection hung up").into());
        }
        match status {
            IoStatus::WouldBlock => Ok(false),
            IoStatus::Err(err) => Err(IoError::from_io(fd, &err, "write failure").into()),
            IoStatus::Shutdown | IoStatus::Success(_) => Err(IoError::with_kind(
                fd,
                io::ErrorKind::WriteZero,
                "end of flow whilst writing",
            )
            .into()),
        }
    }
}
