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

//! Drivers moving logical units of arrays between chunk sources or destinations and a device.
//!
//! Both drivers are resumable: every call handles a single readiness notification, performs at
//! most one syscall on the device and keeps all the progress inside the driver.

use std::os::unix::io::RawFd;

use crate::cursor::WriteCursor;
use crate::dest::ChunkDest;
use crate::error::{IoError, IoFailure, DETACHED_FD};
use crate::nonblock::Device;
use crate::poller::Events;
use crate::select::{SelectReader, SelectWriter};
use crate::serializer::{
    ChunkDeserializer, ChunkSerializer, Compression, Parsed, MAX_ARRAY_LEN,
};
use crate::source::ChunkSource;
use crate::terminator::{Terminator, TransmitId, TransmitState};

pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024;
pub const DEFAULT_MAX_ARRAY_LEN: usize = 64 * 1024 * 1024;

/// Buffer sizes and wire options shared by both sides of a connection.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct TransmitConfig {
    /// Capacity of the output buffer flushed to the device, and of the read buffer.
    pub buffer_size: usize,
    /// Largest slice requested from a chunk source at once.
    pub chunk_size: usize,
    pub compression: Compression,
    /// Arrays announced longer than this are rejected by the receiver.
    pub max_array_len: usize,
}

impl Default for TransmitConfig {
    fn default() -> Self {
        TransmitConfig {
            buffer_size: DEFAULT_BUFFER_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            compression: Compression::None,
            max_array_len: DEFAULT_MAX_ARRAY_LEN,
        }
    }
}

impl TransmitConfig {
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }
}

/// Sends one logical unit after another from a [`ChunkSource`] to a device.
#[derive(Debug)]
pub struct ArraysTransmitter {
    id: TransmitId,
    terminator: Terminator,
    state: TransmitState,
    serializer: ChunkSerializer,
    cursor: WriteCursor,
    writer: SelectWriter,
    buffer: Box<[u8]>,
    chunk: Box<[u8]>,
    chunk_len: usize,
    chunk_pending: bool,
    array_len: usize,
    payload_done: usize,
    arrays_sent: usize,
    flushing: bool,
    terminating: bool,
    terminated: bool,
}

impl ArraysTransmitter {
    /// # Panics
    ///
    /// If the buffer or the chunk size of the configuration is zero.
    pub fn new(config: TransmitConfig) -> Self {
        assert!(config.buffer_size > 0, "output buffer must not be empty");
        assert!(config.chunk_size > 0, "chunk size must not be zero");
        ArraysTransmitter {
            id: 0,
            terminator: Terminator::SingleArray,
            state: TransmitState::Initial,
            serializer: ChunkSerializer::new(config.compression),
            cursor: WriteCursor::new(),
            writer: SelectWriter::new(),
            buffer: vec![0u8; config.buffer_size].into_boxed_slice(),
            chunk: vec![0u8; config.chunk_size].into_boxed_slice(),
            chunk_len: 0,
            chunk_pending: false,
            array_len: 0,
            payload_done: 0,
            arrays_sent: 0,
            flushing: false,
            terminating: false,
            terminated: false,
        }
    }

    pub fn state(&self) -> TransmitState { self.state }

    pub fn id(&self) -> TransmitId { self.id }

    pub fn terminator(&self) -> Terminator { self.terminator }

    /// Arrays of the current unit fully handed to the serializer.
    pub fn arrays_sent(&self) -> usize { self.arrays_sent }

    /// Total bytes written to the device.
    pub fn bytes_sent(&self) -> u64 { self.writer.sent() }

    /// A unit was started and not finished yet.
    pub fn wants_write(&self) -> bool {
        matches!(self.state, TransmitState::GetArray | TransmitState::TransmitArray)
    }

    /// Starts a new unit, resetting the source.
    ///
    /// # Panics
    ///
    /// If the previous unit is still being transmitted.
    pub fn start<S: ChunkSource + ?Sized>(
        &mut self,
        id: TransmitId,
        terminator: Terminator,
        source: &mut S,
    ) {
        assert!(!self.wants_write(), "previous transmission {} is not finished", self.id);
        source.reset();
        self.serializer.reset();
        self.cursor.reset();
        self.writer.reset();
        self.id = id;
        self.terminator = terminator;
        self.state = TransmitState::GetArray;
        self.chunk_len = 0;
        self.chunk_pending = false;
        self.array_len = 0;
        self.payload_done = 0;
        self.arrays_sent = 0;
        self.flushing = false;
        self.terminating = false;
        self.terminated = false;
        #[cfg(feature = "log")]
        log::debug!(target: "transmit", "Starting {terminator} transmission {id}");
    }

    /// Abandons the current unit; the source has to be reset by the next [`Self::start`].
    pub fn reset(&mut self) {
        self.state = TransmitState::Initial;
        self.serializer.reset();
        self.cursor.reset();
        self.writer.reset();
        self.chunk_pending = false;
        self.flushing = false;
        self.terminating = false;
        self.terminated = false;
    }

    /// Handles a writability notification: fills the output buffer from the source and flushes
    /// it to the device with at most one write call.
    ///
    /// # Errors
    ///
    /// Device failures, source failures, and units which can't be terminated properly: a list of
    /// pairs ending after a key or a fixed unit whose source ran dry.
    ///
    /// # Panics
    ///
    /// If no unit was started.
    pub fn on_writable<D, S>(
        &mut self,
        device: &mut D,
        events: Events,
        source: &mut S,
    ) -> Result<TransmitState, IoFailure>
    where
        D: Device + ?Sized,
        S: ChunkSource + ?Sized,
    {
        assert_ne!(self.state, TransmitState::Initial, "transmission was not started");
        let fd = device.as_raw_fd();
        let mut wrote = false;

        loop {
            if self.state == TransmitState::Finished {
                return Ok(self.state);
            }

            if self.flushing {
                if wrote {
                    return Ok(self.state);
                }
                wrote = true;
                if !self.flush(device, events)? {
                    return Ok(self.state);
                }
                self.flushing = false;
            }

            if self.terminated {
                if self.cursor.buffer > 0 {
                    self.flushing = true;
                    continue;
                }
                #[cfg(feature = "log")]
                log::debug!(
                    target: "transmit",
                    "Transmission {} of {} arrays to {fd} is complete",
                    self.id,
                    self.arrays_sent
                );
                self.state = TransmitState::Finished;
                return Ok(self.state);
            }

            if self.terminating {
                if self.serializer.terminate(
                    self.terminator.termination(),
                    &mut self.buffer,
                    &mut self.cursor,
                ) {
                    self.flushing = true;
                } else {
                    self.terminated = true;
                }
                continue;
            }

            match self.state {
                TransmitState::GetArray => {
                    if self.terminator.is_complete(self.arrays_sent) {
                        self.terminating = true;
                        continue;
                    }
                    let Some(len) = source.read_array_length(self.id)? else {
                        return Ok(self.await_source());
                    };
                    if source.end_of_list() {
                        self.check_list_end(fd)?;
                        self.terminating = true;
                        continue;
                    }
                    if len > MAX_ARRAY_LEN {
                        return Err(IoError::with_errno(
                            fd,
                            libc::EMSGSIZE,
                            "source array does not fit into the wire format",
                        )
                        .into());
                    }
                    #[cfg(feature = "log")]
                    log::trace!(target: "transmit", "Sending array of {len} bytes to {fd}");
                    self.array_len = len;
                    self.payload_done = 0;
                    self.state = TransmitState::TransmitArray;
                }

                TransmitState::TransmitArray => {
                    if !self.chunk_pending {
                        let want = self.chunk.len().min(self.array_len - self.payload_done);
                        self.chunk_len = 0;
                        if want > 0 {
                            let got = source.get_next_chunk(self.id, &mut self.chunk[..want])?;
                            if got == 0 {
                                return Ok(self.await_source());
                            }
                            self.chunk_len = got;
                        }
                        self.chunk_pending = true;
                    }

                    let last = self.payload_done + self.chunk_len == self.array_len;
                    if self.serializer.process_chunk(
                        &self.chunk[..self.chunk_len],
                        self.array_len,
                        last,
                        &mut self.buffer,
                        &mut self.cursor,
                    ) {
                        self.flushing = true;
                        continue;
                    }
                    self.chunk_pending = false;
                    self.payload_done += self.chunk_len;
                    if last {
                        source.next_array();
                        self.arrays_sent += 1;
                        self.state = TransmitState::GetArray;
                    }
                }

                TransmitState::Initial | TransmitState::Finished => {
                    unreachable!("state is checked above")
                }
            }
        }
    }

    fn flush<D: Device + ?Sized>(&mut self, device: &mut D, events: Events) -> Result<bool, IoFailure> {
        let data = &self.buffer[..self.cursor.buffer];
        let flushed = self.writer.write(device, events, data, |_| ())?;
        if flushed {
            self.cursor.flushed();
        }
        Ok(flushed)
    }

    /// The source has nothing to give right now: whatever is buffered goes out on the next
    /// notification.
    fn await_source(&mut self) -> TransmitState {
        if self.cursor.buffer > 0 {
            self.flushing = true;
        }
        #[cfg(feature = "log")]
        log::trace!(target: "transmit", "Source of transmission {} is not ready", self.id);
        self.state
    }

    fn check_list_end(&self, fd: RawFd) -> Result<(), IoError> {
        if !self.terminator.is_list() {
            return Err(IoError::with_errno(
                fd,
                libc::ENODATA,
                "source ran dry before the unit was complete",
            ));
        }
        if !self.terminator.may_end_after(self.arrays_sent) {
            return Err(IoError::with_errno(
                fd,
                libc::EPROTO,
                "list of pairs ends in the middle of a pair",
            ));
        }
        Ok(())
    }
}

/// Receives one logical unit after another from a device into a [`ChunkDest`].
#[derive(Debug)]
pub struct ArraysReceiver {
    id: TransmitId,
    fd: RawFd,
    terminator: Terminator,
    state: TransmitState,
    reader: SelectReader,
    deserializer: ChunkDeserializer,
    backlog: Vec<u8>,
    arrays_received: usize,
}

impl ArraysReceiver {
    pub fn new(config: TransmitConfig) -> Self {
        ArraysReceiver {
            id: 0,
            fd: DETACHED_FD,
            terminator: Terminator::SingleArray,
            state: TransmitState::Initial,
            reader: SelectReader::with_capacity(config.buffer_size),
            deserializer: ChunkDeserializer::new(config.compression, config.max_array_len),
            backlog: Vec::new(),
            arrays_received: 0,
        }
    }

    pub fn state(&self) -> TransmitState { self.state }

    pub fn id(&self) -> TransmitId { self.id }

    pub fn arrays_received(&self) -> usize { self.arrays_received }

    /// Total bytes read from the device.
    pub fn bytes_received(&self) -> u64 { self.reader.received() }

    /// Bytes received past the end of the last finished unit.
    pub fn backlog(&self) -> &[u8] { &self.backlog }

    /// Whether leftover bytes wait to be decoded with [`Self::poll_backlog`].
    pub fn has_backlog(&self) -> bool { !self.backlog.is_empty() }

    pub fn is_receiving(&self) -> bool {
        matches!(self.state, TransmitState::GetArray | TransmitState::TransmitArray)
    }

    /// Starts receiving a new unit, resetting the destination. Bytes left over from the previous
    /// unit are kept.
    pub fn start<D: ChunkDest + ?Sized>(
        &mut self,
        id: TransmitId,
        terminator: Terminator,
        dest: &mut D,
    ) {
        dest.reset();
        self.deserializer.reset();
        self.id = id;
        self.terminator = terminator;
        self.state = TransmitState::GetArray;
        self.arrays_received = 0;
    }

    /// Drops all the progress including the leftover bytes.
    pub fn reset(&mut self) {
        self.state = TransmitState::Initial;
        self.fd = DETACHED_FD;
        self.deserializer.reset();
        self.backlog.clear();
        self.arrays_received = 0;
    }

    /// Handles a readability notification with at most one read call.
    ///
    /// Leftover bytes of the previous unit are decoded first; if they complete the unit, nothing
    /// is read from the device.
    ///
    /// # Panics
    ///
    /// If no unit was started.
    pub fn on_readable<Dev, D>(
        &mut self,
        device: &mut Dev,
        events: Events,
        dest: &mut D,
    ) -> Result<TransmitState, IoFailure>
    where
        Dev: Device + ?Sized,
        D: ChunkDest + ?Sized,
    {
        assert_ne!(self.state, TransmitState::Initial, "reception was not started");
        let fd = device.as_raw_fd();
        self.fd = fd;
        if self.state == TransmitState::Finished {
            return Ok(self.state);
        }
        if !self.backlog.is_empty() && self.process_backlog(fd, dest)? == TransmitState::Finished {
            return Ok(self.state);
        }

        let ArraysReceiver {
            reader, backlog, ..
        } = self;
        let len = reader.read(device, events, |data| {
            backlog.extend_from_slice(data);
            Ok(())
        })?;
        if len == 0 {
            return Ok(self.state);
        }
        self.process_backlog(fd, dest)
    }

    /// Decodes the leftover bytes without any syscall. No readiness notification comes for the
    /// bytes which have already been read from the device, so the owner must call this whenever
    /// [`Self::has_backlog`] returns `true` after a new unit was started.
    ///
    /// If the leftover is a part of the unit only, it is consumed entirely and the rest of the
    /// unit comes with [`Self::on_readable`].
    ///
    /// # Panics
    ///
    /// If no unit was started.
    pub fn poll_backlog<D: ChunkDest + ?Sized>(
        &mut self,
        dest: &mut D,
    ) -> Result<TransmitState, IoFailure> {
        assert_ne!(self.state, TransmitState::Initial, "reception was not started");
        if self.state == TransmitState::Finished || self.backlog.is_empty() {
            return Ok(self.state);
        }
        self.process_backlog(self.fd, dest)
    }

    fn process_backlog<D: ChunkDest + ?Sized>(
        &mut self,
        fd: RawFd,
        dest: &mut D,
    ) -> Result<TransmitState, IoFailure> {
        let mut used = 0;
        let res: Result<(), IoFailure> = loop {
            if self.state == TransmitState::Finished || used == self.backlog.len() {
                break Ok(());
            }
            let (len, parsed) = match self.deserializer.feed(&self.backlog[used..]) {
                Ok(res) => res,
                Err(err) => break Err(err.into_io_error(fd).into()),
            };
            used += len;
            match parsed {
                None => {}
                Some(Parsed::Array(array)) => {
                    #[cfg(feature = "log")]
                    log::trace!(target: "transmit", "Received array of {} bytes from {fd}", array.len());
                    if let Err(err) = dest.process_array(self.id, array) {
                        break Err(err);
                    }
                    self.arrays_received += 1;
                    if self.terminator.is_complete(self.arrays_received) {
                        if let Err(err) = self.complete(dest) {
                            break Err(err);
                        }
                    }
                }
                Some(Parsed::EndOfList) => {
                    if let Err(err) = self.check_list_end(fd) {
                        break Err(err.into());
                    }
                    if let Err(err) = self.complete(dest) {
                        break Err(err);
                    }
                }
            }
        };
        self.backlog.drain(..used);
        res?;

        if self.state != TransmitState::Finished {
            self.state = if self.deserializer.is_mid_array() {
                TransmitState::TransmitArray
            } else {
                TransmitState::GetArray
            };
        }
        Ok(self.state)
    }

    fn complete<D: ChunkDest + ?Sized>(&mut self, dest: &mut D) -> Result<(), IoFailure> {
        dest.finish(self.id, self.terminator.termination())?;
        self.state = TransmitState::Finished;
        #[cfg(feature = "log")]
        log::debug!(
            target: "transmit",
            "Reception {} of {} arrays is complete",
            self.id,
            self.arrays_received
        );
        Ok(())
    }

    fn check_list_end(&self, fd: RawFd) -> Result<(), IoError> {
        if !self.terminator.is_list() {
            return Err(IoError::with_errno(
                fd,
                libc::EPROTO,
                "unexpected end-of-list marker",
            ));
        }
        if !self.terminator.may_end_after(self.arrays_received) {
            return Err(IoError::with_errno(
                fd,
                libc::EPROTO,
                "list of pairs ends in the middle of a pair",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::os::unix::net::UnixStream;

    use super::*;
    use crate::dest::BufferDest;
    use crate::nonblock::mock::{ScriptedDevice, Step};
    use crate::serializer::encode;
    use crate::source::{BufferSource, DelegateSource, ListSource};
    use crate::terminator::Termination;

    fn config(buffer_size: usize, chunk_size: usize) -> TransmitConfig {
        TransmitConfig {
            buffer_size,
            chunk_size,
            ..default!()
        }
    }

    fn send_all<S: ChunkSource>(
        transmitter: &mut ArraysTransmitter,
        device: &mut ScriptedDevice,
        source: &mut S,
    ) -> Result<(), IoFailure> {
        for _ in 0..10_000 {
            if transmitter.on_writable(device, Events::writable(), source)? ==
                TransmitState::Finished
            {
                return Ok(());
            }
        }
        panic!("transmission has stalled");
    }

    fn arrays(items: &[&[u8]]) -> Vec<Vec<u8>> { items.iter().map(|a| a.to_vec()).collect() }

    #[test]
    fn single_array_through_small_buffer() {
        let mut device = ScriptedDevice::new();
        let mut source = BufferSource::new(b"HELLO".to_vec());
        let mut transmitter = ArraysTransmitter::new(config(4, 2));
        transmitter.start(1, Terminator::SingleArray, &mut source);
        send_all(&mut transmitter, &mut device, &mut source).unwrap();
        assert_eq!(
            device.written,
            encode(&arrays(&[b"HELLO"]), Termination::None, Compression::None)
        );
        assert_eq!(transmitter.arrays_sent(), 1);
        assert!(!transmitter.wants_write());
        // one write call per notification
        assert_eq!(device.write_calls, 3);
    }

    #[test]
    fn list_survives_partial_writes() {
        let items = arrays(&[b"first", b"", b"third array"]);
        let mut device = ScriptedDevice::new();
        for _ in 0..8 {
            device.push_write(Step::Accept(3)).push_write(Step::WouldBlock);
        }
        let mut source = ListSource::new(items.clone());
        let mut transmitter = ArraysTransmitter::new(config(7, 3));
        transmitter.start(2, Terminator::ArrayList, &mut source);
        send_all(&mut transmitter, &mut device, &mut source).unwrap();
        assert_eq!(device.written, encode(&items, Termination::EndOfList, Compression::None));
    }

    #[test]
    fn compressed_list_matches_encoder() {
        let items = vec![vec![b'a'; 1000], b"tail".to_vec()];
        let mut device = ScriptedDevice::new();
        let mut source = ListSource::new(items.clone());
        let mut transmitter =
            ArraysTransmitter::new(config(64, 100).with_compression(Compression::Lz4));
        transmitter.start(3, Terminator::ArrayList, &mut source);
        send_all(&mut transmitter, &mut device, &mut source).unwrap();
        assert_eq!(device.written, encode(&items, Termination::EndOfList, Compression::Lz4));
    }

    #[test]
    fn delegate_list_of_pairs() {
        let mut pairs = vec![(b"k2".to_vec(), b"v2".to_vec()), (b"k1".to_vec(), b"v1".to_vec())];
        let mut source = crate::source::PairDelegateSource::new(move |_| pairs.pop());
        let mut device = ScriptedDevice::new();
        let mut transmitter = ArraysTransmitter::new(config(16, 16));
        transmitter.start(4, Terminator::PairList, &mut source);
        send_all(&mut transmitter, &mut device, &mut source).unwrap();
        assert_eq!(
            device.written,
            encode(&arrays(&[b"k1", b"v1", b"k2", b"v2"]), Termination::EndOfPairList, Compression::None)
        );
    }

    #[test]
    fn pair_list_cut_after_key() {
        let mut source = ListSource::new(arrays(&[b"k1", b"v1", b"k2"]));
        let mut device = ScriptedDevice::new();
        let mut transmitter = ArraysTransmitter::new(config(16, 16));
        transmitter.start(5, Terminator::PairList, &mut source);
        let err = send_all(&mut transmitter, &mut device, &mut source).unwrap_err();
        match err {
            IoFailure::Error(err) => assert_eq!(err.errnum(), libc::EPROTO),
            IoFailure::Warning(_) => panic!("protocol violation reported as a warning"),
        }
    }

    #[test]
    fn fixed_pair_with_single_array() {
        let mut source = BufferSource::new(b"key".to_vec());
        let mut device = ScriptedDevice::new();
        let mut transmitter = ArraysTransmitter::new(config(16, 16));
        transmitter.start(6, Terminator::SinglePair, &mut source);
        let err = send_all(&mut transmitter, &mut device, &mut source).unwrap_err();
        assert!(!err.is_warning());
    }

    #[test]
    fn empty_delegate_list() {
        let mut source = DelegateSource::new(|_| None);
        let mut device = ScriptedDevice::new();
        let mut transmitter = ArraysTransmitter::new(config(16, 16));
        transmitter.start(7, Terminator::ArrayList, &mut source);
        send_all(&mut transmitter, &mut device, &mut source).unwrap();
        assert_eq!(device.written, u32::MAX.to_ne_bytes());
    }

    #[test]
    #[should_panic(expected = "not finished")]
    fn restart_while_sending() {
        let mut source = BufferSource::new(b"data".to_vec());
        let mut transmitter = ArraysTransmitter::new(config(16, 16));
        transmitter.start(8, Terminator::SingleArray, &mut source);
        transmitter.start(9, Terminator::SingleArray, &mut source);
    }

    fn receive_all(
        receiver: &mut ArraysReceiver,
        device: &mut ScriptedDevice,
        dest: &mut BufferDest,
    ) -> Result<(), IoFailure> {
        for _ in 0..10_000 {
            if receiver.on_readable(device, Events::readable(), dest)? == TransmitState::Finished {
                return Ok(());
            }
        }
        panic!("reception has stalled");
    }

    #[test]
    fn receives_list_in_small_pieces() {
        let items = arrays(&[b"one", b"", b"three"]);
        let wire = encode(&items, Termination::EndOfList, Compression::None);
        let mut device = ScriptedDevice::new();
        device.push_pieces(&wire, 3);
        let mut dest = BufferDest::new();
        let mut receiver = ArraysReceiver::new(config(64, 64));
        receiver.start(1, Terminator::ArrayList, &mut dest);
        receive_all(&mut receiver, &mut device, &mut dest).unwrap();
        assert_eq!(dest.arrays(), items.as_slice());
        assert!(dest.is_finished());
        assert_eq!(receiver.arrays_received(), 3);
    }

    #[test]
    fn leftover_bytes_serve_next_unit() {
        let mut wire = encode(&arrays(&[b"first"]), Termination::None, Compression::None);
        wire.extend(encode(&arrays(&[b"k", b"v"]), Termination::None, Compression::None));
        let mut device = ScriptedDevice::new();
        device.push_read(Step::Data(wire));

        let mut dest = BufferDest::new();
        let mut receiver = ArraysReceiver::new(config(64, 64));
        receiver.start(1, Terminator::SingleArray, &mut dest);
        receive_all(&mut receiver, &mut device, &mut dest).unwrap();
        assert_eq!(dest.take(), arrays(&[b"first"]));
        assert!(!receiver.backlog().is_empty());

        assert!(receiver.has_backlog());

        receiver.start(2, Terminator::SinglePair, &mut dest);
        let state = receiver.poll_backlog(&mut dest).unwrap();
        assert_eq!(state, TransmitState::Finished);
        assert_eq!(dest.arrays(), arrays(&[b"k", b"v"]).as_slice());
        assert_eq!(device.read_calls, 1);
        assert!(!receiver.has_backlog());
    }

    #[test]
    fn partial_leftover_resumes_from_device() {
        let mut wire = encode(&arrays(&[b"first"]), Termination::None, Compression::None);
        let next = encode(&arrays(&[b"second"]), Termination::None, Compression::None);
        wire.extend_from_slice(&next[..6]);
        let mut device = ScriptedDevice::new();
        device.push_read(Step::Data(wire));
        device.push_read(Step::Data(next[6..].to_vec()));

        let mut dest = BufferDest::new();
        let mut receiver = ArraysReceiver::new(config(64, 64));
        receiver.start(1, Terminator::SingleArray, &mut dest);
        receive_all(&mut receiver, &mut device, &mut dest).unwrap();
        assert_eq!(dest.take(), arrays(&[b"first"]));

        receiver.start(2, Terminator::SingleArray, &mut dest);
        assert_eq!(receiver.poll_backlog(&mut dest).unwrap(), TransmitState::TransmitArray);
        assert!(!receiver.has_backlog());
        assert_eq!(device.read_calls, 1);

        receive_all(&mut receiver, &mut device, &mut dest).unwrap();
        assert_eq!(dest.arrays(), arrays(&[b"second"]).as_slice());
        assert_eq!(device.read_calls, 2);
    }

    #[test]
    fn fixed_unit_into_stream_dest_keeps_wire_form() {
        use crate::dest::StreamDest;

        let wire = encode(&arrays(&[b"abc"]), Termination::None, Compression::None);
        let mut device = ScriptedDevice::new();
        device.push_read(Step::Data(wire.clone()));
        let mut dest = StreamDest::new(Vec::new());
        let mut receiver = ArraysReceiver::new(config(64, 64));
        receiver.start(1, Terminator::SingleArray, &mut dest);
        let state = receiver.on_readable(&mut device, Events::readable(), &mut dest).unwrap();
        assert_eq!(state, TransmitState::Finished);
        assert_eq!(dest.into_inner(), wire);
    }

    #[test]
    fn unexpected_end_of_list() {
        let mut device = ScriptedDevice::new();
        device.push_read(Step::Data(u32::MAX.to_ne_bytes().to_vec()));
        let mut dest = BufferDest::new();
        let mut receiver = ArraysReceiver::new(config(64, 64));
        receiver.start(1, Terminator::SingleArray, &mut dest);
        let err = receive_all(&mut receiver, &mut device, &mut dest).unwrap_err();
        match err {
            IoFailure::Error(err) => assert_eq!(err.errnum(), libc::EPROTO),
            IoFailure::Warning(_) => panic!("protocol violation reported as a warning"),
        }
    }

    #[test]
    fn oversized_array_is_rejected() {
        let mut device = ScriptedDevice::new();
        device.push_read(Step::Data(1000u32.to_ne_bytes().to_vec()));
        let mut dest = BufferDest::new();
        let mut receiver = ArraysReceiver::new(TransmitConfig {
            max_array_len: 100,
            ..config(64, 64)
        });
        receiver.start(1, Terminator::SingleArray, &mut dest);
        let err = receive_all(&mut receiver, &mut device, &mut dest).unwrap_err();
        match err {
            IoFailure::Error(err) => assert_eq!(err.errnum(), libc::EMSGSIZE),
            IoFailure::Warning(_) => panic!("oversized array reported as a warning"),
        }
    }

    #[test]
    fn peer_closing_mid_unit() {
        let mut device = ScriptedDevice::new();
        device.push_read(Step::Data(vec![5, 0])).push_read(Step::Eof);
        let mut dest = BufferDest::new();
        let mut receiver = ArraysReceiver::new(config(64, 64));
        receiver.start(1, Terminator::SingleArray, &mut dest);
        assert_eq!(
            receiver.on_readable(&mut device, Events::readable(), &mut dest).unwrap(),
            TransmitState::TransmitArray
        );
        let err = receiver.on_readable(&mut device, Events::readable(), &mut dest).unwrap_err();
        assert!(err.is_warning());
    }

    #[test]
    fn compressed_pairs_over_socket() {
        let (mut left, mut right) = UnixStream::pair().unwrap();
        left.set_nonblocking(true).unwrap();
        right.set_nonblocking(true).unwrap();

        let pairs = vec![
            (b"alpha".to_vec(), vec![7u8; 50_000]),
            (b"beta".to_vec(), Vec::new()),
            (Vec::new(), b"gamma".to_vec()),
        ];
        let config = config(512, 300).with_compression(Compression::Lz4);
        let mut source = ListSource::with_pairs(pairs.clone());
        let mut transmitter = ArraysTransmitter::new(config);
        let mut dest = BufferDest::new();
        let mut receiver = ArraysReceiver::new(config);
        transmitter.start(1, Terminator::PairList, &mut source);
        receiver.start(1, Terminator::PairList, &mut dest);

        let mut rounds = 0;
        while receiver.state() != TransmitState::Finished {
            rounds += 1;
            assert!(rounds < 100_000, "exchange has stalled");
            if transmitter.wants_write() {
                transmitter.on_writable(&mut left, Events::writable(), &mut source).unwrap();
            }
            receiver.on_readable(&mut right, Events::readable(), &mut dest).unwrap();
        }

        let expected = pairs.into_iter().flat_map(|(key, value)| [key, value]).collect::<Vec<_>>();
        assert_eq!(dest.arrays(), expected.as_slice());
        assert_eq!(transmitter.state(), TransmitState::Finished);
        assert_eq!(transmitter.bytes_sent(), receiver.bytes_received());
    }
}
