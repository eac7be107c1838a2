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

//! Chunked array serialization.
//!
//! Each array goes on the wire as `[length: u32, native byte order][length bytes]`. The reserved
//! length value [`END_OF_LIST`] marks the end of an array list or a pair list, hence zero-length
//! arrays are ordinary list members.
//!
//! The serializer writes into a fixed-size output buffer which is flushed to the socket whenever
//! it fills up; the [`WriteCursor`] keeps enough state to resume in the middle of a length prefix
//! or a chunk after the flush. The deserializer is a push parser which accepts input split at
//! arbitrary byte boundaries.

use std::os::unix::io::RawFd;

use crate::cursor::WriteCursor;
use crate::error::IoError;
use crate::terminator::Termination;

/// Width of the length prefix.
pub const LENGTH_WIDTH: usize = 4;

/// Reserved length value marking the end of a list.
pub const END_OF_LIST: u32 = u32::MAX;

/// Longest array which can be put on the wire.
pub const MAX_ARRAY_LEN: usize = (END_OF_LIST - 1) as usize;

/// Compression pass applied to each array before it is length-prefixed.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Display)]
pub enum Compression {
    #[default]
    #[display("none")]
    None,
    /// LZ4 block with the uncompressed size prepended.
    #[display("lz4")]
    Lz4,
}

/// Writes one chunk of an array, emitting the length prefix first if the array has just started.
///
/// Returns `true` if the buffer filled up before the chunk was written in full: the caller must
/// flush the buffer, mark the cursor as flushed and call again with the same chunk.
fn write_chunk(
    chunk: &[u8],
    array_len: usize,
    last: bool,
    buf: &mut [u8],
    cursor: &mut WriteCursor,
) -> bool {
    assert!(!buf.is_empty(), "serializer output buffer must not be empty");
    assert!(array_len <= MAX_ARRAY_LEN, "array of {array_len} bytes can't be put on the wire");

    if cursor.value < LENGTH_WIDTH {
        debug_assert_eq!(cursor.chunk, 0);
        let prefix = (array_len as u32).to_ne_bytes();
        cursor.value += cursor.put(buf, &prefix[cursor.value..]);
        if cursor.value < LENGTH_WIDTH {
            return true;
        }
    }

    let written_before = cursor.value - LENGTH_WIDTH - cursor.chunk;
    assert!(
        written_before + chunk.len() <= array_len,
        "chunk of {} bytes exceeds the remaining {} bytes of the array",
        chunk.len(),
        array_len - written_before
    );

    let len = cursor.put(buf, &chunk[cursor.chunk..]);
    cursor.chunk += len;
    cursor.value += len;
    if cursor.chunk < chunk.len() {
        return true;
    }

    cursor.chunk = 0;
    if last {
        assert_eq!(
            cursor.value,
            LENGTH_WIDTH + array_len,
            "last chunk leaves the array incomplete"
        );
        cursor.value = 0;
    }
    false
}

/// Writes the end marker for the termination mode.
fn write_termination(mode: Termination, buf: &mut [u8], cursor: &mut WriteCursor) -> bool {
    if mode == Termination::None {
        return false;
    }
    assert!(!buf.is_empty(), "serializer output buffer must not be empty");
    assert_eq!(cursor.chunk, 0, "termination written in the middle of an array");

    let marker = END_OF_LIST.to_ne_bytes();
    cursor.value += cursor.put(buf, &marker[cursor.value..]);
    if cursor.value < LENGTH_WIDTH {
        return true;
    }
    cursor.value = 0;
    false
}

/// Serializer writing raw arrays.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct PlainSerializer;

impl PlainSerializer {
    pub fn process_chunk(
        &mut self,
        chunk: &[u8],
        array_len: usize,
        last: bool,
        buf: &mut [u8],
        cursor: &mut WriteCursor,
    ) -> bool {
        write_chunk(chunk, array_len, last, buf, cursor)
    }
}

/// Serializer compressing each array before it is written.
///
/// Chunks of an array are collected until the last one arrives; the compressed array, prefixed
/// with the compressed length, is then written with the same resumable algorithm as raw arrays.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct CompressingSerializer {
    staging: Vec<u8>,
    packed: Option<Vec<u8>>,
}

impl CompressingSerializer {
    pub fn new() -> Self { default!() }

    pub fn process_chunk(
        &mut self,
        chunk: &[u8],
        array_len: usize,
        last: bool,
        buf: &mut [u8],
        cursor: &mut WriteCursor,
    ) -> bool {
        if self.packed.is_none() {
            assert!(
                self.staging.len() + chunk.len() <= array_len,
                "chunk of {} bytes exceeds the remaining {} bytes of the array",
                chunk.len(),
                array_len - self.staging.len()
            );
            self.staging.extend_from_slice(chunk);
            if !last {
                return false;
            }
            assert_eq!(self.staging.len(), array_len, "last chunk leaves the array incomplete");
            self.packed = Some(lz4_flex::compress_prepend_size(&self.staging));
            self.staging.clear();
        }

        let packed = self.packed.as_deref().unwrap_or_default();
        let needs_flush = write_chunk(packed, packed.len(), true, buf, cursor);
        if !needs_flush {
            self.packed = None;
        }
        needs_flush
    }

    /// Drops an array which was partially collected or written.
    pub fn reset(&mut self) {
        self.staging.clear();
        self.packed = None;
    }
}

/// Chunk serializer selected by the compression mode.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum ChunkSerializer {
    Plain(PlainSerializer),
    Compressing(CompressingSerializer),
}

impl ChunkSerializer {
    pub fn new(compression: Compression) -> Self {
        match compression {
            Compression::None => ChunkSerializer::Plain(PlainSerializer),
            Compression::Lz4 => ChunkSerializer::Compressing(CompressingSerializer::new()),
        }
    }

    pub fn compression(&self) -> Compression {
        match self {
            ChunkSerializer::Plain(_) => Compression::None,
            ChunkSerializer::Compressing(_) => Compression::Lz4,
        }
    }

    /// Writes a chunk of an array of `array_len` bytes into `buf` starting at the cursor. The
    /// array length is written once, before its first chunk.
    ///
    /// Returns `true` if the buffer filled before the chunk was fully written. The caller must
    /// flush `buf[..cursor.buffer]`, call [`WriteCursor::flushed`] and repeat the call with the
    /// same chunk; the serializer resumes where it stopped.
    ///
    /// # Panics
    ///
    /// If the chunks of an array exceed `array_len` or the last chunk leaves it incomplete.
    pub fn process_chunk(
        &mut self,
        chunk: &[u8],
        array_len: usize,
        last: bool,
        buf: &mut [u8],
        cursor: &mut WriteCursor,
    ) -> bool {
        match self {
            ChunkSerializer::Plain(serializer) => {
                serializer.process_chunk(chunk, array_len, last, buf, cursor)
            }
            ChunkSerializer::Compressing(serializer) => {
                serializer.process_chunk(chunk, array_len, last, buf, cursor)
            }
        }
    }

    /// Writes the end marker of the termination mode. Returns `true` if the buffer must be
    /// flushed and the call repeated.
    pub fn terminate(&mut self, mode: Termination, buf: &mut [u8], cursor: &mut WriteCursor) -> bool {
        write_termination(mode, buf, cursor)
    }

    pub fn reset(&mut self) {
        if let ChunkSerializer::Compressing(serializer) = self {
            serializer.reset()
        }
    }
}

/// Errors decoding the array stream.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Error)]
#[display(doc_comments)]
pub enum DecodeError {
    /// array of {0} bytes exceeds the maximum allowed length of {1} bytes.
    Oversized(usize, usize),

    /// compressed array is corrupted.
    Corrupted,
}

impl DecodeError {
    #[track_caller]
    pub fn into_io_error(self, fd: RawFd) -> IoError {
        match self {
            DecodeError::Oversized(..) => {
                IoError::with_errno(fd, libc::EMSGSIZE, "array exceeds the maximum length")
            }
            DecodeError::Corrupted => {
                IoError::with_errno(fd, libc::EPROTO, "corrupted compressed array")
            }
        }
    }
}

/// Item decoded from the array stream.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum Parsed {
    Array(Vec<u8>),
    EndOfList,
}

#[derive(Clone, Eq, PartialEq, Debug)]
struct Payload {
    data: Vec<u8>,
    len: usize,
}

/// Preallocation cap protecting from length prefixes announcing huge arrays.
const PREALLOC_LIMIT: usize = 64 * 1024;

/// Push parser for the array stream.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct ChunkDeserializer {
    compression: Compression,
    max_array_len: usize,
    header: [u8; LENGTH_WIDTH],
    header_filled: usize,
    payload: Option<Payload>,
}

impl ChunkDeserializer {
    pub fn new(compression: Compression, max_array_len: usize) -> Self {
        ChunkDeserializer {
            compression,
            max_array_len: max_array_len.min(MAX_ARRAY_LEN),
            header: [0u8; LENGTH_WIDTH],
            header_filled: 0,
            payload: None,
        }
    }

    pub fn compression(&self) -> Compression { self.compression }

    /// Some bytes of an array were consumed but the array is not complete yet.
    pub fn is_mid_array(&self) -> bool { self.header_filled > 0 || self.payload.is_some() }

    pub fn reset(&mut self) {
        self.header_filled = 0;
        self.payload = None;
    }

    fn max_wire_len(&self) -> usize {
        match self.compression {
            Compression::None => self.max_array_len,
            // LZ4 worst case expansion plus the prepended size
            Compression::Lz4 => self
                .max_array_len
                .saturating_add(self.max_array_len / 255 + 16 + LENGTH_WIDTH)
                .min(MAX_ARRAY_LEN),
        }
    }

    /// Consumes bytes from `data` until an item is complete or the input is exhausted.
    ///
    /// Returns the number of bytes consumed together with the decoded item, if any. Bytes which
    /// were not consumed belong to the following items and must be fed again.
    pub fn feed(&mut self, data: &[u8]) -> Result<(usize, Option<Parsed>), DecodeError> {
        let mut used = 0;

        if self.payload.is_none() {
            let len = (LENGTH_WIDTH - self.header_filled).min(data.len());
            self.header[self.header_filled..self.header_filled + len]
                .copy_from_slice(&data[..len]);
            self.header_filled += len;
            used += len;
            if self.header_filled < LENGTH_WIDTH {
                return Ok((used, None));
            }
            self.header_filled = 0;

            let wire_len = u32::from_ne_bytes(self.header);
            if wire_len == END_OF_LIST {
                return Ok((used, Some(Parsed::EndOfList)));
            }
            let wire_len = wire_len as usize;
            if wire_len > self.max_wire_len() {
                return Err(DecodeError::Oversized(wire_len, self.max_wire_len()));
            }
            self.payload = Some(Payload {
                data: Vec::with_capacity(wire_len.min(PREALLOC_LIMIT)),
                len: wire_len,
            });
        }

        let Some(payload) = self.payload.as_mut() else {
            unreachable!("payload is set above")
        };
        let len = (payload.len - payload.data.len()).min(data.len() - used);
        payload.data.extend_from_slice(&data[used..used + len]);
        used += len;
        if payload.data.len() < payload.len {
            return Ok((used, None));
        }

        let Some(Payload { data: raw, .. }) = self.payload.take() else {
            unreachable!("payload is set above")
        };
        let array = match self.compression {
            Compression::None => raw,
            Compression::Lz4 => self.unpack(&raw)?,
        };
        Ok((used, Some(Parsed::Array(array))))
    }

    fn unpack(&self, raw: &[u8]) -> Result<Vec<u8>, DecodeError> {
        let mut size = [0u8; LENGTH_WIDTH];
        size.copy_from_slice(raw.get(..LENGTH_WIDTH).ok_or(DecodeError::Corrupted)?);
        let size = u32::from_le_bytes(size) as usize;
        if size > self.max_array_len {
            return Err(DecodeError::Oversized(size, self.max_array_len));
        }
        lz4_flex::decompress_size_prepended(raw).map_err(|_| DecodeError::Corrupted)
    }
}

/// Serializes arrays and the termination into a single byte vector.
///
/// Convenience for peers which don't need the resumable machinery, like tests and tools
/// producing the stream offline.
///
/// ```
/// use transmit::serializer::{encode, Compression, LENGTH_WIDTH};
/// use transmit::Termination;
///
/// let bytes = encode(&[b"ab".to_vec()], Termination::EndOfList, Compression::None);
/// assert_eq!(bytes.len(), LENGTH_WIDTH + 2 + LENGTH_WIDTH);
/// ```
pub fn encode(arrays: &[Vec<u8>], termination: Termination, compression: Compression) -> Vec<u8> {
    let mut serializer = ChunkSerializer::new(compression);
    let mut cursor = WriteCursor::new();
    let mut buf = vec![0u8; 4096];
    let mut out = Vec::new();
    for array in arrays {
        while serializer.process_chunk(array, array.len(), true, &mut buf, &mut cursor) {
            out.extend_from_slice(&buf[..cursor.buffer]);
            cursor.flushed();
        }
    }
    while serializer.terminate(termination, &mut buf, &mut cursor) {
        out.extend_from_slice(&buf[..cursor.buffer]);
        cursor.flushed();
    }
    out.extend_from_slice(&buf[..cursor.buffer]);
    out
}

#[cfg(test)]
mod test {
    use super::*;

    fn prefix(len: u32) -> [u8; LENGTH_WIDTH] { len.to_ne_bytes() }

    /// Serializes the arrays in chunks of `chunk_size` into a buffer of `buf_size` bytes,
    /// flushing each time the serializer asks for it.
    fn serialize(
        arrays: &[&[u8]],
        chunk_size: usize,
        buf_size: usize,
        compression: Compression,
    ) -> Vec<u8> {
        let mut serializer = ChunkSerializer::new(compression);
        let mut cursor = WriteCursor::new();
        let mut buf = vec![0u8; buf_size];
        let mut out = Vec::new();
        for array in arrays {
            let chunks = array.chunks(chunk_size.max(1)).collect::<Vec<_>>();
            if chunks.is_empty() {
                while serializer.process_chunk(&[], 0, true, &mut buf, &mut cursor) {
                    out.extend_from_slice(&buf[..cursor.buffer]);
                    cursor.flushed();
                }
            }
            for (no, chunk) in chunks.iter().enumerate() {
                let last = no + 1 == chunks.len();
                while serializer.process_chunk(chunk, array.len(), last, &mut buf, &mut cursor) {
                    out.extend_from_slice(&buf[..cursor.buffer]);
                    cursor.flushed();
                }
            }
        }
        while serializer.terminate(Termination::EndOfList, &mut buf, &mut cursor) {
            out.extend_from_slice(&buf[..cursor.buffer]);
            cursor.flushed();
        }
        out.extend_from_slice(&buf[..cursor.buffer]);
        out
    }

    fn deserialize(bytes: &[u8], piece: usize, compression: Compression) -> Vec<Vec<u8>> {
        let mut deserializer = ChunkDeserializer::new(compression, MAX_ARRAY_LEN);
        let mut arrays = Vec::new();
        let mut ended = false;
        for slice in bytes.chunks(piece) {
            let mut pos = 0;
            while pos < slice.len() {
                assert!(!ended, "data after the end of list");
                let (used, parsed) = deserializer.feed(&slice[pos..]).unwrap();
                assert!(used > 0);
                pos += used;
                match parsed {
                    Some(Parsed::Array(array)) => arrays.push(array),
                    Some(Parsed::EndOfList) => ended = true,
                    None => {}
                }
            }
        }
        assert!(ended);
        assert!(!deserializer.is_mid_array());
        arrays
    }

    #[test]
    fn hello_in_four_byte_buffer() {
        let mut serializer = ChunkSerializer::new(Compression::None);
        let mut cursor = WriteCursor::new();
        let mut buf = [0u8; 4];

        // The length prefix alone saturates the buffer
        assert!(serializer.process_chunk(b"HELLO", 5, true, &mut buf, &mut cursor));
        assert_eq!(buf, prefix(5));
        assert_eq!(cursor.value, 4);
        cursor.flushed();

        assert!(serializer.process_chunk(b"HELLO", 5, true, &mut buf, &mut cursor));
        assert_eq!(&buf, b"HELL");
        assert_eq!(cursor.value, 8);
        assert_eq!(cursor.chunk, 4);
        cursor.flushed();

        assert!(!serializer.process_chunk(b"HELLO", 5, true, &mut buf, &mut cursor));
        assert_eq!(&buf[..cursor.buffer], b"O");
        assert!(cursor.is_array_start());
        assert_eq!(cursor.chunk, 0);
    }

    #[test]
    fn exact_fit_defers_flush() {
        let mut serializer = ChunkSerializer::new(Compression::None);
        let mut cursor = WriteCursor::new();
        let mut buf = [0u8; 6];
        assert!(!serializer.process_chunk(b"ab", 2, true, &mut buf, &mut cursor));
        assert!(cursor.needs_flush(buf.len()));
        assert!(serializer.process_chunk(b"c", 1, true, &mut buf, &mut cursor));
        cursor.flushed();
        assert!(!serializer.process_chunk(b"c", 1, true, &mut buf, &mut cursor));
        assert_eq!(&buf[..cursor.buffer], &[&prefix(1)[..], b"c"].concat()[..]);
    }

    #[test]
    fn buffer_size_independence() {
        let arrays: [&[u8]; 4] = [b"HELLO", b"", b"a somewhat longer array of bytes", b"z"];
        let reference = serialize(&arrays, 1024, 4096, Compression::None);
        for buf_size in 1..=48 {
            for chunk_size in [1, 2, 3, 7, 64] {
                assert_eq!(
                    serialize(&arrays, chunk_size, buf_size, Compression::None),
                    reference,
                    "buffer {buf_size}, chunk {chunk_size}"
                );
            }
        }
    }

    #[test]
    fn wire_layout() {
        let bytes = serialize(&[b"ab", b""], 16, 16, Compression::None);
        let expected =
            [&prefix(2)[..], b"ab", &prefix(0)[..], &END_OF_LIST.to_ne_bytes()[..]].concat();
        assert_eq!(bytes, expected);
    }

    #[test]
    fn round_trip_lists() {
        let lists: [&[&[u8]]; 4] = [
            &[],
            &[b"single"],
            &[b""],
            &[b"one", b"", b"three", b"", b"", b"six"],
        ];
        for arrays in lists {
            let bytes = serialize(arrays, 2, 5, Compression::None);
            for piece in [1, 2, 3, 5, 1000] {
                let decoded = deserialize(&bytes, piece, Compression::None);
                assert_eq!(decoded, arrays.iter().map(|a| a.to_vec()).collect::<Vec<_>>());
            }
        }
    }

    #[test]
    fn compressed_round_trip() {
        let long = b"abcabcabcabcabcabcabcabcabcabcabcabcabcabcabcabc".repeat(20);
        let arrays: [&[u8]; 3] = [&long, b"", b"tail"];
        let bytes = serialize(&arrays, 7, 9, Compression::Lz4);
        assert!(bytes.len() < long.len());
        assert_eq!(bytes, serialize(&arrays, 100, 4096, Compression::Lz4));
        let decoded = deserialize(&bytes, 1, Compression::Lz4);
        assert_eq!(decoded, arrays.iter().map(|a| a.to_vec()).collect::<Vec<_>>());
    }

    #[test]
    fn compressed_prefix_holds_compressed_length() {
        let long = vec![0u8; 1000];
        let bytes = serialize(&[&long], 1000, 4096, Compression::Lz4);
        let mut len = [0u8; LENGTH_WIDTH];
        len.copy_from_slice(&bytes[..LENGTH_WIDTH]);
        let len = u32::from_ne_bytes(len) as usize;
        assert_eq!(len, bytes.len() - 2 * LENGTH_WIDTH);
        assert!(len < 1000);
    }

    #[test]
    fn oversized_array_rejected() {
        let mut deserializer = ChunkDeserializer::new(Compression::None, 8);
        assert_eq!(deserializer.feed(&prefix(9)), Err(DecodeError::Oversized(9, 8)));
    }

    #[test]
    fn corrupted_compressed_array() {
        let mut deserializer = ChunkDeserializer::new(Compression::Lz4, 1024);
        let bytes = [&prefix(2)[..], &[0xFFu8, 0xFF][..]].concat();
        assert_eq!(deserializer.feed(&bytes), Err(DecodeError::Corrupted));
        let err = DecodeError::Corrupted.into_io_error(5);
        assert_eq!(err.errnum(), libc::EPROTO);
    }

    #[test]
    fn encode_matches_resumable_serializer() {
        let arrays = vec![b"HELLO".to_vec(), vec![], b"x".to_vec()];
        let expected = serialize(&[b"HELLO", b"", b"x"], 1, 1, Compression::None);
        assert_eq!(encode(&arrays, Termination::EndOfList, Compression::None), expected);
    }

    #[test]
    #[should_panic(expected = "exceeds the remaining")]
    fn chunk_overrun_is_a_contract_violation() {
        let mut serializer = ChunkSerializer::new(Compression::None);
        let mut cursor = WriteCursor::new();
        let mut buf = [0u8; 32];
        serializer.process_chunk(b"abc", 2, true, &mut buf, &mut cursor);
    }
}
