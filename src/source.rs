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

//! Chunk sources: where the arrays to be transmitted come from.

use std::io::{self, Read};

use crate::cursor::SourceCursor;
use crate::error::{IoError, IoFailure, DETACHED_FD};
use crate::nonblock::is_retry;
use crate::serializer::{END_OF_LIST, LENGTH_WIDTH, MAX_ARRAY_LEN};
use crate::terminator::TransmitId;

/// Producer of arrays, delivered chunk by chunk.
pub trait ChunkSource {
    fn cursor(&self) -> &SourceCursor;
    fn cursor_mut(&mut self) -> &mut SourceCursor;

    /// Length of the current array. `None` means the source can't tell yet and must be asked
    /// again on the next readiness event.
    ///
    /// Once [`Self::end_of_list`] reports `true` the returned length has no meaning.
    fn read_array_length(&mut self, id: TransmitId) -> Result<Option<usize>, IoFailure>;

    /// Copies the next slice of the current array into `chunk` and returns the number of bytes
    /// copied. In-memory sources always fill the whole `chunk`; stream sources may deliver less,
    /// including zero for "not ready yet".
    ///
    /// # Panics
    ///
    /// If `chunk` is longer than the unread part of the current array.
    fn get_next_chunk(&mut self, id: TransmitId, chunk: &mut [u8]) -> Result<usize, IoFailure>;

    /// Whether the source holds no more arrays, i.e. the list must be terminated.
    fn end_of_list(&self) -> bool;

    /// Moves to the next array.
    fn next_array(&mut self) { self.cursor_mut().advance() }

    /// Rewinds the source state before a new transmission.
    fn reset(&mut self) { *self.cursor_mut() = SourceCursor::new() }
}

impl<S: ChunkSource + ?Sized> ChunkSource for &mut S {
    fn cursor(&self) -> &SourceCursor { (**self).cursor() }
    fn cursor_mut(&mut self) -> &mut SourceCursor { (**self).cursor_mut() }
    fn read_array_length(&mut self, id: TransmitId) -> Result<Option<usize>, IoFailure> {
        (**self).read_array_length(id)
    }
    fn get_next_chunk(&mut self, id: TransmitId, chunk: &mut [u8]) -> Result<usize, IoFailure> {
        (**self).get_next_chunk(id, chunk)
    }
    fn end_of_list(&self) -> bool { (**self).end_of_list() }
    fn next_array(&mut self) { (**self).next_array() }
    fn reset(&mut self) { (**self).reset() }
}

fn copy_chunk(array: &[u8], cursor: &mut SourceCursor, chunk: &mut [u8]) -> usize {
    let start = cursor.array;
    cursor.consume(chunk.len(), array.len());
    chunk.copy_from_slice(&array[start..cursor.array]);
    chunk.len()
}

/// Source holding a single array in a byte buffer.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct BufferSource {
    data: Vec<u8>,
    cursor: SourceCursor,
}

impl BufferSource {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        BufferSource {
            data: data.into(),
            cursor: SourceCursor::new(),
        }
    }

    pub fn into_inner(self) -> Vec<u8> { self.data }
}

impl ChunkSource for BufferSource {
    fn cursor(&self) -> &SourceCursor { &self.cursor }
    fn cursor_mut(&mut self) -> &mut SourceCursor { &mut self.cursor }

    fn read_array_length(&mut self, _id: TransmitId) -> Result<Option<usize>, IoFailure> {
        Ok(Some(self.data.len()))
    }

    fn get_next_chunk(&mut self, _id: TransmitId, chunk: &mut [u8]) -> Result<usize, IoFailure> {
        Ok(copy_chunk(&self.data, &mut self.cursor, chunk))
    }

    fn end_of_list(&self) -> bool { self.cursor.processed >= 1 }
}

/// Source holding a list of arrays.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct ListSource {
    arrays: Vec<Vec<u8>>,
    cursor: SourceCursor,
}

impl ListSource {
    pub fn new(arrays: Vec<Vec<u8>>) -> Self {
        ListSource {
            arrays,
            cursor: SourceCursor::new(),
        }
    }

    /// Source of `(key, value)` pairs flattened into consecutive arrays.
    pub fn with_pairs(pairs: impl IntoIterator<Item = (Vec<u8>, Vec<u8>)>) -> Self {
        ListSource::new(pairs.into_iter().flat_map(|(key, value)| [key, value]).collect())
    }

    pub fn len(&self) -> usize { self.arrays.len() }
    pub fn is_empty(&self) -> bool { self.arrays.is_empty() }
    pub fn into_inner(self) -> Vec<Vec<u8>> { self.arrays }
}

impl ChunkSource for ListSource {
    fn cursor(&self) -> &SourceCursor { &self.cursor }
    fn cursor_mut(&mut self) -> &mut SourceCursor { &mut self.cursor }

    fn read_array_length(&mut self, _id: TransmitId) -> Result<Option<usize>, IoFailure> {
        Ok(Some(self.arrays.get(self.cursor.processed).map(Vec::len).unwrap_or_default()))
    }

    fn get_next_chunk(&mut self, _id: TransmitId, chunk: &mut [u8]) -> Result<usize, IoFailure> {
        let array = self.arrays.get(self.cursor.processed).map(Vec::as_slice).unwrap_or_default();
        Ok(copy_chunk(array, &mut self.cursor, chunk))
    }

    fn end_of_list(&self) -> bool { self.cursor.processed >= self.arrays.len() }
}

/// Source asking a callback for each next value; the callback returns `None` once the list is
/// over.
pub struct DelegateSource<F>
where F: FnMut(TransmitId) -> Option<Vec<u8>>
{
    fetch: F,
    current: Option<Vec<u8>>,
    fetched: bool,
    cursor: SourceCursor,
}

impl<F> DelegateSource<F>
where F: FnMut(TransmitId) -> Option<Vec<u8>>
{
    pub fn new(fetch: F) -> Self {
        DelegateSource {
            fetch,
            current: None,
            fetched: false,
            cursor: SourceCursor::new(),
        }
    }

    fn current(&self) -> &[u8] { self.current.as_deref().unwrap_or_default() }
}

impl<F> ChunkSource for DelegateSource<F>
where F: FnMut(TransmitId) -> Option<Vec<u8>>
{
    fn cursor(&self) -> &SourceCursor { &self.cursor }
    fn cursor_mut(&mut self) -> &mut SourceCursor { &mut self.cursor }

    fn read_array_length(&mut self, id: TransmitId) -> Result<Option<usize>, IoFailure> {
        if !self.fetched {
            self.current = (self.fetch)(id);
            self.fetched = true;
        }
        Ok(Some(self.current().len()))
    }

    fn get_next_chunk(&mut self, _id: TransmitId, chunk: &mut [u8]) -> Result<usize, IoFailure> {
        let array = self.current.as_deref().unwrap_or_default();
        Ok(copy_chunk(array, &mut self.cursor, chunk))
    }

    fn end_of_list(&self) -> bool { self.fetched && self.current.is_none() }

    fn next_array(&mut self) {
        self.cursor.advance();
        self.current = None;
        self.fetched = false;
    }

    fn reset(&mut self) {
        self.cursor = SourceCursor::new();
        self.current = None;
        self.fetched = false;
    }
}

/// Source asking a callback for `(key, value)` pairs which are yielded as two arrays.
pub struct PairDelegateSource<F>
where F: FnMut(TransmitId) -> Option<(Vec<u8>, Vec<u8>)>
{
    fetch: F,
    current: Option<(Vec<u8>, Vec<u8>)>,
    fetched: bool,
    cursor: SourceCursor,
}

impl<F> PairDelegateSource<F>
where F: FnMut(TransmitId) -> Option<(Vec<u8>, Vec<u8>)>
{
    pub fn new(fetch: F) -> Self {
        PairDelegateSource {
            fetch,
            current: None,
            fetched: false,
            cursor: SourceCursor::new(),
        }
    }

    fn is_value(&self) -> bool { self.cursor.processed % 2 == 1 }
}

impl<F> ChunkSource for PairDelegateSource<F>
where F: FnMut(TransmitId) -> Option<(Vec<u8>, Vec<u8>)>
{
    fn cursor(&self) -> &SourceCursor { &self.cursor }
    fn cursor_mut(&mut self) -> &mut SourceCursor { &mut self.cursor }

    fn read_array_length(&mut self, id: TransmitId) -> Result<Option<usize>, IoFailure> {
        if !self.fetched {
            self.current = (self.fetch)(id);
            self.fetched = true;
        }
        let len = match &self.current {
            None => 0,
            Some((_, value)) if self.is_value() => value.len(),
            Some((key, _)) => key.len(),
        };
        Ok(Some(len))
    }

    fn get_next_chunk(&mut self, _id: TransmitId, chunk: &mut [u8]) -> Result<usize, IoFailure> {
        let is_value = self.is_value();
        let array = match &self.current {
            None => &[][..],
            Some((_, value)) if is_value => value.as_slice(),
            Some((key, _)) => key.as_slice(),
        };
        Ok(copy_chunk(array, &mut self.cursor, chunk))
    }

    fn end_of_list(&self) -> bool { self.fetched && self.current.is_none() }

    fn next_array(&mut self) {
        self.cursor.advance();
        if !self.is_value() {
            self.current = None;
            self.fetched = false;
        }
    }

    fn reset(&mut self) {
        self.cursor = SourceCursor::new();
        self.current = None;
        self.fetched = false;
    }
}

/// Source reading arrays in the wire format from a byte stream.
///
/// The stream may be non-blocking: `WouldBlock` and `Interrupted` only mean that the source is
/// not ready and is asked again later, keeping everything read so far. Reaching the end of the
/// stream at an array boundary ends the list as the end-of-list marker does; reaching it inside
/// an array is an error.
pub struct StreamSource<R: Read> {
    input: R,
    header: [u8; LENGTH_WIDTH],
    header_filled: usize,
    current: Option<usize>,
    ended: bool,
    cursor: SourceCursor,
}

impl<R: Read> StreamSource<R> {
    pub fn new(input: R) -> Self {
        StreamSource {
            input,
            header: [0u8; LENGTH_WIDTH],
            header_filled: 0,
            current: None,
            ended: false,
            cursor: SourceCursor::new(),
        }
    }

    pub fn into_inner(self) -> R { self.input }
}

impl<R: Read> ChunkSource for StreamSource<R> {
    fn cursor(&self) -> &SourceCursor { &self.cursor }
    fn cursor_mut(&mut self) -> &mut SourceCursor { &mut self.cursor }

    fn read_array_length(&mut self, _id: TransmitId) -> Result<Option<usize>, IoFailure> {
        if self.ended {
            return Ok(Some(0));
        }
        if let Some(len) = self.current {
            return Ok(Some(len));
        }
        while self.header_filled < LENGTH_WIDTH {
            match self.input.read(&mut self.header[self.header_filled..]) {
                Ok(0) if self.header_filled == 0 => {
                    self.ended = true;
                    return Ok(Some(0));
                }
                Ok(0) => {
                    return Err(IoError::with_kind(
                        DETACHED_FD,
                        io::ErrorKind::UnexpectedEof,
                        "end of stream inside an array length",
                    )
                    .into())
                }
                Ok(len) => self.header_filled += len,
                Err(err) if is_retry(&err) => return Ok(None),
                Err(err) => {
                    return Err(IoError::from_io(DETACHED_FD, &err, "stream source failure").into())
                }
            }
        }
        self.header_filled = 0;

        let len = u32::from_ne_bytes(self.header);
        if len == END_OF_LIST {
            self.ended = true;
            return Ok(Some(0));
        }
        let len = len as usize;
        debug_assert!(len <= MAX_ARRAY_LEN);
        self.current = Some(len);
        Ok(Some(len))
    }

    fn get_next_chunk(&mut self, _id: TransmitId, chunk: &mut [u8]) -> Result<usize, IoFailure> {
        let array_len = self.current.unwrap_or_default();
        assert!(
            chunk.len() <= self.cursor.remaining(array_len),
            "requested chunk of {} bytes exceeds the {} unread bytes of the array",
            chunk.len(),
            self.cursor.remaining(array_len)
        );
        let mut filled = 0;
        while filled < chunk.len() {
            match self.input.read(&mut chunk[filled..]) {
                Ok(0) => {
                    return Err(IoError::with_kind(
                        DETACHED_FD,
                        io::ErrorKind::UnexpectedEof,
                        "end of stream inside an array",
                    )
                    .into())
                }
                Ok(len) => filled += len,
                Err(err) if is_retry(&err) => break,
                Err(err) => {
                    return Err(IoError::from_io(DETACHED_FD, &err, "stream source failure").into())
                }
            }
        }
        self.cursor.consume(filled, array_len);
        Ok(filled)
    }

    fn end_of_list(&self) -> bool { self.ended }

    fn next_array(&mut self) {
        self.cursor.advance();
        self.current = None;
    }

    fn reset(&mut self) {
        self.cursor = SourceCursor::new();
        self.header_filled = 0;
        self.current = None;
        self.ended = false;
    }
}

#[cfg(test)]
mod test {
    use std::collections::VecDeque;
    use std::io::Cursor;

    use super::*;
    use crate::serializer::{encode, Compression};
    use crate::terminator::Termination;

    /// Drains a source into whole arrays, `chunk` bytes at a time.
    fn drain(source: &mut impl ChunkSource, chunk: usize) -> Vec<Vec<u8>> {
        let mut arrays = Vec::new();
        loop {
            let len = loop {
                if let Some(len) = source.read_array_length(0).unwrap() {
                    break len;
                }
            };
            if source.end_of_list() {
                return arrays;
            }
            let mut array = vec![0u8; len];
            let mut pos = 0;
            while pos < len {
                let want = chunk.min(len - pos);
                pos += source.get_next_chunk(0, &mut array[pos..pos + want]).unwrap();
            }
            arrays.push(array);
            source.next_array();
        }
    }

    /// Reader which delivers one byte per call and reports `WouldBlock` between them.
    struct Trickle {
        data: VecDeque<u8>,
        block: bool,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.block = !self.block;
            if self.block {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            match self.data.pop_front() {
                None => Ok(0),
                Some(byte) => {
                    buf[0] = byte;
                    Ok(1)
                }
            }
        }
    }

    #[test]
    fn buffer_source() {
        let mut source = BufferSource::new(b"HELLO".to_vec());
        assert_eq!(drain(&mut source, 2), vec![b"HELLO".to_vec()]);
        assert_eq!(source.cursor().processed, 1);
    }

    #[test]
    fn list_source_counts_arrays() {
        let arrays = vec![b"a".to_vec(), vec![], b"ccc".to_vec()];
        let mut source = ListSource::new(arrays.clone());
        assert_eq!(drain(&mut source, 1), arrays);
        assert!(source.end_of_list());
        source.reset();
        assert!(!source.end_of_list());
        assert_eq!(drain(&mut source, 64), arrays);
    }

    #[test]
    fn delegate_source_ends_on_none() {
        let mut values = vec![b"two".to_vec(), b"one".to_vec()];
        let mut seen = Vec::new();
        let mut source = DelegateSource::new(|id| {
            seen.push(id);
            values.pop()
        });
        assert_eq!(drain(&mut source, 2), vec![b"one".to_vec(), b"two".to_vec()]);
        drop(source);
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn pair_delegate_source() {
        let mut pairs = vec![(b"k2".to_vec(), b"".to_vec()), (b"k1".to_vec(), b"v1".to_vec())];
        let mut source = PairDelegateSource::new(|_| pairs.pop());
        assert_eq!(drain(&mut source, 1), vec![
            b"k1".to_vec(),
            b"v1".to_vec(),
            b"k2".to_vec(),
            vec![]
        ]);
    }

    #[test]
    fn stream_source_survives_trickling_input() {
        let arrays = vec![b"HELLO".to_vec(), vec![], b"world!".to_vec()];
        let bytes = encode(&arrays, Termination::EndOfList, Compression::None);
        let mut source = StreamSource::new(Trickle {
            data: bytes.into_iter().collect(),
            block: false,
        });
        assert_eq!(drain(&mut source, 4), arrays);
    }

    #[test]
    fn stream_source_eof_at_boundary_ends_list() {
        let arrays = vec![b"abc".to_vec()];
        let bytes = encode(&arrays, Termination::None, Compression::None);
        let mut source = StreamSource::new(Cursor::new(bytes));
        assert_eq!(drain(&mut source, 8), arrays);
    }

    #[test]
    fn stream_source_truncated_array() {
        let mut bytes = encode(&[b"abcdef".to_vec()], Termination::None, Compression::None);
        bytes.truncate(bytes.len() - 2);
        let mut source = StreamSource::new(Cursor::new(bytes));
        assert_eq!(source.read_array_length(0).unwrap(), Some(6));
        let mut chunk = [0u8; 6];
        let err = source.get_next_chunk(0, &mut chunk).unwrap_err();
        assert!(!err.is_warning());
    }

    #[test]
    #[should_panic(expected = "exceeds the 2 unread bytes")]
    fn oversized_chunk_request() {
        let mut source = BufferSource::new(b"ab".to_vec());
        source.read_array_length(0).unwrap();
        let mut chunk = [0u8; 3];
        let _ = source.get_next_chunk(0, &mut chunk);
    }
}
