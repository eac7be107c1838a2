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

//! Chunk destinations: where received arrays are delivered.

use std::io::{self, Write};
use std::os::unix::io::RawFd;

use crate::error::{IoError, IoFailure, DETACHED_FD};
use crate::serializer::{END_OF_LIST, MAX_ARRAY_LEN};
use crate::terminator::{Termination, TransmitId};

/// Consumer of complete arrays.
pub trait ChunkDest {
    fn process_array(&mut self, id: TransmitId, array: Vec<u8>) -> Result<(), IoFailure>;

    /// Called once the transmission unit is complete; `termination` is the marker which ended it
    /// on the wire.
    fn finish(&mut self, _id: TransmitId, _termination: Termination) -> Result<(), IoFailure> {
        Ok(())
    }

    /// Drops state left over from a previous (possibly aborted) transmission. Must be called
    /// before each new transmission.
    fn reset(&mut self) {}
}

impl<D: ChunkDest + ?Sized> ChunkDest for &mut D {
    fn process_array(&mut self, id: TransmitId, array: Vec<u8>) -> Result<(), IoFailure> {
        (**self).process_array(id, array)
    }
    fn finish(&mut self, id: TransmitId, termination: Termination) -> Result<(), IoFailure> {
        (**self).finish(id, termination)
    }
    fn reset(&mut self) { (**self).reset() }
}

impl<D: ChunkDest + ?Sized> ChunkDest for Box<D> {
    fn process_array(&mut self, id: TransmitId, array: Vec<u8>) -> Result<(), IoFailure> {
        (**self).process_array(id, array)
    }
    fn finish(&mut self, id: TransmitId, termination: Termination) -> Result<(), IoFailure> {
        (**self).finish(id, termination)
    }
    fn reset(&mut self) { (**self).reset() }
}

/// Destination accumulating arrays in memory.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct BufferDest {
    arrays: Vec<Vec<u8>>,
    finished: bool,
}

impl BufferDest {
    pub fn new() -> Self { default!() }

    pub fn arrays(&self) -> &[Vec<u8>] { &self.arrays }

    /// Whether the last transmission unit was completed.
    pub fn is_finished(&self) -> bool { self.finished }

    /// Takes the accumulated arrays, leaving the destination empty.
    pub fn take(&mut self) -> Vec<Vec<u8>> {
        self.finished = false;
        std::mem::take(&mut self.arrays)
    }
}

impl ChunkDest for BufferDest {
    fn process_array(&mut self, _id: TransmitId, array: Vec<u8>) -> Result<(), IoFailure> {
        self.arrays.push(array);
        Ok(())
    }

    fn finish(&mut self, _id: TransmitId, _termination: Termination) -> Result<(), IoFailure> {
        self.finished = true;
        Ok(())
    }

    fn reset(&mut self) {
        self.arrays.clear();
        self.finished = false;
    }
}

/// Destination writing the arrays in the wire format to a blocking byte stream. Lists are
/// terminated with the end-of-list marker, fixed-size units get none.
#[derive(Debug)]
pub struct StreamDest<W: Write> {
    output: W,
    fd: RawFd,
    written: u64,
}

impl<W: Write> StreamDest<W> {
    pub fn new(output: W) -> Self {
        StreamDest {
            output,
            fd: DETACHED_FD,
            written: 0,
        }
    }

    /// Descriptor reported in the failures of the destination.
    pub fn with_fd(mut self, fd: RawFd) -> Self {
        self.fd = fd;
        self
    }

    /// Total bytes written.
    pub fn written(&self) -> u64 { self.written }

    pub fn into_inner(self) -> W { self.output }

    fn write_fully(&mut self, mut data: &[u8]) -> Result<(), IoFailure> {
        while !data.is_empty() {
            match self.output.write(data) {
                Ok(0) => {
                    return Err(IoError::with_kind(
                        self.fd,
                        io::ErrorKind::WriteZero,
                        "end of flow whilst writing array",
                    )
                    .into())
                }
                Ok(len) => {
                    self.written += len as u64;
                    data = &data[len..];
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    return Err(IoError::from_io(self.fd, &err, "stream destination failure").into())
                }
            }
        }
        Ok(())
    }
}

impl<W: Write> ChunkDest for StreamDest<W> {
    fn process_array(&mut self, _id: TransmitId, array: Vec<u8>) -> Result<(), IoFailure> {
        assert!(array.len() <= MAX_ARRAY_LEN, "array of {} bytes can't be put on the wire", array.len());
        self.write_fully(&(array.len() as u32).to_ne_bytes())?;
        self.write_fully(&array)
    }

    fn finish(&mut self, _id: TransmitId, termination: Termination) -> Result<(), IoFailure> {
        if termination != Termination::None {
            self.write_fully(&END_OF_LIST.to_ne_bytes())?;
        }
        self.output
            .flush()
            .map_err(|err| IoError::from_io(self.fd, &err, "stream destination failure").into())
    }
}

/// Destination handing each array to a callback.
pub struct DelegateDest<F>
where F: FnMut(TransmitId, Vec<u8>)
{
    output: F,
}

impl<F> DelegateDest<F>
where F: FnMut(TransmitId, Vec<u8>)
{
    pub fn new(output: F) -> Self { DelegateDest { output } }
}

impl<F> ChunkDest for DelegateDest<F>
where F: FnMut(TransmitId, Vec<u8>)
{
    fn process_array(&mut self, id: TransmitId, array: Vec<u8>) -> Result<(), IoFailure> {
        (self.output)(id, array);
        Ok(())
    }
}

/// Destination collecting arrays in pairs; the callback runs once both halves have arrived.
pub struct PairDest<F>
where F: FnMut(TransmitId, Vec<u8>, Vec<u8>)
{
    output: F,
    first: Option<Vec<u8>>,
}

impl<F> PairDest<F>
where F: FnMut(TransmitId, Vec<u8>, Vec<u8>)
{
    pub fn new(output: F) -> Self { PairDest { output, first: None } }

    /// A first half is waiting for its pair.
    pub fn is_pending(&self) -> bool { self.first.is_some() }
}

impl<F> ChunkDest for PairDest<F>
where F: FnMut(TransmitId, Vec<u8>, Vec<u8>)
{
    fn process_array(&mut self, id: TransmitId, array: Vec<u8>) -> Result<(), IoFailure> {
        match self.first.take() {
            None => self.first = Some(array),
            Some(first) => (self.output)(id, first, array),
        }
        Ok(())
    }

    fn reset(&mut self) { self.first = None }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::serializer::{encode, Compression};
    use crate::source::{ChunkSource, StreamSource};

    fn arrays(items: &[&[u8]]) -> Vec<Vec<u8>> { items.iter().map(|a| a.to_vec()).collect() }

    #[test]
    fn pair_dest_pairs_arrays() {
        let mut pairs = Vec::new();
        let mut dest = PairDest::new(|_, key, value| pairs.push((key, value)));
        for array in arrays(&[b"a", b"b", b"c", b"d", b"e"]) {
            dest.process_array(1, array).unwrap();
        }
        assert!(dest.is_pending());
        drop(dest);
        assert_eq!(pairs, vec![
            (b"a".to_vec(), b"b".to_vec()),
            (b"c".to_vec(), b"d".to_vec())
        ]);
    }

    #[test]
    fn pair_dest_reset_discards_stale_half() {
        let mut pairs = Vec::new();
        let mut dest = PairDest::new(|_, key, value| pairs.push((key, value)));
        dest.process_array(1, b"stale".to_vec()).unwrap();
        dest.reset();
        dest.process_array(2, b"k".to_vec()).unwrap();
        dest.process_array(2, b"v".to_vec()).unwrap();
        drop(dest);
        assert_eq!(pairs, vec![(b"k".to_vec(), b"v".to_vec())]);
    }

    #[test]
    fn delegate_dest() {
        let mut seen = Vec::new();
        let mut dest = DelegateDest::new(|id, array| seen.push((id, array)));
        dest.process_array(7, b"x".to_vec()).unwrap();
        dest.finish(7, Termination::None).unwrap();
        drop(dest);
        assert_eq!(seen, vec![(7, b"x".to_vec())]);
    }

    #[test]
    fn buffer_dest() {
        let mut dest = BufferDest::new();
        dest.process_array(0, b"x".to_vec()).unwrap();
        dest.finish(0, Termination::None).unwrap();
        assert!(dest.is_finished());
        assert_eq!(dest.take(), arrays(&[b"x"]));
        dest.process_array(0, b"y".to_vec()).unwrap();
        dest.reset();
        assert!(dest.arrays().is_empty());
    }

    /// Writer accepting at most `max` bytes per call.
    struct Narrow {
        data: Vec<u8>,
        max: usize,
    }

    impl Write for Narrow {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let len = buf.len().min(self.max);
            self.data.extend_from_slice(&buf[..len]);
            Ok(len)
        }
        fn flush(&mut self) -> io::Result<()> { Ok(()) }
    }

    #[test]
    fn stream_dest_loops_over_partial_writes() {
        let items = arrays(&[b"HELLO", b"", b"again"]);
        let mut dest = StreamDest::new(Narrow {
            data: vec![],
            max: 3,
        });
        for array in items.clone() {
            dest.process_array(0, array).unwrap();
        }
        dest.finish(0, Termination::EndOfList).unwrap();
        let output = dest.into_inner().data;
        assert_eq!(output, encode(&items, Termination::EndOfList, Compression::None));

        let mut source = StreamSource::new(&output[..]);
        let mut decoded = Vec::new();
        while let Some(len) = source.read_array_length(0).unwrap() {
            if source.end_of_list() {
                break;
            }
            let mut array = vec![0u8; len];
            assert_eq!(source.get_next_chunk(0, &mut array).unwrap(), len);
            decoded.push(array);
            source.next_array();
        }
        assert_eq!(decoded, items);
    }

    #[test]
    fn stream_dest_marks_only_lists() {
        use crate::terminator::Terminator;

        let cases: [(Terminator, &[&[u8]]); 4] = [
            (Terminator::SingleArray, &[b"abc"]),
            (Terminator::SinglePair, &[b"key", b"value"]),
            (Terminator::ArrayList, &[b"a", b"", b"c"]),
            (Terminator::PairList, &[b"k1", b"v1", b"k2", b"v2"]),
        ];
        for (terminator, items) in cases {
            let items = arrays(items);
            let mut dest = StreamDest::new(Vec::new());
            for array in items.clone() {
                dest.process_array(0, array).unwrap();
            }
            dest.finish(0, terminator.termination()).unwrap();
            let output = dest.into_inner();
            assert_eq!(
                output,
                encode(&items, terminator.termination(), Compression::None),
                "{terminator}"
            );
        }

        let mut dest = StreamDest::new(Vec::new());
        dest.process_array(0, b"abc".to_vec()).unwrap();
        dest.finish(0, Termination::None).unwrap();
        assert_eq!(dest.into_inner(), [3u32.to_ne_bytes().as_slice(), b"abc"].concat());
    }

    #[test]
    fn stream_dest_zero_write_is_an_error() {
        let mut dest = StreamDest::new(Narrow {
            data: vec![],
            max: 0,
        })
        .with_fd(9);
        let err = dest.process_array(0, b"x".to_vec()).unwrap_err();
        assert!(!err.is_warning());
        assert_eq!(err.fd(), 9);
    }
}
