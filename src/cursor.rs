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

//! Resumable positions inside arrays which are transmitted over many readiness events.

/// Write-side cursor pair.
///
/// `value` is the position inside the encoded array (length prefix included) and only returns
/// to zero once the whole array was written; `buffer` is the position inside the physical output
/// buffer and returns to zero on each flush. `chunk` tracks how much of the chunk currently
/// passed to the serializer was already copied, so that a chunk may span several flushes.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct WriteCursor {
    pub value: usize,
    pub buffer: usize,
    pub chunk: usize,
}

impl WriteCursor {
    pub fn new() -> Self { default!() }

    /// No part of the current array was written yet.
    pub fn is_array_start(&self) -> bool { self.value == 0 }

    /// The output buffer of the given capacity can't take any more bytes.
    pub fn needs_flush(&self, capacity: usize) -> bool { self.buffer >= capacity }

    /// Marks the output buffer as flushed to the device.
    pub fn flushed(&mut self) { self.buffer = 0 }

    pub fn reset(&mut self) { *self = default!() }

    /// Copies as much of `data` into `buf` as fits after the buffer cursor, advancing it.
    pub(crate) fn put(&mut self, buf: &mut [u8], data: &[u8]) -> usize {
        debug_assert!(self.buffer <= buf.len());
        let len = data.len().min(buf.len() - self.buffer);
        buf[self.buffer..self.buffer + len].copy_from_slice(&data[..len]);
        self.buffer += len;
        len
    }
}

/// Read position of a chunk source.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct SourceCursor {
    /// Bytes of the current array already delivered.
    pub array: usize,
    /// Whole arrays already yielded.
    pub processed: usize,
}

impl SourceCursor {
    pub fn new() -> Self { default!() }

    pub fn remaining(&self, array_len: usize) -> usize { array_len - self.array }

    /// Accounts for `len` more bytes delivered from an array of `array_len` bytes.
    ///
    /// # Panics
    ///
    /// If the delivery goes past the end of the array.
    pub fn consume(&mut self, len: usize, array_len: usize) {
        assert!(
            self.array + len <= array_len,
            "requested chunk of {len} bytes exceeds the {} unread bytes of the array",
            array_len - self.array
        );
        self.array += len;
    }

    /// Moves to the next array of a list.
    pub fn advance(&mut self) {
        self.processed += 1;
        self.array = 0;
    }
}
