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

//! Policies defining how a logical transmission unit ends.

/// Identifier of a logical transmission, passed to delegate sources and destinations.
pub type TransmitId = u64;

/// State of an array transmission (or reception).
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Display)]
pub enum TransmitState {
    #[default]
    #[display("initial")]
    Initial,
    #[display("get-array")]
    GetArray,
    #[display("transmit-array")]
    TransmitArray,
    #[display("finished")]
    Finished,
}

/// End marker written after the arrays of a unit.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
pub enum Termination {
    #[display("none")]
    None,
    #[display("end-of-list")]
    EndOfList,
    #[display("end-of-pair-list")]
    EndOfPairList,
}

/// What a logical transmission unit consists of. The terminator owns no data: it is selected per
/// request type and only decides when the unit is complete.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
pub enum Terminator {
    /// Exactly one array.
    #[display("single-array")]
    SingleArray,
    /// Exactly two arrays, a key and a value.
    #[display("single-pair")]
    SinglePair,
    /// Any number of arrays followed by the end-of-list marker.
    #[display("array-list")]
    ArrayList,
    /// Any number of array pairs followed by the end-of-list marker.
    #[display("pair-list")]
    PairList,
}

impl Terminator {
    /// Arrays forming a single item of the unit.
    pub fn arrays_per_item(self) -> usize {
        match self {
            Terminator::SingleArray | Terminator::ArrayList => 1,
            Terminator::SinglePair | Terminator::PairList => 2,
        }
    }

    /// Whether the unit is ended by an explicit marker rather than by the array count.
    pub fn is_list(self) -> bool { matches!(self, Terminator::ArrayList | Terminator::PairList) }

    pub fn termination(self) -> Termination {
        match self {
            Terminator::SingleArray | Terminator::SinglePair => Termination::None,
            Terminator::ArrayList => Termination::EndOfList,
            Terminator::PairList => Termination::EndOfPairList,
        }
    }

    /// Whether `arrays` transmitted arrays complete a fixed-size unit. Always `false` for lists.
    pub fn is_complete(self, arrays: usize) -> bool {
        !self.is_list() && arrays >= self.arrays_per_item()
    }

    /// Whether a list may end after `arrays` arrays without breaking an item in two.
    pub fn may_end_after(self, arrays: usize) -> bool {
        self.is_list() && arrays % self.arrays_per_item() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fixed_units() {
        assert!(!Terminator::SingleArray.is_complete(0));
        assert!(Terminator::SingleArray.is_complete(1));
        assert!(!Terminator::SinglePair.is_complete(1));
        assert!(Terminator::SinglePair.is_complete(2));
        assert_eq!(Terminator::SinglePair.termination(), Termination::None);
    }

    #[test]
    fn lists() {
        assert!(!Terminator::ArrayList.is_complete(100));
        assert!(Terminator::ArrayList.may_end_after(0));
        assert!(Terminator::ArrayList.may_end_after(3));
        assert!(Terminator::PairList.may_end_after(4));
        assert!(!Terminator::PairList.may_end_after(3));
        assert!(!Terminator::SinglePair.may_end_after(2));
        assert_eq!(Terminator::PairList.termination(), Termination::EndOfPairList);
        assert_eq!(Terminator::PairList.to_string(), "pair-list");
    }
}
