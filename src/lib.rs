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

#![deny(
    non_upper_case_globals,
    non_camel_case_types,
    non_snake_case,
    unused_mut,
    unused_imports,
    dead_code,
    //missing_docs
)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Resumable transport of arrays, lists of arrays and lists of key-value pairs over
//! non-blocking sockets.
//!
//! A single thread runs a poll reactor ([`Runtime`], optionally inside a [`Reactor`] thread)
//! which delivers readiness notifications to a service. Each notification results in at most one
//! non-blocking syscall on the socket ([`select`]); everything that does not fit into it is kept
//! in cursors owned by the connection, and the work resumes on the next notification.
//!
//! Arrays go on the wire as a native-endian `u32` length followed by the raw (or LZ4-compressed)
//! bytes; lists end with the reserved length [`serializer::END_OF_LIST`]. Arrays are pulled from
//! a [`ChunkSource`] by the [`ArraysTransmitter`] and delivered to a [`ChunkDest`] by the
//! [`ArraysReceiver`], with a [`Terminator`] deciding where a logical unit ends.
//!
//! Accepted sockets are served by a [`SelectListener`] through a [`Pool`] of [`Connection`]
//! handlers running an application [`Protocol`].

#[macro_use]
extern crate amplify;

pub mod connection;
mod controller;
pub mod cursor;
pub mod dest;
pub mod error;
pub mod listener;
pub mod nonblock;
pub mod poller;
pub mod pool;
mod reactor;
pub mod runtime;
pub mod select;
pub mod serializer;
pub mod source;
pub mod terminator;
pub mod transmit;

pub use connection::{
    Assignment, Connection, ConnectionInfo, ConnectionState, Flow, Listen, Protocol,
};
pub use controller::Controller;
pub use dest::{BufferDest, ChunkDest, DelegateDest, PairDest, StreamDest};
pub use error::{IoError, IoFailure, IoWarning, PoolError};
pub use listener::{ListenerCmd, SelectListener};
pub use nonblock::Device;
pub use pool::{Pool, PoolConfig, PoolKey, Recycle};
pub use reactor::Reactor;
pub use runtime::{Action, Error, Runtime, Service};
pub use select::{SelectReader, SelectWriter};
pub use serializer::{ChunkDeserializer, ChunkSerializer, Compression};
pub use source::{BufferSource, ChunkSource, DelegateSource, ListSource, PairDelegateSource, StreamSource};
pub use terminator::{Termination, Terminator, TransmitId, TransmitState};
pub use transmit::{ArraysReceiver, ArraysTransmitter, TransmitConfig};
