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

//! Poll engine built on top of the [`popol`] library.

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use crate::poller::{Events, IoType, Poll, SocketWaker, Waker};

/// Manager for a set of descriptors which are polled for an event loop by using [`popol`]
/// library.
pub struct Poller {
    sources: popol::Sources<RawFd>,
    fired: Vec<popol::Event<RawFd>>,
    events: VecDeque<(RawFd, Events)>,
}

impl Default for Poller {
    fn default() -> Self { Self::new() }
}

impl Poller {
    pub fn new() -> Self {
        Self {
            sources: popol::Sources::new(),
            fired: empty!(),
            events: empty!(),
        }
    }

    /// Number of registered descriptors.
    pub fn len(&self) -> usize { self.sources.len() }

    pub fn is_empty(&self) -> bool { self.sources.len() == 0 }
}

fn interest(io: IoType) -> popol::Interest {
    let mut e = popol::interest::NONE;
    if io.read {
        e |= popol::interest::READ;
    }
    if io.write {
        e |= popol::interest::WRITE;
    }
    e
}

impl Poll for Poller {
    type Waker = SocketWaker;

    fn register_waker(&mut self, waker: &<Self::Waker as Waker>::Recv) {
        let fd = waker.as_raw_fd();
        #[cfg(feature = "log")]
        log::trace!(target: "popol", "Registering waker {fd}");
        self.sources.register(fd, &fd, popol::interest::READ);
    }

    fn register(&mut self, fd: RawFd, io: IoType) {
        #[cfg(feature = "log")]
        log::trace!(target: "popol", "Registering {fd} with interest `{io}`");
        self.sources.register(fd, &fd, interest(io));
    }

    fn unregister(&mut self, fd: RawFd) {
        #[cfg(feature = "log")]
        log::trace!(target: "popol", "Unregistering {fd}");
        self.sources.unregister(&fd);
        self.events.retain(|(id, _)| *id != fd);
    }

    fn set_interest(&mut self, fd: RawFd, io: IoType) -> bool {
        #[cfg(feature = "log")]
        log::trace!(target: "popol", "Setting interest `{io}` on {fd}");

        self.sources.unset(&fd, interest(!io));
        self.sources.set(&fd, interest(io))
    }

    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let len = self.events.len();

        #[cfg(feature = "log")]
        log::trace!(target: "popol",
            "Polling {} descriptors with timeout {timeout:?} (pending event queue is {len})",
            self.sources.len(),
        );

        self.fired.clear();
        // Blocking call
        let timeout = match timeout {
            Some(duration) => popol::Timeout::from(duration),
            None => popol::Timeout::Never,
        };
        match self.sources.poll(&mut self.fired, timeout) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                #[cfg(feature = "log")]
                log::trace!(target: "popol", "Poll timed out with zero events generated");
                return Ok(0);
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(err) => return Err(err),
        }

        for event in self.fired.drain(..) {
            let fired = Events {
                readable: event.is_readable(),
                writable: event.is_writable(),
                read_hangup: false,
                hangup: event.is_hangup(),
                error: event.is_error() || event.is_invalid(),
            };
            #[cfg(feature = "log")]
            log::trace!(target: "popol", "Got `{fired}` for {}", event.key);
            self.events.push_back((event.key, fired));
        }

        #[cfg(feature = "log")]
        log::trace!(target: "popol", "Poll resulted in {} new event(s)", self.events.len() - len);

        Ok(self.events.len() - len)
    }
}

impl Iterator for Poller {
    type Item = (RawFd, Events);

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.events.pop_front();
        #[cfg(feature = "log")]
        match next {
            Some((fd, events)) => {
                log::trace!(target: "popol", "Popped event `{events}` for {fd} from the queue")
            }
            None => log::trace!(target: "popol", "Popol queue emptied"),
        }
        next
    }
}
