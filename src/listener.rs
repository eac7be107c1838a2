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

//! Reactor service accepting connections into a pool of connection handlers.

use std::collections::{HashMap, VecDeque};
use std::os::unix::io::RawFd;

use crossbeam_channel as chan;

use crate::connection::{Assignment, Connection, ConnectionInfo, Flow, Listen, Protocol};
use crate::nonblock::is_retry;
use crate::poller::{Events, IoType};
use crate::pool::{Pool, PoolConfig, PoolKey};
use crate::runtime::{Action, Error, Service};

/// Commands of a [`SelectListener`].
#[derive(Debug)]
pub enum ListenerCmd {
    /// Replies with one `fd=<n>, remote=<addr>, ioerr=<bool>` line per busy connection.
    Report(chan::Sender<String>),
    /// Closes all the connections and terminates the reactor.
    Shutdown,
}

pub struct SelectListener<L: Listen, P: Protocol> {
    listener: L,
    pool: Pool<Connection<L, P>>,
    connections: HashMap<RawFd, PoolKey>,
    interests: HashMap<RawFd, IoType>,
    actions: VecDeque<Action>,
    accepted: u64,
    rejected: u64,
}

impl<L: Listen, P: Protocol> SelectListener<L, P> {
    /// The listening socket must be non-blocking.
    pub fn new(
        listener: L,
        config: PoolConfig,
        mut factory: impl FnMut() -> P + Send + 'static,
    ) -> Self
    where
        L: 'static,
        P: 'static,
    {
        let fd = listener.as_raw_fd();
        SelectListener {
            listener,
            pool: Pool::new(config, move || Connection::new(factory())),
            connections: empty!(),
            interests: empty!(),
            actions: VecDeque::from([Action::Register(fd, IoType::read_only())]),
            accepted: 0,
            rejected: 0,
        }
    }

    pub fn listener(&self) -> &L { &self.listener }

    pub fn pool(&self) -> &Pool<Connection<L, P>> { &self.pool }

    /// Connections accepted into the pool.
    pub fn accepted(&self) -> u64 { self.accepted }

    /// Connections dropped right after accepting since the pool was exhausted.
    pub fn rejected(&self) -> u64 { self.rejected }

    pub fn report(&self) -> String { self.pool.info().join("\n") }

    #[cfg_attr(not(feature = "log"), allow(unused_variables))]
    fn accept_all(&mut self) {
        loop {
            let key = match self.pool.acquire() {
                Ok(key) => key,
                Err(err) => match self.listener.accept_nonblocking() {
                    Ok((stream, remote)) => {
                        #[cfg(feature = "log")]
                        log::warn!(target: "listener", "Rejecting connection from {remote}: {err}");
                        drop(stream);
                        self.rejected += 1;
                        continue;
                    }
                    Err(err) if is_retry(&err) => break,
                    Err(err) => {
                        #[cfg(feature = "log")]
                        log::error!(target: "listener", "Unable to accept connection: {err}");
                        break;
                    }
                },
            };

            let Some(conn) = self.pool.get_mut(key) else {
                unreachable!("acquired item is always busy")
            };
            match conn.assign(&self.listener) {
                Assignment::Connected => {
                    let fd = conn.fd();
                    let interest = conn.interests();
                    self.connections.insert(fd, key);
                    self.interests.insert(fd, interest);
                    self.actions.push_back(Action::Register(fd, interest));
                    self.accepted += 1;
                }
                Assignment::Pending | Assignment::Failed => {
                    self.pool.recycle(key);
                    break;
                }
            }
        }
    }

    fn close(&mut self, fd: RawFd, key: PoolKey) {
        self.connections.remove(&fd);
        self.interests.remove(&fd);
        self.actions.push_back(Action::Unregister(fd));
        self.pool.recycle(key);
    }
}

impl<L: Listen, P: Protocol> Iterator for SelectListener<L, P> {
    type Item = Action;

    fn next(&mut self) -> Option<Self::Item> { self.actions.pop_front() }
}

impl<L, P> Service for SelectListener<L, P>
where
    L: Listen + Send,
    L::Stream: Send,
    L::Addr: Send,
    P: Protocol + Send,
{
    type Command = ListenerCmd;

    fn handle_event(&mut self, fd: RawFd, events: Events) {
        if fd == self.listener.as_raw_fd() {
            if events.error {
                #[cfg(feature = "log")]
                log::error!(target: "listener", "Listening socket {fd} reports `{events}`");
            }
            self.accept_all();
            return;
        }

        let Some(&key) = self.connections.get(&fd) else {
            #[cfg(feature = "log")]
            log::warn!(target: "listener", "Event `{events}` for {fd} which has no connection");
            return;
        };
        let Some(conn) = self.pool.get_mut(key) else {
            unreachable!("connection {key} is busy while registered")
        };

        let mut flow = conn.handle(events);
        while flow == Flow::Continue && conn.has_pending() {
            #[cfg(feature = "log")]
            log::trace!(target: "listener", "Connection {fd} has pending input");
            flow = conn.handle(Events::default());
        }

        match flow {
            Flow::Continue => {
                let interest = conn.interests();
                if self.interests.insert(fd, interest) != Some(interest) {
                    self.actions.push_back(Action::SetInterest(fd, interest));
                }
            }
            Flow::Close => self.close(fd, key),
        }
    }

    fn handle_command(&mut self, cmd: Self::Command) {
        match cmd {
            ListenerCmd::Report(reply) => {
                if reply.send(self.report()).is_err() {
                    #[cfg(feature = "log")]
                    log::warn!(target: "listener", "Report requester has gone");
                }
            }
            ListenerCmd::Shutdown => {
                #[cfg(feature = "log")]
                log::info!(target: "listener", "Shutting down {} connections", self.connections.len());
                let connections = self.connections.drain().collect::<Vec<_>>();
                for (fd, key) in connections {
                    if let Some(conn) = self.pool.get_mut(key) {
                        conn.finalize();
                    }
                    self.interests.remove(&fd);
                    self.actions.push_back(Action::Unregister(fd));
                    self.pool.recycle(key);
                }
                self.actions.push_back(Action::Unregister(self.listener.as_raw_fd()));
                self.actions.push_back(Action::Terminate);
            }
        }
    }

    #[cfg_attr(not(feature = "log"), allow(unused_variables))]
    fn handle_error(&mut self, err: Error) {
        #[cfg(feature = "log")]
        log::error!(target: "listener", "Reactor error: {err}");
    }
}
