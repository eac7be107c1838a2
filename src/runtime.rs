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

//! Single-threaded event loop dispatching readiness notifications to a service.

use std::collections::HashMap;
use std::fmt::Debug;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use crossbeam_channel as chan;

use crate::controller::{Controller, Ctl};
use crate::poller::{Events, IoType, Poll, Waker, WakerRecv};

/// Maximum amount of time to wait for I/O.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Reactor errors
#[derive(Debug, Display, Error)]
#[display(doc_comments)]
pub enum Error {
    /// polling multiple descriptors has failed. Details: {0:?}
    Poll(io::Error),

    /// event for descriptor {0} which is not registered by the service.
    Unknown(RawFd),
}

/// I/O action generated by the service for the runtime.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
pub enum Action {
    #[display("register({0}, {1})")]
    Register(RawFd, IoType),

    #[display("set-interest({0}, {1})")]
    SetInterest(RawFd, IoType),

    #[display("unregister({0})")]
    Unregister(RawFd),

    /// Stops the event loop.
    #[display("terminate")]
    Terminate,
}

/// Service run by a reactor.
///
/// The service is owned by the runtime and always executes in the context of the runtime
/// thread; actions are taken from the service iterator after each callback.
pub trait Service: Send + Iterator<Item = Action> {
    /// A command which may be sent to the service from outside the reactor, including other
    /// threads, through the [`Controller`] API.
    type Command: Debug + Send;

    /// Method called by the runtime on the start of each event loop once the poll has returned.
    fn tick(&mut self, _time: Instant) {}

    /// Readiness notification for a descriptor registered by the service.
    fn handle_event(&mut self, fd: RawFd, events: Events);

    /// Method called when a [`Self::Command`] is received through the [`Controller`].
    fn handle_command(&mut self, cmd: Self::Command);

    /// Method called on any kind of error during the event loop.
    fn handle_error(&mut self, err: Error);
}

/// Event loop state: the service, the poll engine and the control channel.
pub struct Runtime<S: Service, P: Poll> {
    service: S,
    poller: P,
    controller: Controller<S::Command, <P::Waker as Waker>::Send>,
    ctl_recv: chan::Receiver<Ctl<S::Command>>,
    waker: <P::Waker as Waker>::Recv,
    registered: HashMap<RawFd, IoType>,
    timeout: Duration,
    terminated: bool,
}

impl<S: Service, P: Poll> Runtime<S, P> {
    /// Creates a runtime operated from the current thread.
    ///
    /// # Error
    ///
    /// Errors with a system/OS error if it was impossible to create the waker.
    pub fn with(service: S, mut poller: P) -> io::Result<Self> {
        let (ctl_send, ctl_recv) = chan::unbounded();
        let (waker_writer, waker_reader) = P::Waker::pair()?;
        let controller = Controller::new(ctl_send, waker_writer);
        poller.register_waker(&waker_reader);
        Ok(Runtime::from_parts(service, poller, controller, ctl_recv, waker_reader))
    }

    /// Assembles a runtime around a poll engine which has the waker already registered.
    pub(crate) fn from_parts(
        service: S,
        poller: P,
        controller: Controller<S::Command, <P::Waker as Waker>::Send>,
        ctl_recv: chan::Receiver<Ctl<S::Command>>,
        waker: <P::Waker as Waker>::Recv,
    ) -> Self {
        Runtime {
            service,
            poller,
            controller,
            ctl_recv,
            waker,
            registered: empty!(),
            timeout: WAIT_TIMEOUT,
            terminated: false,
        }
    }

    /// Overrides [`WAIT_TIMEOUT`].
    pub fn set_timeout(&mut self, timeout: Duration) { self.timeout = timeout }

    pub fn service(&self) -> &S { &self.service }

    /// Provides a copy of a [`Controller`] object which exposes an API to the service running
    /// inside the runtime.
    pub fn controller(&self) -> Controller<S::Command, <P::Waker as Waker>::Send> {
        self.controller.clone()
    }

    /// Executes the event loop until the service terminates it or the controller shuts it down.
    pub fn run(mut self) {
        #[cfg(feature = "log")]
        log::info!(target: "reactor", "Entering reactor event loop");

        if !self.handle_actions() {
            return self.handle_shutdown();
        }

        loop {
            // Blocking
            #[cfg(feature = "log")]
            log::trace!(target: "reactor", "Polling with timeout {:?}", self.timeout);

            let res = self.poller.poll(Some(self.timeout));
            self.service.tick(Instant::now());

            match res {
                Ok(0) => {
                    #[cfg(feature = "log")]
                    log::trace!(target: "reactor", "Poll timeout; no I/O events had happened");
                }
                Err(err) => {
                    #[cfg(feature = "log")]
                    log::error!(target: "reactor", "Error during polling: {err}");
                    self.service.handle_error(Error::Poll(err));
                }
                _ => {}
            }

            let awoken = self.handle_events();
            if self.terminated {
                break;
            }

            // Process the commands only if we awaken by the waker
            if awoken {
                loop {
                    match self.ctl_recv.try_recv() {
                        Err(chan::TryRecvError::Empty) => break,
                        Err(chan::TryRecvError::Disconnected) => {
                            panic!("control channel is broken")
                        }
                        Ok(Ctl::Shutdown) => return self.handle_shutdown(),
                        Ok(Ctl::Cmd(cmd)) => {
                            #[cfg(feature = "log")]
                            log::trace!(target: "reactor", "Handling command {cmd:?}");
                            self.service.handle_command(cmd);
                            if !self.handle_actions() {
                                return self.handle_shutdown();
                            }
                        }
                    }
                }
            }

            if !self.handle_actions() {
                break;
            }
        }
        self.handle_shutdown()
    }

    /// # Returns
    ///
    /// Whether it was awakened by a waker.
    fn handle_events(&mut self) -> bool {
        let waker = self.waker.as_raw_fd();
        let mut awoken = false;

        while let Some((fd, events)) = self.poller.next() {
            if fd == waker {
                #[cfg(feature = "log")]
                log::trace!(target: "reactor", "Awoken by the controller");
                self.waker.reset();
                awoken = true;
            } else if self.registered.contains_key(&fd) {
                #[cfg(feature = "log")]
                log::trace!(target: "reactor", "Got `{events}` event for {fd}");
                self.service.handle_event(fd, events);
                // Unregistrations must take place before the queued events of other descriptors
                // are dispatched
                if !self.handle_actions() {
                    break;
                }
            } else {
                #[cfg(feature = "log")]
                log::warn!(target: "reactor", "Got `{events}` event for unknown descriptor {fd}");
                self.service.handle_error(Error::Unknown(fd));
            }
        }

        awoken
    }

    /// Handles the actions from the queue.
    ///
    /// # Return
    ///
    /// Return value indicates whether the reactor must proceed operating (`true`) or should
    /// terminate (`false`).
    fn handle_actions(&mut self) -> bool {
        while let Some(action) = self.service.next() {
            #[cfg(feature = "log")]
            log::trace!(target: "reactor", "Handling action {action} from the service");

            match action {
                Action::Register(fd, interest) => {
                    if self.registered.contains_key(&fd) {
                        self.poller.unregister(fd);
                    }
                    self.poller.register(fd, interest);
                    self.registered.insert(fd, interest);
                }
                Action::SetInterest(fd, interest) => {
                    if self.registered.contains_key(&fd) && self.poller.set_interest(fd, interest) {
                        self.registered.insert(fd, interest);
                    } else {
                        #[cfg(feature = "log")]
                        log::warn!(target: "reactor", "Setting interest `{interest}` on unregistered {fd}");
                    }
                }
                Action::Unregister(fd) => {
                    self.poller.unregister(fd);
                    self.registered.remove(&fd);
                }
                Action::Terminate => {
                    self.terminated = true;
                    return false;
                }
            }
        }
        true
    }

    fn handle_shutdown(self) {
        #[cfg(feature = "log")]
        log::info!(target: "reactor", "Shutdown of the event loop with {} registered descriptors", self.registered.len());
    }
}
