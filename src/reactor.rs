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

#[cfg(feature = "log")]
use std::os::fd::AsRawFd;
use std::thread::JoinHandle;
use std::{io, thread};

use crate::controller::Controller;
use crate::poller::{Poll, Waker};
use crate::runtime::{Runtime, Service};

/// [`Runtime`] running on a dedicated thread.
///
/// The service is reachable from other threads only through the [`Controller`].
pub struct Reactor<S: Service, P: Poll> {
    thread: JoinHandle<()>,
    controller: Controller<S::Command, <P::Waker as Waker>::Send>,
}

impl<S: Service, P: Poll> Reactor<S, P> {
    /// Moves the service and the poll engine to a new thread and starts the event loop there.
    ///
    /// # Error
    ///
    /// Errors if the waker can't be created or the thread can't be spawned.
    pub fn new(service: S, poller: P) -> Result<Self, io::Error>
    where
        S: 'static,
        P: 'static,
    {
        Reactor::with(service, poller, thread::Builder::new())
    }

    /// Same as [`Reactor::new`] with a named thread.
    pub fn named(service: S, poller: P, thread_name: String) -> Result<Self, io::Error>
    where
        S: 'static,
        P: 'static,
    {
        Reactor::with(service, poller, thread::Builder::new().name(thread_name))
    }

    /// Same as [`Reactor::new`] with a custom thread builder.
    pub fn with(service: S, mut poller: P, builder: thread::Builder) -> Result<Self, io::Error>
    where
        S: 'static,
        P: 'static,
    {
        let (ctl_send, ctl_recv) = crossbeam_channel::unbounded();

        let (waker_writer, waker_reader) = P::Waker::pair()?;

        let controller = Controller::new(ctl_send, waker_writer);

        #[cfg(feature = "log")]
        log::debug!(target: "reactor-controller", "Spawning reactor thread");

        let runtime_controller = controller.clone();
        let thread = builder.spawn(move || {
            #[cfg(feature = "log")]
            log::debug!(target: "reactor", "Registering waker (fd {})", waker_reader.as_raw_fd());
            poller.register_waker(&waker_reader);

            let runtime =
                Runtime::from_parts(service, poller, runtime_controller, ctl_recv, waker_reader);

            runtime.run();
        })?;

        Ok(Self { thread, controller })
    }

    pub fn controller(&self) -> Controller<S::Command, <P::Waker as Waker>::Send> {
        self.controller.clone()
    }

    /// Joins the reactor thread.
    pub fn join(self) -> thread::Result<()> { self.thread.join() }
}
