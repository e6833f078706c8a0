// Minimal HTTP/1.1 server on top of a multi-reactor event loop.
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2021-2023 by
//     Dr. Maxim Orlovsky <orlovsky@ubideco.org>
//     Alexis Sellier <alexis@cloudhead.io>
//
// Copyright 2022-2023 UBIDECO Institute, Switzerland
// Copyright 2021 Alexis Sellier <alexis@cloudhead.io>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::io;
use std::thread::{self, JoinHandle};

use crossbeam_channel as chan;

use crate::poller::{Poll, Waker};
use crate::runtime::{Controller, Handler, Runtime};

/// Reactor [`Runtime`] running in its own thread.
///
/// The handler and the poller are moved into the thread; afterwards the only way to reach the
/// handler is through the [`Controller`].
pub struct Reactor<H: Handler, P: Poll> {
    thread: JoinHandle<()>,
    controller: Controller<H::Command, <P::Waker as Waker>::Send>,
}

impl<H: Handler + 'static, P: Poll + 'static> Reactor<H, P> {
    /// Spawns the reactor on a thread with the given name.
    ///
    /// # Errors
    ///
    /// Fails if the waker can't be created or the thread can't be spawned.
    pub fn named(service: H, poller: P, thread_name: String) -> io::Result<Self> {
        let (ctl_send, ctl_recv) = chan::unbounded();
        let (wake_send, wake_recv) = P::Waker::pair()?;
        let controller = Controller::new(ctl_send, wake_send);

        log::debug!(target: "reactor-controller", "Spawning reactor thread `{thread_name}`");

        let thread = thread::Builder::new().name(thread_name).spawn(move || {
            log::info!(target: "reactor", "Entering reactor event loop");
            Runtime::with(service, poller, ctl_recv, wake_recv).run();
            log::info!(target: "reactor", "Reactor event loop has exited");
        })?;

        // Actions queued by the service before the start must be picked up without waiting for
        // the first I/O event.
        controller.wake()?;
        Ok(Reactor { thread, controller })
    }

    pub fn controller(&self) -> Controller<H::Command, <P::Waker as Waker>::Send> {
        self.controller.clone()
    }

    /// Whether the reactor thread has exited, either after a shutdown or after a fatal error.
    pub fn is_finished(&self) -> bool { self.thread.is_finished() }

    pub fn join(self) -> thread::Result<()> { self.thread.join() }
}
