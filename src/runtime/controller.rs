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

use std::fmt::Debug;
use std::io;

use crossbeam_channel as chan;

use crate::poller::WakerSend;

#[derive(Debug)]
pub enum Ctl<C> {
    Cmd(C),
    Shutdown,
}

/// Control API to the service which is run inside a reactor.
///
/// This is the only way other threads talk to a reactor: the message is put into the reactor
/// inbound queue and the reactor poll is woken up, so the reactor thread applies the message
/// itself right after it finishes with the pending I/O events. Nothing outside the reactor thread
/// ever touches its poller registration table.
pub struct Controller<C, W: WakerSend> {
    ctl_send: chan::Sender<Ctl<C>>,
    waker: W,
}

impl<C, W: WakerSend> Clone for Controller<C, W> {
    fn clone(&self) -> Self {
        Controller {
            ctl_send: self.ctl_send.clone(),
            waker: self.waker.clone(),
        }
    }
}

impl<C, W: WakerSend> Controller<C, W> {
    pub(crate) fn new(ctl_send: chan::Sender<Ctl<C>>, waker: W) -> Self { Self { ctl_send, waker } }

    /// Send a command to the service inside a reactor.
    ///
    /// # Errors
    ///
    /// If the reactor thread has already exited the command can't be delivered and is returned
    /// back to the caller.
    pub fn cmd(&self, command: C) -> Result<(), C>
    where C: Debug {
        log::trace!(target: "reactor-controller", "Sending command {command:?} to the reactor");

        if let Err(chan::SendError(Ctl::Cmd(command))) = self.ctl_send.send(Ctl::Cmd(command)) {
            return Err(command);
        }
        // The command is queued; the reactor will pick it up on its next wake-up even if this
        // particular signal fails.
        if let Err(err) = self.wake() {
            log::warn!(target: "reactor-controller", "Unable to wake the reactor: {err}");
        }
        Ok(())
    }

    /// Shutdown the reactor.
    pub fn shutdown(self) -> Result<(), Self> {
        log::info!(target: "reactor-controller", "Initiating reactor shutdown...");

        let res1 = self.ctl_send.send(Ctl::Shutdown).map_err(|_| ());
        let res2 = self.wake().map_err(|_| ());
        res1.and(res2).map_err(|_| self)
    }

    pub(crate) fn wake(&self) -> io::Result<()> {
        log::trace!(target: "reactor-controller", "Wakening the reactor");
        self.waker.wake()
    }
}
