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
use std::os::unix::io::AsRawFd;

use crate::poller::IoType;

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Io {
    Read,
    Write,
}

/// Kind of a resource, reported by the reactor runtime upon registration.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
pub enum ResourceType {
    #[display("listener")]
    Listener,
    #[display("transport")]
    Transport,
}

/// Anything a reactor may poll: a listening socket or a client connection.
pub trait Resource: AsRawFd + WriteAtomic + Send {
    type Event;

    fn kind(&self) -> ResourceType;

    /// Readiness the resource currently wants to be woken for. Queried by the runtime before
    /// each poll, so a resource changes its registration simply by changing its own state.
    fn interests(&self) -> IoType;

    fn handle_io(&mut self, io: Io) -> Option<Self::Event>;

    fn disconnect(self) -> io::Result<()>;
}

#[derive(Debug, Display, Error, From)]
pub enum WriteError {
    /// Underlying resource is not ready to accept the data: for instance, it is a listener or a
    /// connection which already has a response in flight. This error happens only due to a
    /// business logic bug in a [`crate::runtime::Handler`] implementation.
    #[display("resource not ready to accept the data")]
    NotReady,

    /// Error returned by the operation system and not by the resource itself.
    #[display(inner)]
    #[from]
    Io(io::Error),
}

/// The trait guarantees that the data are either taken in full for the delivery - or, in case of
/// an error, none of the data is taken. Data are delivered later, when the resource becomes
/// writable, in the original order.
pub trait WriteAtomic {
    fn write_atomic(&mut self, buf: Vec<u8>) -> Result<(), WriteError> {
        if !self.is_ready_to_write() {
            Err(WriteError::NotReady)
        } else {
            self.write_or_buf(buf).map_err(WriteError::from)
        }
    }

    fn is_ready_to_write(&self) -> bool;

    /// Empties any write buffers in a non-blocking way.
    ///
    /// # Returns
    ///
    /// Whether the buffer was fully flushed.
    fn empty_write_buf(&mut self) -> io::Result<bool>;

    fn write_or_buf(&mut self, buf: Vec<u8>) -> io::Result<()>;
}
