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

//! Poll engine backed by the [`popol`] library.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use crate::poller::{IoFail, IoType, Poll, Waker, WakerRecv, WakerSend};

/// Manager for a set of resources which are polled for an event loop by the
/// re-actor by using [`popol`] library.
pub struct Poller {
    poll: popol::Sources<RawFd>,
    fired: Vec<popol::Event<RawFd>>,
    events: VecDeque<(RawFd, Result<IoType, IoFail>)>,
}

impl Default for Poller {
    fn default() -> Self { Self::new() }
}

impl Poller {
    pub fn new() -> Self {
        Self {
            poll: popol::Sources::new(),
            fired: empty!(),
            events: empty!(),
        }
    }

    /// Number of registered sources, including the waker.
    pub fn len(&self) -> usize { self.poll.len() }

    pub fn is_empty(&self) -> bool { self.poll.is_empty() }
}

impl Poll for Poller {
    type Waker = PopolWaker;

    fn register_waker(&mut self, fd: &impl AsRawFd) {
        log::trace!(target: "popol", "Registering waker {}", fd.as_raw_fd());
        self.poll.register(fd.as_raw_fd(), fd, popol::interest::READ);
    }

    fn register(&mut self, fd: &impl AsRawFd, interest: IoType) {
        log::trace!(target: "popol", "Registering {} for `{interest}`", fd.as_raw_fd());
        self.poll.register(fd.as_raw_fd(), fd, interest.into());
    }

    fn unregister(&mut self, fd: &impl AsRawFd) {
        log::trace!(target: "popol", "Unregistering {}", fd.as_raw_fd());
        self.poll.unregister(&fd.as_raw_fd());
    }

    fn set_interest(&mut self, fd: &impl AsRawFd, interest: IoType) -> bool {
        let fd = fd.as_raw_fd();

        log::trace!(target: "popol", "Setting interest `{interest}` on {fd}");

        self.poll.unset(&fd, (!interest).into());
        self.poll.set(&fd, interest.into())
    }

    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let len = self.events.len();

        log::trace!(target: "popol",
            "Polling {} resources with timeout {timeout:?} (pending event queue is {len})",
            self.poll.len(),
        );

        self.fired.clear();
        // Blocking call
        let res = match timeout {
            Some(timeout) => self.poll.poll(&mut self.fired, timeout),
            None => self.poll.poll(&mut self.fired, popol::Timeout::Never),
        };
        match res {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                log::trace!(target: "popol", "Poll timed out with zero events generated");
                return Ok(0);
            }
            Err(err) => return Err(err),
        }

        for event in self.fired.drain(..) {
            let res = if event.is_hangup() {
                Err(IoFail::Connectivity(event.raw_events()))
            } else if event.is_error() || event.is_invalid() {
                Err(IoFail::Os(event.raw_events()))
            } else {
                Ok(IoType {
                    read: event.is_readable(),
                    write: event.is_writable(),
                })
            };
            log::trace!(target: "popol", "Got `{res:?}` for {}", event.key);
            self.events.push_back((event.key, res))
        }

        log::trace!(target: "popol", "Poll resulted in {} new event(s)", self.events.len() - len);

        Ok(self.events.len() - len)
    }
}

impl Iterator for Poller {
    type Item = (RawFd, Result<IoType, IoFail>);

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.events.pop_front();
        match &item {
            Some((fd, Ok(io))) => {
                log::trace!(target: "popol", "Popped event `{io}` for {fd} from the queue")
            }
            Some((fd, Err(err))) => {
                log::trace!(target: "popol", "Popped error `{err}` for {fd} from the queue")
            }
            None => log::trace!(target: "popol", "Popol queue emptied"),
        }
        item
    }
}

impl From<IoType> for popol::Interest {
    fn from(ev: IoType) -> Self {
        let mut e = popol::interest::NONE;
        if ev.read {
            e |= popol::interest::READ;
        }
        if ev.write {
            e |= popol::interest::WRITE;
        }
        e
    }
}

/// Waker made of a non-blocking unix socket pair. The reading end is registered with the poller;
/// every clone of the writing end may be used from any thread.
#[derive(Clone)]
pub struct PopolWaker(Arc<UnixStream>);

impl Waker for PopolWaker {
    type Send = Self;
    type Recv = Self;

    fn pair() -> io::Result<(Self::Send, Self::Recv)> {
        let (writer, reader) = UnixStream::pair()?;
        writer.set_nonblocking(true)?;
        reader.set_nonblocking(true)?;
        Ok((PopolWaker(Arc::new(writer)), PopolWaker(Arc::new(reader))))
    }
}

impl AsRawFd for PopolWaker {
    fn as_raw_fd(&self) -> RawFd { self.0.as_raw_fd() }
}

impl WakerSend for PopolWaker {
    fn wake(&self) -> io::Result<()> {
        match (&*self.0).write(&[0x1]) {
            Ok(_) => Ok(()),
            // The socket buffer is full of unconsumed signals: the reactor is awake anyway.
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl WakerRecv for PopolWaker {
    fn reset(&self) {
        let mut buf = [0u8; 64];
        loop {
            match (&*self.0).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    log::error!(target: "popol", "Unable to reset waker: {err}");
                    break;
                }
            }
        }
    }
}
