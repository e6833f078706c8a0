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

//! Readiness multiplexer abstraction used by the reactor runtime.

pub mod popol;

use std::fmt::{self, Display, Formatter};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use std::{io, mem, ops};

use crate::resource::Io;

/// Readiness of a resource, or the readiness a resource is interested in.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Default)]
pub struct IoType {
    pub read: bool,
    pub write: bool,
}

impl IoType {
    const fn with(read: bool, write: bool) -> Self { IoType { read, write } }

    pub const fn none() -> Self { IoType::with(false, false) }
    pub const fn read_only() -> Self { IoType::with(true, false) }
    pub const fn write_only() -> Self { IoType::with(false, true) }
    pub const fn read_write() -> Self { IoType::with(true, true) }

    pub fn is_none(self) -> bool { self == IoType::none() }
    pub fn is_read_only(self) -> bool { self == IoType::read_only() }
    pub fn is_write_only(self) -> bool { self == IoType::write_only() }
    pub fn is_read_write(self) -> bool { self == IoType::read_write() }
}

impl ops::Not for IoType {
    type Output = Self;

    fn not(self) -> Self::Output { IoType::with(!self.read, !self.write) }
}

/// Yields write before read: a connection flushes its response before it is allowed to parse
/// anything else.
impl Iterator for IoType {
    type Item = Io;

    fn next(&mut self) -> Option<Self::Item> {
        if mem::take(&mut self.write) {
            Some(Io::Write)
        } else if mem::take(&mut self.read) {
            Some(Io::Read)
        } else {
            None
        }
    }
}

impl Display for IoType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match (self.read, self.write) {
            (false, false) => "none",
            (true, false) => "read",
            (false, true) => "write",
            (true, true) => "read-write",
        })
    }
}

/// Poll reported a failure condition on a file descriptor instead of readiness.
#[derive(Copy, Clone, Debug, Display, Error)]
#[display(doc_comments)]
pub enum IoFail {
    /// connection is absent (POSIX events {0:#b})
    Connectivity(i16),
    /// OS-level error (POSIX events {0:#b})
    Os(i16),
}

/// Sending half of a waker: wakes up a poll blocked in another thread.
pub trait WakerSend: Send + Sync + Clone {
    fn wake(&self) -> io::Result<()>;
}

/// Receiving half of a waker, registered with the poller of the reactor thread.
pub trait WakerRecv: AsRawFd + Send {
    /// Consumes all pending wake-up signals.
    fn reset(&self);
}

pub trait Waker {
    type Send: WakerSend;
    type Recv: WakerRecv;

    fn pair() -> io::Result<(Self::Send, Self::Recv)>;
}

/// Readiness multiplexer owned by a single reactor thread.
///
/// Registration table is mutated only through `&mut self`, i.e. only by the thread which owns the
/// poller. Other threads reach the reactor through its control queue and [`Waker`].
pub trait Poll
where Self: Send + Iterator<Item = (RawFd, Result<IoType, IoFail>)>
{
    type Waker: Waker;

    fn register_waker(&mut self, fd: &impl AsRawFd);
    fn register(&mut self, fd: &impl AsRawFd, interest: IoType);
    fn unregister(&mut self, fd: &impl AsRawFd);
    fn set_interest(&mut self, fd: &impl AsRawFd, interest: IoType) -> bool;

    /// Blocks until at least one registered source is ready or the timeout expires.
    ///
    /// # Returns
    ///
    /// Number of new events available through the iterator interface.
    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize>;
}
