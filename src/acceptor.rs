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

//! Listening socket and the acceptor reactor service distributing accepted connections over
//! worker reactors.

use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};

use crate::config::ServerConfig;
use crate::poller::IoType;
use crate::registry::Registry;
use crate::resource::{Io, Resource, ResourceType, WriteAtomic};
use crate::runtime::{Action, Error, Handler};
use crate::timeouts::{Activity, Timestamp};
use crate::worker::{Command, Handoff, WorkerController};

/// Non-blocking listening socket.
#[derive(Debug)]
pub struct Listener {
    socket: TcpListener,
    addr: SocketAddr,
}

impl Listener {
    /// Binds the listening socket according to the configuration.
    pub fn bind(config: &ServerConfig) -> io::Result<Self> {
        let socket =
            Socket::new(Domain::for_address(config.addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(config.reuse_address)?;
        socket.bind(&config.addr.into())?;
        socket.listen(config.backlog)?;
        socket.set_nonblocking(true)?;

        let socket = TcpListener::from(socket);
        let addr = socket.local_addr()?;
        Ok(Listener { socket, addr })
    }

    /// Actual bound address, with the port resolved if `0` was requested.
    pub fn local_addr(&self) -> SocketAddr { self.addr }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd { self.socket.as_raw_fd() }
}

impl WriteAtomic for Listener {
    fn is_ready_to_write(&self) -> bool { false }

    fn empty_write_buf(&mut self) -> io::Result<bool> { Ok(true) }

    fn write_or_buf(&mut self, _buf: Vec<u8>) -> io::Result<()> {
        Err(io::ErrorKind::Unsupported.into())
    }
}

impl Resource for Listener {
    type Event = Vec<(TcpStream, SocketAddr)>;

    fn kind(&self) -> ResourceType { ResourceType::Listener }

    fn interests(&self) -> IoType { IoType::read_only() }

    /// Accepts all the pending connections.
    fn handle_io(&mut self, io: Io) -> Option<Self::Event> {
        if io != Io::Read {
            return None;
        }
        let mut accepted = vec![];
        loop {
            match self.socket.accept() {
                Ok(conn) => accepted.push(conn),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                // The peer gave up while waiting in the backlog.
                Err(err) if err.kind() == io::ErrorKind::ConnectionAborted => continue,
                Err(err) => {
                    // Likely out of file descriptors; the pending connections stay in the
                    // backlog until the next readiness.
                    log::error!(target: "acceptor", "Unable to accept connection: {err}");
                    break;
                }
            }
        }
        if accepted.is_empty() {
            None
        } else {
            Some(accepted)
        }
    }

    fn disconnect(self) -> io::Result<()> { Ok(()) }
}

/// Acceptor reactor service.
///
/// Prepares accepted sockets, records them in the [`Registry`] and passes them to the workers in
/// round-robin order. A worker whose reactor has exited is skipped from then on.
pub struct Acceptor {
    config: ServerConfig,
    registry: Arc<Registry>,
    workers: Vec<Option<WorkerController>>,
    /// Round-robin position. Only the acceptor thread advances it, so it needs no atomics.
    next: usize,
    actions: VecDeque<Action<Listener>>,
}

impl Acceptor {
    pub fn new(
        listener: Listener,
        workers: Vec<WorkerController>,
        registry: Arc<Registry>,
        config: ServerConfig,
    ) -> Self {
        Acceptor {
            config,
            registry,
            workers: workers.into_iter().map(Some).collect(),
            next: 0,
            actions: VecDeque::from([Action::Register(listener)]),
        }
    }

    fn prepare(&self, stream: TcpStream) -> io::Result<TcpStream> {
        let socket = Socket::from(stream);
        socket.set_nonblocking(true)?;
        if let Some(idle) = self.config.tcp_keepalive {
            socket.set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))?;
        }
        if self.config.linger.is_some() {
            socket.set_linger(self.config.linger)?;
        }
        socket.set_nodelay(self.config.nodelay)?;
        Ok(socket.into())
    }

    fn hand_off(&mut self, mut handoff: Handoff) {
        let count = self.workers.len();
        for _ in 0..count {
            let index = self.next % count;
            self.next = self.next.wrapping_add(1);

            let Some(worker) = &self.workers[index] else {
                continue;
            };
            match worker.cmd(Command::Register(handoff)) {
                Ok(()) => {
                    log::trace!(target: "acceptor", "Connection is handed over to worker {index}");
                    return;
                }
                Err(Command::Register(returned)) => {
                    handoff = returned;
                    self.workers[index] = None;
                    let left = self.workers.iter().flatten().count();
                    log::warn!(target: "acceptor", "Worker {index} is gone; {left} of {count} worker(s) remain");
                }
            }
        }

        log::error!(target: "acceptor", "No workers left to serve connection from {}", handoff.peer);
        self.registry.remove(handoff.id);
    }
}

impl Iterator for Acceptor {
    type Item = Action<Listener>;

    fn next(&mut self) -> Option<Self::Item> { self.actions.pop_front() }
}

impl Handler for Acceptor {
    type Resource = Listener;
    type Command = ();

    fn handle_event(&mut self, _fd: RawFd, accepted: Vec<(TcpStream, SocketAddr)>, time: Timestamp) {
        log::trace!(target: "acceptor", "Accepted {} connection(s)", accepted.len());

        for (stream, peer) in accepted {
            let stream = match self.prepare(stream) {
                Ok(stream) => stream,
                Err(err) => {
                    log::warn!(target: "acceptor", "Dropping connection from {peer}: {err}");
                    continue;
                }
            };
            let activity = Activity::new(time);
            let id = match self.registry.insert(&stream, peer, activity.clone()) {
                Ok(id) => id,
                Err(err) => {
                    log::warn!(target: "acceptor", "Dropping connection from {peer}: {err}");
                    continue;
                }
            };
            log::debug!(target: "acceptor", "Accepted connection {id} from {peer}");
            self.hand_off(Handoff {
                id,
                stream,
                peer,
                activity,
            });
        }
    }

    fn handle_registered(&mut self, fd: RawFd, ty: ResourceType) {
        log::info!(target: "acceptor", "Listening with {ty} {fd}");
    }

    fn handle_command(&mut self, _cmd: ()) {}

    fn handle_error(&mut self, err: Error<Listener>) {
        match err {
            Error::Disconnected(fd, listener) => {
                log::error!(target: "acceptor", "Listener {fd} on {} has failed; no more connections will be accepted", listener.local_addr());
                self.actions.push_back(Action::Terminate);
            }
            Error::WriteFailure(fd, ..) => {
                log::error!(target: "acceptor", "Attempt to write into listener {fd}");
            }
            Error::Poll(err) => {
                log::error!(target: "acceptor", "Acceptor has failed: {err}");
            }
        }
    }

    fn handover(&mut self, fd: RawFd, _listener: Listener) {
        log::debug!(target: "acceptor", "Listener {fd} is closed");
    }
}
