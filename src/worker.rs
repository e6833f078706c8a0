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

//! Worker reactor service: serves the connections handed over by the acceptor.

use std::collections::VecDeque;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::config::ServerConfig;
use crate::connection::{ConnEvent, Connection};
use crate::dispatch::Dispatcher;
use crate::http::{format_response, Limits};
use crate::poller::popol::PopolWaker;
use crate::registry::{ConnId, Registry};
use crate::resource::{Resource, ResourceType};
use crate::runtime::{Action, Controller, Error, Handler};
use crate::timeouts::{Activity, Timestamp};

/// Control handle of a worker reactor.
pub type WorkerController = Controller<Command, PopolWaker>;

/// Accepted connection on its way from the acceptor to a worker.
#[derive(Debug)]
pub struct Handoff {
    pub id: ConnId,
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub activity: Activity,
}

#[derive(Debug)]
pub enum Command {
    /// Start serving a connection: register it for read readiness.
    Register(Handoff),
}

pub struct Worker {
    index: usize,
    dispatcher: Dispatcher,
    registry: Arc<Registry>,
    limits: Limits,
    read_buffer: usize,
    actions: VecDeque<Action<Connection>>,
}

impl Worker {
    pub fn new(
        index: usize,
        dispatcher: Dispatcher,
        registry: Arc<Registry>,
        config: &ServerConfig,
    ) -> Self {
        Worker {
            index,
            dispatcher,
            registry,
            limits: config.limits,
            read_buffer: config.read_buffer,
            actions: empty!(),
        }
    }

    fn close(&mut self, conn: Connection) {
        let id = conn.id();
        let peer = conn.peer();
        // Already gone if the reaper has evicted it.
        self.registry.remove(id);
        match conn.disconnect() {
            Ok(()) => log::debug!(target: "http", "Connection {id} from {peer} is closed"),
            Err(err) => log::debug!(target: "http", "Connection {id} from {peer} is closed with error: {err}"),
        }
    }
}

impl Iterator for Worker {
    type Item = Action<Connection>;

    fn next(&mut self) -> Option<Self::Item> { self.actions.pop_front() }
}

impl Handler for Worker {
    type Resource = Connection;
    type Command = Command;

    fn handle_event(&mut self, fd: RawFd, event: ConnEvent, _time: Timestamp) {
        match event {
            ConnEvent::Request(request) => {
                let response = self.dispatcher.dispatch(request);
                log::trace!(target: "http", "Responding {} {} on {fd}", response.status(), response.reason());
                self.actions.push_back(Action::Send(fd, format_response(&response)));
                return;
            }
            ConnEvent::Done | ConnEvent::PeerClosed => {}
            ConnEvent::Malformed(err) => {
                log::warn!(target: "http", "Dropping connection {fd} due to malformed request: {err}");
            }
            ConnEvent::Failed(err) => {
                log::warn!(target: "http", "Dropping connection {fd} due to I/O error: {err}");
            }
        }
        self.actions.push_back(Action::Unregister(fd));
    }

    fn handle_registered(&mut self, fd: RawFd, ty: ResourceType) {
        log::debug!(target: "http", "Worker {} is serving {ty} {fd}", self.index);
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Register(Handoff {
                id,
                stream,
                peer,
                activity,
            }) => {
                let conn =
                    Connection::new(id, stream, peer, activity, self.limits, self.read_buffer);
                self.actions.push_back(Action::Register(conn));
            }
        }
    }

    fn handle_error(&mut self, err: Error<Connection>) {
        match err {
            Error::Disconnected(fd, conn) => {
                log::debug!(target: "http", "Connection {fd} from {} got disconnected", conn.peer());
                self.close(conn);
            }
            Error::WriteFailure(fd, conn, err) => {
                log::warn!(target: "http", "Unable to send response to connection {fd}: {err}");
                self.close(conn);
            }
            Error::Poll(err) => {
                log::error!(target: "http", "Worker {} has failed and stops serving its connections: {err}", self.index);
            }
        }
    }

    fn handover(&mut self, _fd: RawFd, conn: Connection) { self.close(conn) }
}
