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

//! Server lifecycle: binding, spawning the reactors and the reaper, and stopping them.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::acceptor::{Acceptor, Listener};
use crate::config::ServerConfig;
use crate::dispatch::{Dispatcher, HttpHandler};
use crate::poller::popol::Poller;
use crate::poller::Poll;
use crate::reaper::Reaper;
use crate::registry::Registry;
use crate::runtime::Handler;
use crate::worker::Worker;
use crate::Reactor;

/// Server lifecycle errors.
#[derive(Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum Error {
    /// server is already running.
    AlreadyRunning,

    /// unable to listen on {0}: {1}
    Bind(SocketAddr, io::Error),

    /// unable to start server thread: {0}
    #[from]
    Io(io::Error),
}

struct Running {
    addr: SocketAddr,
    registry: Arc<Registry>,
    threads: Threads,
}

/// Server threads spawned so far.
#[derive(Default)]
struct Threads {
    acceptor: Option<Reactor<Acceptor, Poller>>,
    workers: Vec<Reactor<Worker, Poller>>,
    reaper: Option<Reaper>,
}

impl Threads {
    /// Stops the acceptor first, so no connection is handed over to a stopped worker.
    fn stop(self) {
        if let Some(acceptor) = self.acceptor {
            stop_reactor(acceptor, "acceptor");
        }
        for worker in self.workers {
            stop_reactor(worker, "worker");
        }
        if let Some(reaper) = self.reaper {
            reaper.shutdown();
        }
    }
}

/// HTTP server: one acceptor reactor, a fixed pool of worker reactors and an optional idle
/// connection reaper.
pub struct Server {
    config: ServerConfig,
    dispatcher: Dispatcher,
    running: Option<Running>,
}

impl Server {
    pub fn new(config: ServerConfig, handler: impl HttpHandler) -> Self {
        Server {
            config,
            dispatcher: Dispatcher::new(handler),
            running: None,
        }
    }

    pub fn config(&self) -> &ServerConfig { &self.config }

    /// Binds the listening socket and spawns all the server threads. If any thread can't be
    /// spawned, the ones already running are stopped and the socket is released.
    ///
    /// Returns the address the server listens on.
    pub fn start(&mut self) -> Result<SocketAddr, Error> {
        if self.running.is_some() {
            return Err(Error::AlreadyRunning);
        }

        let listener = Listener::bind(&self.config).map_err(|err| Error::Bind(self.config.addr, err))?;
        let addr = listener.local_addr();
        let registry = Arc::new(Registry::new());

        let mut threads = Threads::default();
        if let Err(err) = self.spawn(listener, &registry, &mut threads) {
            log::error!(target: "server", "Unable to start server on {addr}: {err}");
            threads.stop();
            registry.clear();
            return Err(err.into());
        }

        log::info!(target: "server", "Listening on {addr} with {} worker(s)", threads.workers.len());
        self.running = Some(Running {
            addr,
            registry,
            threads,
        });
        Ok(addr)
    }

    fn spawn(
        &self,
        listener: Listener,
        registry: &Arc<Registry>,
        threads: &mut Threads,
    ) -> io::Result<()> {
        let count = self.config.workers.max(1);
        for index in 0..count {
            let worker = Worker::new(index, self.dispatcher.clone(), registry.clone(), &self.config);
            threads
                .workers
                .push(Reactor::named(worker, Poller::new(), format!("http-worker-{index}"))?);
        }

        let controllers = threads.workers.iter().map(Reactor::controller).collect();
        let acceptor = Acceptor::new(listener, controllers, registry.clone(), self.config.clone());
        threads.acceptor = Some(Reactor::named(acceptor, Poller::new(), s!("http-acceptor"))?);

        if let Some(threshold) = self.config.idle_timeout {
            threads.reaper =
                Some(Reaper::spawn(registry.clone(), threshold, self.config.reap_interval)?);
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool { self.running.is_some() }

    /// Address of a running server.
    pub fn local_addr(&self) -> Option<SocketAddr> { self.running.as_ref().map(|r| r.addr) }

    /// Number of open client connections.
    pub fn connections(&self) -> usize {
        self.running.as_ref().map(|r| r.registry.len()).unwrap_or_default()
    }

    /// Number of worker reactors still serving connections.
    pub fn live_workers(&self) -> usize {
        self.running
            .as_ref()
            .map(|r| r.threads.workers.iter().filter(|w| !w.is_finished()).count())
            .unwrap_or_default()
    }

    /// Stops the server. Connections are closed abruptly, responses in flight are abandoned.
    /// Does nothing if the server is not running.
    pub fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        log::info!(target: "server", "Stopping server on {}", running.addr);

        running.threads.stop();
        let closed = running.registry.clear();
        log::info!(target: "server", "Server has stopped; {closed} connection(s) left behind were closed");
    }
}

fn stop_reactor<H: Handler + 'static, P: Poll + 'static>(reactor: Reactor<H, P>, role: &str) {
    // Fails only if the reactor has already exited.
    if reactor.controller().shutdown().is_err() {
        log::debug!(target: "server", "The {role} reactor has already exited");
    }
    if reactor.join().is_err() {
        log::error!(target: "server", "The {role} reactor thread has panicked");
    }
}

impl Drop for Server {
    fn drop(&mut self) { self.stop() }
}
