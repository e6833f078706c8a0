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

use std::net::{Ipv4Addr, SocketAddr};
use std::num::NonZeroUsize;
use std::thread;
use std::time::Duration;

use crate::connection::READ_BUFFER_SIZE;
use crate::http::Limits;
use crate::reaper::MIN_REAP_INTERVAL;

/// Server configuration.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct ServerConfig {
    /// Address to listen on. Port `0` picks any free port; see [`crate::Server::start`].
    pub addr: SocketAddr,
    /// Number of worker reactors serving connections.
    pub workers: usize,
    /// Connections silent for longer than this are closed. `None` disables the reaper.
    pub idle_timeout: Option<Duration>,
    /// How often the reaper looks for idle connections.
    pub reap_interval: Duration,
    /// `SO_LINGER` applied to accepted connections.
    pub linger: Option<Duration>,
    /// Idle time before TCP keep-alive probing starts; `None` disables `SO_KEEPALIVE`.
    pub tcp_keepalive: Option<Duration>,
    /// `TCP_NODELAY` on accepted connections.
    pub nodelay: bool,
    /// `SO_REUSEADDR` on the listening socket.
    pub reuse_address: bool,
    pub backlog: i32,
    /// Size of the per-connection read buffer.
    pub read_buffer: usize,
    pub limits: Limits,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080)),
            workers: default_workers(),
            idle_timeout: Some(Duration::from_secs(60)),
            reap_interval: Duration::from_secs(5),
            linger: None,
            tcp_keepalive: Some(Duration::from_secs(60)),
            nodelay: true,
            reuse_address: true,
            backlog: 1024,
            read_buffer: READ_BUFFER_SIZE,
            limits: Limits::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(addr: impl Into<SocketAddr>) -> Self {
        ServerConfig {
            addr: addr.into(),
            ..Self::default()
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Sets the period of idle connection scans, never shorter than [`MIN_REAP_INTERVAL`].
    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval.max(MIN_REAP_INTERVAL);
        self
    }

    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    pub fn with_tcp_keepalive(mut self, idle: Option<Duration>) -> Self {
        self.tcp_keepalive = idle;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_read_buffer(mut self, size: usize) -> Self {
        self.read_buffer = size;
        self
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }
}

/// One worker per hardware thread except the one left for the acceptor; at least one.
pub fn default_workers() -> usize {
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
        .saturating_sub(1)
        .max(1)
}
