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

#![deny(
    non_upper_case_globals,
    non_camel_case_types,
    non_snake_case,
    unused_mut,
    unused_imports,
    dead_code,
    //missing_docs
)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Minimal HTTP/1.1 server built from poll reactors.
//!
//! A single acceptor [`Reactor`] owns the listening socket and hands every accepted connection
//! over to one of a fixed pool of worker reactors, picked round-robin. Each worker owns its
//! connections exclusively: it reads and incrementally parses requests, invokes the application
//! [`HttpHandler`] and writes the responses back, all in non-blocking mode and within a single
//! thread. Other threads talk to a reactor only through its [`Controller`], which queues a
//! command and wakes the reactor poll up.
//!
//! Idle connections are closed by a separate [`Reaper`] thread which scans the shared
//! connection [`Registry`].
//!
//! ```no_run
//! use httpd::{HandlerError, Request, Response, Server, ServerConfig};
//!
//! fn hello(req: Request) -> Result<Response, HandlerError> {
//!     Ok(Response::text(200, format!("hello from {}\n", req.target())))
//! }
//!
//! let mut server = Server::new(ServerConfig::new(([127, 0, 0, 1], 8080)), hello);
//! let addr = server.start()?;
//! println!("listening on {addr}");
//! # server.stop();
//! # Ok::<_, httpd::server::Error>(())
//! ```

#[macro_use]
extern crate amplify;

pub mod acceptor;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod http;
pub mod nonblock;
pub mod poller;
mod reactor;
pub mod reaper;
pub mod registry;
mod resource;
pub mod runtime;
pub mod server;
mod timeouts;
pub mod worker;

pub use config::ServerConfig;
pub use dispatch::{Dispatcher, HandlerError, HttpHandler};
pub use http::{format_response, Headers, Limits, ParseError, Request, RequestParser, Response};
pub use reactor::Reactor;
pub use reaper::Reaper;
pub use registry::{ConnId, Registry};
pub use resource::{Io, Resource, ResourceType, WriteAtomic, WriteError};
pub use runtime::{Action, Controller, Handler, Runtime};
pub use server::Server;
pub use timeouts::{Activity, Timestamp};
