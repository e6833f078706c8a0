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

//! Application handler contract and the dispatcher which turns handler failures into responses.

use std::any::Any;
use std::error::Error as StdError;
use std::fmt::{self, Debug, Formatter};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::http::{Request, Response};

/// Error returned by an application handler.
pub type HandlerError = Box<dyn StdError + Send + Sync>;

/// Application logic producing a response for each request.
///
/// A single handler instance is shared by all the worker threads, so it is invoked concurrently
/// and must be thread-safe. It runs on the reactor thread: a slow handler delays every connection
/// served by the same worker.
pub trait HttpHandler: Send + Sync + 'static {
    fn handle(&self, request: Request) -> Result<Response, HandlerError>;
}

impl<F> HttpHandler for F
where F: Fn(Request) -> Result<Response, HandlerError> + Send + Sync + 'static
{
    fn handle(&self, request: Request) -> Result<Response, HandlerError> { self(request) }
}

/// Panic raised inside a handler.
#[derive(Clone, Eq, PartialEq, Debug, Display, Error)]
#[display("request handler has panicked: {0}")]
pub struct HandlerPanic(String);

impl HandlerPanic {
    fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let msg = match payload.downcast::<String>() {
            Ok(msg) => *msg,
            Err(payload) => match payload.downcast_ref::<&'static str>() {
                Some(msg) => (*msg).to_owned(),
                None => s!("unknown panic payload"),
            },
        };
        HandlerPanic(msg)
    }
}

/// Invokes the application handler, never letting its failure escape into the reactor.
#[derive(Clone)]
pub struct Dispatcher {
    handler: Arc<dyn HttpHandler>,
}

impl Debug for Dispatcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result { f.write_str("Dispatcher(..)") }
}

impl Dispatcher {
    pub fn new(handler: impl HttpHandler) -> Self {
        Dispatcher {
            handler: Arc::new(handler),
        }
    }

    /// Produces the response for the request. Errors and panics of the handler are converted into
    /// a `500 Internal Server Error` response carrying the diagnostic.
    pub fn dispatch(&self, request: Request) -> Response {
        let method = request.method().to_owned();
        let target = request.target().to_owned();
        match panic::catch_unwind(AssertUnwindSafe(|| self.handler.handle(request))) {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                log::error!(target: "http", "Handler has failed on {method} {target}: {err}");
                Response::internal_error(&*err)
            }
            Err(payload) => {
                let err = HandlerPanic::from_payload(payload);
                log::error!(target: "http", "Handler has panicked on {method} {target}: {}", err.0);
                Response::internal_error(&err)
            }
        }
    }
}
