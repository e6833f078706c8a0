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

use std::error::Error as StdError;

use super::Headers;

/// HTTP response produced by the application.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Response {
    status: u16,
    reason: String,
    headers: Headers,
    body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Response {
            status,
            reason: reason.into(),
            headers: none!(),
            body: empty!(),
        }
    }

    /// Response with the standard reason phrase for the status.
    pub fn with_status(status: u16) -> Self { Response::new(status, reason_phrase(status)) }

    /// `text/plain` response with an explicit `Content-Length`.
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        Response::with_status(status)
            .with_header("Content-Type", "text/plain")
            .with_header("Content-Length", body.len().to_string())
            .with_body(body)
    }

    /// Response reporting an application failure. The body lists the error together with the
    /// chain of its sources.
    pub fn internal_error(err: &(dyn StdError + 'static)) -> Self {
        let mut diagnostic = format!("Internal Server Error\n\n{err}\n");
        let mut source = err.source();
        while let Some(cause) = source {
            diagnostic.push_str(&format!("caused by: {cause}\n"));
            source = cause.source();
        }
        Response::text(500, diagnostic)
    }

    /// Appends a header value.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.add(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn status(&self) -> u16 { self.status }

    pub fn reason(&self) -> &str { &self.reason }

    pub fn headers(&self) -> &Headers { &self.headers }

    pub fn headers_mut(&mut self) -> &mut Headers { &mut self.headers }

    pub fn body(&self) -> &[u8] { &self.body }
}

/// Standard reason phrase for a status code; empty for unknown codes.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        411 => "Length Required",
        413 => "Content Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "",
    }
}
