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

use super::Headers;

/// A single parsed HTTP request.
///
/// Request is immutable once produced by [`super::RequestParser`]: it owns copies of all the bytes
/// it was parsed from and can only be taken apart by value.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Request {
    method: String,
    target: String,
    version: String,
    headers: Headers,
    body: Vec<u8>,
}

impl Request {
    pub(crate) fn new(
        method: String,
        target: String,
        version: String,
        headers: Headers,
        body: Vec<u8>,
    ) -> Self {
        Request {
            method,
            target,
            version,
            headers,
            body,
        }
    }

    pub fn method(&self) -> &str { &self.method }

    /// Request target exactly as it was sent, without any URL decoding.
    pub fn target(&self) -> &str { &self.target }

    pub fn version(&self) -> &str { &self.version }

    pub fn headers(&self) -> &Headers { &self.headers }

    pub fn body(&self) -> &[u8] { &self.body }

    pub fn into_body(self) -> Vec<u8> { self.body }

    /// Whether the client asked to keep the connection open after the response, i.e. some value
    /// of the `Connection` header lists the `keep-alive` token.
    pub fn is_keep_alive(&self) -> bool {
        self.headers
            .values_ignore_case("Connection")
            .flat_map(|value| value.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("keep-alive"))
    }
}
