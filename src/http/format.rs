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

use std::io::Write;

use super::Response;

/// Serializes the response into the exact bytes sent over the wire.
///
/// Status line always carries `HTTP/1.1`. Header names are written as given, every value of a
/// multi-valued header on its own line. A `Content-Length` matching the body is appended unless
/// the response already has one under any capitalization.
pub fn format_response(response: &Response) -> Vec<u8> {
    let mut out = Vec::with_capacity(128 + response.body().len());

    // Writes into a vector can't fail.
    let _ = write!(out, "HTTP/1.1 {} {}\r\n", response.status(), response.reason());
    for (name, values) in response.headers() {
        for value in values {
            let _ = write!(out, "{name}: {value}\r\n");
        }
    }
    if !response.headers().contains_ignore_case("Content-Length") {
        let _ = write!(out, "Content-Length: {}\r\n", response.body().len());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(response.body());
    out
}
