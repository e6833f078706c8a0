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

//! Incremental HTTP/1.x request parser.
//!
//! The parser is a state machine fed with arbitrary fragments of the byte stream: a request line,
//! header name, line terminator or body may be split between any two [`RequestParser::feed`]
//! calls. Bytes which are part of the request are copied into the parser own storage, so the
//! caller may reuse its buffer right after the call returns.

use std::{mem, str};

use super::{Headers, Request};

/// Number of empty lines tolerated in front of a request line.
pub const MAX_LEADING_EMPTY_LINES: usize = 8;

/// Size constraints applied while parsing.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct Limits {
    /// Maximum length of the request line or a single header line, terminator excluded.
    pub max_line_len: usize,
    /// Maximum number of header lines.
    pub max_headers: usize,
    /// Maximum body length accepted via `Content-Length`.
    pub max_body_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_line_len: 8 * 1024,
            max_headers: 100,
            max_body_len: 8 * 1024 * 1024,
        }
    }
}

/// Request which can't be parsed. The byte stream can't be resynchronized after any of these.
#[derive(Clone, Eq, PartialEq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum ParseError {
    /// malformed request line `{0}`
    RequestLine(String),

    /// unsupported protocol version `{0}`
    Version(String),

    /// malformed header line `{0}`
    Header(String),

    /// invalid Content-Length value `{0}`
    ContentLength(String),

    /// unsupported transfer encoding `{0}`
    TransferEncoding(String),

    /// request line or header is not a valid UTF-8 string
    Encoding,

    /// request line or header exceeds {0} bytes
    LineTooLong(usize),

    /// request has more than {0} header lines
    TooManyHeaders(usize),

    /// request body of {0} bytes exceeds the limit
    BodyTooLarge(u64),

    /// more than {0} empty lines precede the request line
    EmptyLines(usize),
}

impl ParseError {
    /// Whether the request is well-formed but uses a protocol feature the server doesn't support.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, ParseError::Version(_) | ParseError::TransferEncoding(_))
    }
}

/// Outcome of a [`RequestParser::feed`] call.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Status {
    /// All the provided bytes were consumed and more are needed.
    Incomplete,
    /// Request is complete; the value is the number of bytes consumed from the provided buffer.
    /// The rest of the buffer belongs to whatever follows the request on the stream.
    Complete(usize),
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum Stage {
    RequestLine,
    Headers,
    Body { remaining: usize },
    Complete,
    Failed,
}

#[derive(Debug)]
pub struct RequestParser {
    limits: Limits,
    stage: Stage,
    /// Bytes of a line whose terminator hasn't arrived yet.
    line: Vec<u8>,
    method: String,
    target: String,
    version: String,
    headers: Headers,
    header_count: usize,
    empty_lines: usize,
    body: Vec<u8>,
    request: Option<Request>,
    error: Option<ParseError>,
}

impl Default for RequestParser {
    fn default() -> Self { RequestParser::new(Limits::default()) }
}

impl RequestParser {
    pub fn new(limits: Limits) -> Self {
        RequestParser {
            limits,
            stage: Stage::RequestLine,
            line: empty!(),
            method: empty!(),
            target: empty!(),
            version: empty!(),
            headers: none!(),
            header_count: 0,
            empty_lines: 0,
            body: empty!(),
            request: None,
            error: None,
        }
    }

    pub fn limits(&self) -> Limits { self.limits }

    /// Whether no byte of a request has been consumed since the creation or the last reset.
    pub fn is_idle(&self) -> bool { self.stage == Stage::RequestLine && self.line.is_empty() }

    pub fn is_complete(&self) -> bool { self.stage == Stage::Complete }

    /// Consumes the next fragment of the stream.
    ///
    /// Once the request is complete the parser consumes nothing more until it is [`reset`]; once
    /// it has failed, every subsequent call returns the same error.
    ///
    /// [`reset`]: RequestParser::reset
    pub fn feed(&mut self, buf: &[u8]) -> Result<Status, ParseError> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        match self.advance(buf) {
            Ok(status) => Ok(status),
            Err(err) => {
                self.stage = Stage::Failed;
                self.error = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Takes the parsed request out. Returns `None` unless [`Status::Complete`] was reported and
    /// the request wasn't taken yet.
    pub fn take_request(&mut self) -> Option<Request> { self.request.take() }

    /// Returns the parser into its initial state, keeping allocated buffers for reuse.
    pub fn reset(&mut self) {
        self.stage = Stage::RequestLine;
        self.line.clear();
        self.method.clear();
        self.target.clear();
        self.version.clear();
        self.headers = none!();
        self.header_count = 0;
        self.empty_lines = 0;
        self.body = empty!();
        self.request = None;
        self.error = None;
    }

    fn advance(&mut self, buf: &[u8]) -> Result<Status, ParseError> {
        let mut pos = 0usize;
        loop {
            match self.stage {
                Stage::Complete => return Ok(Status::Complete(pos)),
                Stage::Failed => unreachable!("failed parser is never advanced"),
                _ if pos == buf.len() => return Ok(Status::Incomplete),
                Stage::RequestLine | Stage::Headers => {
                    let rest = &buf[pos..];
                    match rest.iter().position(|b| *b == b'\n') {
                        Some(end) => {
                            self.append_line(&rest[..end])?;
                            pos += end + 1;
                            let mut line = mem::take(&mut self.line);
                            if line.last() == Some(&b'\r') {
                                line.pop();
                            }
                            self.process_line(&line)?;
                            // Give the allocation back to be reused by the next line.
                            line.clear();
                            self.line = line;
                        }
                        None => {
                            self.append_line(rest)?;
                            pos = buf.len();
                        }
                    }
                }
                Stage::Body { remaining } => {
                    let len = remaining.min(buf.len() - pos);
                    self.body.extend_from_slice(&buf[pos..pos + len]);
                    pos += len;
                    if remaining == len {
                        self.complete();
                    } else {
                        self.stage = Stage::Body {
                            remaining: remaining - len,
                        };
                    }
                }
            }
        }
    }

    fn append_line(&mut self, chunk: &[u8]) -> Result<(), ParseError> {
        // One extra byte is allowed for the CR of the terminator.
        if self.line.len() + chunk.len() > self.limits.max_line_len + 1 {
            return Err(ParseError::LineTooLong(self.limits.max_line_len));
        }
        self.line.extend_from_slice(chunk);
        if self.line.len() > self.limits.max_line_len && self.line.last() != Some(&b'\r') {
            return Err(ParseError::LineTooLong(self.limits.max_line_len));
        }
        Ok(())
    }

    fn process_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let line = str::from_utf8(line).map_err(|_| ParseError::Encoding)?;
        match self.stage {
            Stage::RequestLine if line.is_empty() => {
                self.empty_lines += 1;
                if self.empty_lines > MAX_LEADING_EMPTY_LINES {
                    return Err(ParseError::EmptyLines(MAX_LEADING_EMPTY_LINES));
                }
                Ok(())
            }
            Stage::RequestLine => self.request_line(line),
            Stage::Headers if line.is_empty() => self.end_of_headers(),
            Stage::Headers => self.header_line(line),
            _ => unreachable!("lines are processed only while parsing the request head"),
        }
    }

    fn request_line(&mut self, line: &str) -> Result<(), ParseError> {
        let mut parts = line.split(' ');
        let (Some(method), Some(target), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ParseError::RequestLine(line.to_owned()));
        };
        if !is_token(method) || target.is_empty() || target.chars().any(char::is_control) {
            return Err(ParseError::RequestLine(line.to_owned()));
        }
        match version {
            "HTTP/1.1" | "HTTP/1.0" => {}
            v if v.starts_with("HTTP/") => return Err(ParseError::Version(v.to_owned())),
            _ => return Err(ParseError::RequestLine(line.to_owned())),
        }

        self.method.push_str(method);
        self.target.push_str(target);
        self.version.push_str(version);
        self.stage = Stage::Headers;
        Ok(())
    }

    fn header_line(&mut self, line: &str) -> Result<(), ParseError> {
        // Obsolete line folding
        if line.starts_with([' ', '\t']) {
            return Err(ParseError::Header(line.to_owned()));
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(ParseError::Header(line.to_owned()));
        };
        if !is_token(name) {
            return Err(ParseError::Header(line.to_owned()));
        }
        self.header_count += 1;
        if self.header_count > self.limits.max_headers {
            return Err(ParseError::TooManyHeaders(self.limits.max_headers));
        }
        self.headers.add(name, value.trim_matches([' ', '\t']));
        Ok(())
    }

    fn end_of_headers(&mut self) -> Result<(), ParseError> {
        if self.headers.contains_ignore_case("Transfer-Encoding") {
            let encoding = self.headers.values_ignore_case("Transfer-Encoding").collect::<Vec<_>>();
            return Err(ParseError::TransferEncoding(encoding.join(", ")));
        }

        let mut content_length = None;
        for value in self.headers.values_ignore_case("Content-Length") {
            let len = parse_content_length(value)?;
            match content_length {
                Some(prev) if prev != len => return Err(ParseError::ContentLength(value.to_owned())),
                _ => content_length = Some(len),
            }
        }

        match content_length.unwrap_or(0) {
            0 => self.complete(),
            len if len > self.limits.max_body_len as u64 => {
                return Err(ParseError::BodyTooLarge(len));
            }
            len => {
                let len = len as usize;
                self.body.reserve_exact(len);
                self.stage = Stage::Body { remaining: len };
            }
        }
        Ok(())
    }

    fn complete(&mut self) {
        self.request = Some(Request::new(
            mem::take(&mut self.method),
            mem::take(&mut self.target),
            mem::take(&mut self.version),
            mem::take(&mut self.headers),
            mem::take(&mut self.body),
        ));
        self.stage = Stage::Complete;
    }
}

fn parse_content_length(value: &str) -> Result<u64, ParseError> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::ContentLength(value.to_owned()));
    }
    value.parse().map_err(|_| ParseError::ContentLength(value.to_owned()))
}

/// RFC 9110 `token`.
fn is_token(s: &str) -> bool {
    !s.is_empty() &&
        s.bytes().all(|b| {
            b.is_ascii_alphanumeric() ||
                matches!(
                    b,
                    b'!' | b'#' |
                        b'$' |
                        b'%' |
                        b'&' |
                        b'\'' |
                        b'*' |
                        b'+' |
                        b'-' |
                        b'.' |
                        b'^' |
                        b'_' |
                        b'`' |
                        b'|' |
                        b'~'
                )
        })
}
