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

//! Client connection resource.
//!
//! A [`Connection`] owns the accepted socket together with the request parser, the buffers and
//! the progress of the in-flight response. It is polled by exactly one worker reactor and turns
//! readiness into [`ConnEvent`]s for the worker service.

use std::io;
use std::mem;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

use crate::http::{Limits, ParseError, Request, RequestParser, Status};
use crate::nonblock::{IoStatus, ReadNonblocking, WriteNonblocking};
use crate::poller::IoType;
use crate::registry::ConnId;
use crate::resource::{Io, Resource, ResourceType, WriteAtomic};
use crate::timeouts::Activity;

/// Default size of the per-connection read buffer.
pub const READ_BUFFER_SIZE: usize = 8192;

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
pub enum State {
    /// Waiting for the first byte of a request.
    #[display("idle")]
    Idle,
    /// Part of a request has been received.
    #[display("reading")]
    Reading,
    /// Complete request was handed to the application; no I/O until the response is provided.
    #[display("dispatching")]
    Dispatching,
    /// Response is being flushed into the socket.
    #[display("writing")]
    Writing,
    #[display("closed")]
    Closed,
}

/// Events generated by a [`Connection`]. All events but [`ConnEvent::Request`] mean the
/// connection must be closed.
#[derive(Debug)]
pub enum ConnEvent {
    /// Complete request which awaits a response.
    Request(Request),
    /// Response was fully written and the client didn't ask to keep the connection open.
    Done,
    /// Peer has closed its side of the connection.
    PeerClosed,
    /// Peer has sent bytes which can't be parsed as a request.
    Malformed(ParseError),
    /// I/O error on the socket.
    Failed(io::Error),
}

#[derive(Debug)]
pub struct Connection {
    id: ConnId,
    stream: TcpStream,
    peer: SocketAddr,
    state: State,
    parser: RequestParser,
    scratch: Box<[u8]>,
    /// Bytes received past the end of the request being served.
    pending: Vec<u8>,
    output: Vec<u8>,
    written: usize,
    keep_alive: bool,
    activity: Activity,
}

impl Connection {
    /// Wraps the accepted socket, which must be already in non-blocking mode.
    pub fn new(
        id: ConnId,
        stream: TcpStream,
        peer: SocketAddr,
        activity: Activity,
        limits: Limits,
        read_buffer: usize,
    ) -> Self {
        Connection {
            id,
            stream,
            peer,
            state: State::Idle,
            parser: RequestParser::new(limits),
            scratch: vec![0u8; read_buffer.max(1)].into_boxed_slice(),
            pending: empty!(),
            output: empty!(),
            written: 0,
            keep_alive: false,
            activity,
        }
    }

    pub fn id(&self) -> ConnId { self.id }

    pub fn peer(&self) -> SocketAddr { self.peer }

    pub fn state(&self) -> State { self.state }

    /// Keep-alive preference of the most recent request.
    pub fn is_keep_alive(&self) -> bool { self.keep_alive }

    fn read(&mut self) -> Option<ConnEvent> {
        loop {
            let len = match self.stream.read_nonblocking(&mut self.scratch) {
                IoStatus::Success(len) => len,
                IoStatus::WouldBlock => return None,
                IoStatus::Shutdown => {
                    if self.state == State::Reading {
                        log::debug!(target: "http", "Connection {} from {} closed in the middle of a request", self.id, self.peer);
                    }
                    return Some(self.close(ConnEvent::PeerClosed));
                }
                IoStatus::Err(err) => return Some(self.close(ConnEvent::Failed(err))),
            };
            self.activity.touch();
            log::trace!(target: "http", "Received {len} bytes from {}", self.peer);

            self.state = State::Reading;
            match parse(&mut self.parser, &mut self.pending, &self.scratch[..len]) {
                Ok(None) => continue,
                Ok(Some(request)) => return Some(self.dispatch(request)),
                Err(err) => return Some(self.close(ConnEvent::Malformed(err))),
            }
        }
    }

    fn write(&mut self) -> Option<ConnEvent> {
        match self.empty_write_buf() {
            Ok(false) => None,
            Err(err) => Some(self.close(ConnEvent::Failed(err))),
            Ok(true) if !self.keep_alive => Some(self.close(ConnEvent::Done)),
            Ok(true) => {
                log::trace!(target: "http", "Response to {} is flushed, keeping connection", self.peer);
                self.parser.reset();
                self.state = State::Idle;
                if self.pending.is_empty() {
                    return None;
                }
                // The client has sent more before getting the response.
                self.state = State::Reading;
                let data = mem::take(&mut self.pending);
                match parse(&mut self.parser, &mut self.pending, &data) {
                    Ok(None) => None,
                    Ok(Some(request)) => Some(self.dispatch(request)),
                    Err(err) => Some(self.close(ConnEvent::Malformed(err))),
                }
            }
        }
    }

    fn dispatch(&mut self, request: Request) -> ConnEvent {
        log::debug!(target: "http", "{} {} {} from {}", request.method(), request.target(), request.version(), self.peer);
        self.keep_alive = request.is_keep_alive();
        self.state = State::Dispatching;
        ConnEvent::Request(request)
    }

    fn close(&mut self, event: ConnEvent) -> ConnEvent {
        self.state = State::Closed;
        event
    }
}

/// Feeds the data into the parser. On completion the bytes which follow the request are stored
/// into `pending`.
fn parse(
    parser: &mut RequestParser,
    pending: &mut Vec<u8>,
    data: &[u8],
) -> Result<Option<Request>, ParseError> {
    match parser.feed(data)? {
        Status::Incomplete => Ok(None),
        Status::Complete(consumed) => {
            pending.extend_from_slice(&data[consumed..]);
            Ok(parser.take_request())
        }
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd { self.stream.as_raw_fd() }
}

impl WriteAtomic for Connection {
    fn is_ready_to_write(&self) -> bool { self.state == State::Dispatching }

    fn empty_write_buf(&mut self) -> io::Result<bool> {
        while self.written < self.output.len() {
            match self.stream.write_nonblocking(&self.output[self.written..]) {
                IoStatus::Success(len) => {
                    self.written += len;
                    self.activity.touch();
                }
                IoStatus::WouldBlock => return Ok(false),
                IoStatus::Shutdown => return Err(io::ErrorKind::WriteZero.into()),
                IoStatus::Err(err) => return Err(err),
            }
        }
        self.output.clear();
        self.written = 0;
        Ok(true)
    }

    fn write_or_buf(&mut self, buf: Vec<u8>) -> io::Result<()> {
        self.output = buf;
        self.written = 0;
        self.state = State::Writing;
        Ok(())
    }
}

impl Resource for Connection {
    type Event = ConnEvent;

    fn kind(&self) -> ResourceType { ResourceType::Transport }

    fn interests(&self) -> IoType {
        match self.state {
            State::Idle | State::Reading => IoType::read_only(),
            State::Writing => IoType::write_only(),
            State::Dispatching | State::Closed => IoType::none(),
        }
    }

    fn handle_io(&mut self, io: Io) -> Option<Self::Event> {
        match (io, self.state) {
            (Io::Read, State::Idle | State::Reading) => self.read(),
            (Io::Write, State::Writing) => self.write(),
            // Stale readiness reported before the interests got updated.
            _ => None,
        }
    }

    fn disconnect(self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(err) if err.kind() != io::ErrorKind::NotConnected => Err(err),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::registry::Registry;
    use crate::timeouts::Timestamp;

    fn connection() -> (TcpStream, Connection, Activity) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let activity = Activity::new(Timestamp::from(0));
        let id = Registry::new().insert(&server, peer, activity.clone()).unwrap();
        let conn = Connection::new(id, server, peer, activity.clone(), Limits::default(), 16);
        (client, conn, activity)
    }

    /// Drives the connection the way a reactor would until it produces an event.
    fn next_event(conn: &mut Connection) -> ConnEvent {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let io = if conn.interests().is_write_only() { Io::Write } else { Io::Read };
            if let Some(event) = conn.handle_io(io) {
                return event;
            }
            assert!(Instant::now() < deadline, "no event in {} state", conn.state());
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn expect_request(event: ConnEvent) -> Request {
        match event {
            ConnEvent::Request(request) => request,
            other => panic!("unexpected event {other:?}"),
        }
    }

    fn read_exact(client: &mut TcpStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        client.read_exact(&mut buf).unwrap();
        buf
    }

    #[test]
    fn request_response_cycle() {
        let (mut client, mut conn, activity) = connection();
        assert_eq!(conn.state(), State::Idle);
        assert_eq!(conn.interests(), IoType::read_only());
        assert!(conn.handle_io(Io::Read).is_none());
        assert!(conn.write_atomic(b"x".to_vec()).is_err());

        client.write_all(b"GET /hello HTTP/1.1\r\nHost: test\r\n\r\n").unwrap();
        let request = expect_request(next_event(&mut conn));
        assert_eq!(request.target(), "/hello");
        assert_eq!(conn.state(), State::Dispatching);
        assert_eq!(conn.interests(), IoType::none());
        assert!(!conn.is_keep_alive());
        assert!(activity.last() > Timestamp::from(0));

        conn.write_atomic(b"HTTP/1.1 200 OK\r\n\r\n".to_vec()).unwrap();
        assert_eq!(conn.state(), State::Writing);
        assert_eq!(conn.interests(), IoType::write_only());
        // Only one response may be in flight.
        assert!(conn.write_atomic(b"again".to_vec()).is_err());

        assert!(matches!(next_event(&mut conn), ConnEvent::Done));
        assert_eq!(conn.state(), State::Closed);
        assert_eq!(read_exact(&mut client, 19), b"HTTP/1.1 200 OK\r\n\r\n");
        conn.disconnect().unwrap();

        let mut rest = vec![];
        client.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn keep_alive_replays_pipelined_bytes() {
        let (mut client, mut conn, _) = connection();
        client
            .write_all(
                b"GET /a HTTP/1.1\r\nConnection: keep-alive\r\n\r\n\
                  GET /b HTTP/1.1\r\nConnection: close\r\n\r\nGET /c",
            )
            .unwrap();

        let first = expect_request(next_event(&mut conn));
        assert_eq!(first.target(), "/a");
        assert!(conn.is_keep_alive());

        conn.write_atomic(b"1".to_vec()).unwrap();
        // The second request comes out of the buffered bytes once the first response is out.
        let second = expect_request(next_event(&mut conn));
        assert_eq!(second.target(), "/b");
        assert!(!conn.is_keep_alive());
        assert_eq!(read_exact(&mut client, 1), b"1");

        conn.write_atomic(b"2".to_vec()).unwrap();
        assert!(matches!(next_event(&mut conn), ConnEvent::Done));
        assert_eq!(read_exact(&mut client, 1), b"2");
    }

    #[test]
    fn keep_alive_returns_to_idle() {
        let (mut client, mut conn, _) = connection();
        client.write_all(b"GET / HTTP/1.1\r\nconnection: Keep-Alive\r\n\r\n").unwrap();
        expect_request(next_event(&mut conn));
        conn.write_atomic(b"ok".to_vec()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while conn.state() == State::Writing {
            assert!(conn.handle_io(Io::Write).is_none());
            assert!(Instant::now() < deadline);
        }
        assert_eq!(conn.state(), State::Idle);
        assert_eq!(conn.interests(), IoType::read_only());
        assert_eq!(read_exact(&mut client, 2), b"ok");

        // The connection serves the next request over the same socket.
        client.write_all(b"POST /next HTTP/1.1\r\nContent-Length: 2\r\n\r\nhi").unwrap();
        let request = expect_request(next_event(&mut conn));
        assert_eq!(request.body(), b"hi");
    }

    #[test]
    fn malformed_request() {
        let (mut client, mut conn, _) = connection();
        client.write_all(b"HELLO\r\n\r\n").unwrap();
        assert!(matches!(
            next_event(&mut conn),
            ConnEvent::Malformed(ParseError::RequestLine(_))
        ));
        assert_eq!(conn.state(), State::Closed);
    }

    #[test]
    fn peer_closes_mid_request() {
        let (mut client, mut conn, _) = connection();
        client.write_all(b"GET / HTTP/1.1\r\nHost:").unwrap();
        client.shutdown(Shutdown::Write).unwrap();
        assert!(matches!(next_event(&mut conn), ConnEvent::PeerClosed));
        assert_eq!(conn.state(), State::Closed);
        assert_eq!(conn.interests(), IoType::none());
    }

    #[test]
    fn stale_readiness_is_ignored() {
        let (mut client, mut conn, _) = connection();
        client.write_all(b"GET / HTTP/1.1\r\n\r\nGET / HTTP/1.1\r\n\r\n").unwrap();
        expect_request(next_event(&mut conn));
        // No reads happen while the response is pending.
        assert!(conn.handle_io(Io::Read).is_none());
        assert!(conn.handle_io(Io::Write).is_none());
        assert_eq!(conn.state(), State::Dispatching);
    }
}
