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

//! Reactor runtime: a single-threaded event loop over one readiness multiplexer.

mod controller;

use std::collections::HashMap;
use std::fmt::{self, Debug, Display, Formatter};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use crossbeam_channel as chan;

pub use self::controller::Controller;
pub(crate) use self::controller::Ctl;
use crate::poller::{IoType, Poll, Waker, WakerRecv};
use crate::resource::{Resource, ResourceType, WriteAtomic, WriteError};
use crate::timeouts::Timestamp;

/// Maximum amount of time to wait for I/O.
const WAIT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Reactor errors
#[derive(Error, Display)]
#[display(doc_comments)]
pub enum Error<R: Resource> {
    /// resource {0} got disconnected during poll operation.
    Disconnected(RawFd, R),

    /// resource {0} has failed to accept the data
    WriteFailure(RawFd, R, io::Error),

    /// polling multiple resources has failed. Details: {0:?}
    Poll(io::Error),
}

impl<R: Resource> Debug for Error<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result { Display::fmt(self, f) }
}

/// Actions which can be provided to the reactor by the [`Handler`].
///
/// Reactor reads actions on each event loop using [`Handler`] iterator interface.
#[derive(Display)]
pub enum Action<R: Resource> {
    /// Register a new resource for the reactor poll.
    ///
    /// Reactor can't instantiate the resource, like bind a network listener or accept a
    /// connection. Reactor only can register already active resource for polling in the event
    /// loop.
    #[display("register")]
    Register(R),

    /// Unregister resource from the reactor poll and handover it to the [`Handler`] via
    /// [`Handler::handover`].
    ///
    /// When the resource is unregistered no action is performed, i.e. the file descriptor is not
    /// closed. Closing is up to the handler upon the handover event.
    #[display("unregister({0})")]
    Unregister(RawFd),

    /// Hand the data over to one of the resources using [`crate::WriteAtomic`]. The data are
    /// flushed once the resource reports write readiness.
    #[display("send_to({0})")]
    Send(RawFd, Vec<u8>),

    /// Gracefully terminate the reactor.
    #[display("terminate")]
    Terminate,
}

/// A service which handles I/O events generated in the reactor.
pub trait Handler: Send + Iterator<Item = Action<Self::Resource>> {
    /// Type of the resources polled by the reactor on behalf of this service.
    type Resource: Resource;

    /// A command which may be sent to the [`Handler`] from outside the reactor, including other
    /// threads.
    ///
    /// The handler object is owned by the reactor runtime and executes always in the context of
    /// the reactor runtime thread. Thus, if other threads need to communicate to the handler they
    /// have to use this data type, sent with the reactor [`Controller`] API.
    type Command: Debug + Send;

    /// Method called by the reactor upon I/O event on a resource.
    fn handle_event(
        &mut self,
        fd: RawFd,
        event: <Self::Resource as Resource>::Event,
        time: Timestamp,
    );

    /// Method called by the reactor when a given resource was successfully registered.
    fn handle_registered(&mut self, fd: RawFd, ty: ResourceType);

    /// Method called by the reactor when a [`Self::Command`] is received for the [`Handler`].
    fn handle_command(&mut self, cmd: Self::Command);

    /// Method called by the reactor on any kind of error during the event loop, including errors
    /// of the poll syscall or I/O errors returned as a part of the poll result events.
    ///
    /// See [`enum@Error`] for the details on errors which may happen.
    fn handle_error(&mut self, err: Error<Self::Resource>);

    /// Method called by the reactor upon receiving [`Action::Unregister`] and, for every resource
    /// it still owns, when the event loop exits.
    ///
    /// Passes the resource to the [`Handler`] when it is already not a part of the reactor poll.
    fn handover(&mut self, fd: RawFd, resource: Self::Resource);
}

/// Internal reactor runtime which is run in a dedicated thread.
///
/// Use this structure directly only if you'd like to have the full control over the reactor
/// thread.
///
/// This runtime structure **does not** spawn a thread and is **blocking**. It implements the
/// actual reactor event loop.
pub struct Runtime<H: Handler, P: Poll> {
    service: H,
    poller: P,
    ctl_recv: chan::Receiver<Ctl<H::Command>>,
    resources: HashMap<RawFd, H::Resource>,
    waker: <P::Waker as Waker>::Recv,
}

impl<H: Handler, P: Poll> Runtime<H, P> {
    pub fn with(
        service: H,
        mut poller: P,
        ctl_recv: chan::Receiver<Ctl<H::Command>>,
        waker: <P::Waker as Waker>::Recv,
    ) -> Self {
        log::debug!(target: "reactor", "Registering waker (fd {})", waker.as_raw_fd());
        poller.register_waker(&waker);

        Runtime {
            service,
            poller,
            ctl_recv,
            resources: empty!(),
            waker,
        }
    }

    /// Executes reactor event loop.
    ///
    /// Returns when the reactor is shut down via its [`Controller`], when the handler returns
    /// [`Action::Terminate`] or when the poll syscall fails. A failed poll is fatal only to this
    /// reactor; it is reported to the handler before the loop exits.
    pub fn run(mut self) {
        loop {
            for (fd, res) in &self.resources {
                self.poller.set_interest(fd, res.interests());
            }

            // Blocking
            log::trace!(target: "reactor", "Polling with timeout {WAIT_TIMEOUT:?}");

            let res = self.poller.poll(Some(WAIT_TIMEOUT));
            let now = Timestamp::now();

            match res {
                Ok(0) => {
                    log::trace!(target: "reactor", "Poll timeout; no I/O events had happened");
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                    log::trace!(target: "reactor", "Poll was interrupted by a signal");
                    continue;
                }
                Err(err) => {
                    log::error!(target: "reactor", "Error during polling: {err}; terminating the reactor");
                    self.service.handle_error(Error::Poll(err));
                    return self.handle_shutdown();
                }
                Ok(_) => {}
            }

            let awoken = self.handle_events(now);

            // Process the commands only if we awaken by the waker
            if awoken {
                loop {
                    match self.ctl_recv.try_recv() {
                        Err(chan::TryRecvError::Empty) => break,
                        Err(chan::TryRecvError::Disconnected) => {
                            log::warn!(target: "reactor", "All controllers are gone; terminating the reactor");
                            return self.handle_shutdown();
                        }
                        Ok(Ctl::Shutdown) => return self.handle_shutdown(),
                        Ok(Ctl::Cmd(cmd)) => self.service.handle_command(cmd),
                    }
                }
            }

            if !self.handle_actions() {
                break;
            };
        }
        self.handle_shutdown()
    }

    /// # Returns
    ///
    /// Whether it was awakened by a waker
    fn handle_events(&mut self, time: Timestamp) -> bool {
        let mut awoken = false;

        while let Some((fd, res)) = self.poller.next() {
            if fd == self.waker.as_raw_fd() {
                if let Err(err) = res {
                    log::error!(target: "reactor", "Polling waker has failed: {err}");
                }

                log::trace!(target: "reactor", "Awoken by the controller");

                self.waker.reset();
                awoken = true;
                continue;
            }

            match res {
                Ok(io) => {
                    log::trace!(target: "reactor", "Got `{io}` event from resource {fd}");

                    let Some(resource) = self.resources.get_mut(&fd) else {
                        // An event queued for a resource which was unregistered in between.
                        log::debug!(target: "reactor", "Ignoring event for unknown resource {fd}");
                        continue;
                    };
                    for io in io {
                        if let Some(event) = resource.handle_io(io) {
                            self.service.handle_event(fd, event, time);
                        }
                    }
                }
                Err(err) => {
                    log::debug!(target: "reactor", "Resource {fd} {err}");
                    if let Some(resource) = self.unregister(fd) {
                        self.service.handle_error(Error::Disconnected(fd, resource));
                    }
                }
            }
        }

        awoken
    }

    /// Handles the actions from the queue.
    ///
    /// # Return
    ///
    /// Return value indicates whether the reactor must proceed operating (`true`) or should
    /// terminate (`false`).
    fn handle_actions(&mut self) -> bool {
        let mut result = true;
        while let Some(action) = self.service.next() {
            log::trace!(target: "reactor", "Handling action {action} from the service");

            // NB: Deadlock may happen here if the service will generate events over and over
            // in the handle_* calls we may never get out of this loop
            match self.handle_action(action) {
                Ok(ret) => result &= ret,
                Err(err) => {
                    log::error!(target: "reactor", "Error: {err}");
                    self.service.handle_error(err);
                }
            }
        }
        result
    }

    fn handle_action(&mut self, action: Action<H::Resource>) -> Result<bool, Error<H::Resource>> {
        match action {
            Action::Register(resource) => {
                let fd = resource.as_raw_fd();
                let ty = resource.kind();

                log::debug!(target: "reactor", "Registering {ty} with fd={fd}");

                self.poller.register(&resource, IoType::none());
                if let Some(old) = self.resources.insert(fd, resource) {
                    log::error!(target: "reactor", "File descriptor {fd} was registered twice");
                    // The descriptor number got reused by the OS, thus the old resource is
                    // already closed.
                    drop(old);
                }
                self.service.handle_registered(fd, ty);
            }
            Action::Unregister(fd) => {
                let Some(resource) = self.unregister(fd) else {
                    return Ok(true);
                };
                log::debug!(target: "reactor", "Handing over resource {fd}");
                self.service.handover(fd, resource);
            }
            Action::Send(fd, data) => {
                log::trace!(target: "reactor", "Sending {} bytes to {fd}", data.len());

                let Some(resource) = self.resources.get_mut(&fd) else {
                    log::error!(target: "reactor", "Resource {fd} is not in the reactor");
                    return Ok(true);
                };
                match resource.write_atomic(data) {
                    Err(WriteError::NotReady) => {
                        log::error!(target: "reactor",
                            "An attempt to write to resource {fd} before it got ready, disconnecting");
                        if let Some(resource) = self.unregister(fd) {
                            let err = io::Error::new(io::ErrorKind::Other, WriteError::NotReady);
                            return Err(Error::WriteFailure(fd, resource, err));
                        }
                    }
                    Err(WriteError::Io(err)) => {
                        log::error!(target: "reactor",
                            "Fatal error writing to resource {fd}, disconnecting. Error details: {err:?}");
                        if let Some(resource) = self.unregister(fd) {
                            return Err(Error::WriteFailure(fd, resource, err));
                        }
                    }
                    Ok(_) => {}
                }
            }
            Action::Terminate => return Ok(false),
        }
        Ok(true)
    }

    /// Hands every resource still owned by the reactor over to the service, including the ones
    /// queued for registration. Any in-flight I/O is abandoned.
    fn handle_shutdown(mut self) {
        log::info!(target: "reactor", "Shutdown; releasing {} resource(s)", self.resources.len());

        for (fd, resource) in self.resources.drain() {
            self.poller.unregister(&fd);
            self.service.handover(fd, resource);
        }
        while let Some(action) = self.service.next() {
            if let Action::Register(resource) = action {
                let fd = resource.as_raw_fd();
                log::debug!(target: "reactor", "Releasing resource {fd} which was never registered");
                self.service.handover(fd, resource);
            }
        }
    }

    fn unregister(&mut self, fd: RawFd) -> Option<H::Resource> {
        let Some(resource) = self.resources.remove(&fd) else {
            log::warn!(target: "reactor", "Unregistering non-registered resource {fd}");
            return None;
        };

        log::debug!(target: "reactor", "Unregistering resource {fd}");

        self.poller.unregister(&fd);

        Some(resource)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::poller::popol::Poller;
    use crate::{Io, Reactor, WriteAtomic};

    /// Writes every chunk it gets straight into the socket.
    struct Echo(TcpStream);

    impl AsRawFd for Echo {
        fn as_raw_fd(&self) -> RawFd { self.0.as_raw_fd() }
    }
    impl WriteAtomic for Echo {
        fn is_ready_to_write(&self) -> bool { true }
        fn empty_write_buf(&mut self) -> io::Result<bool> { Ok(true) }
        fn write_or_buf(&mut self, buf: Vec<u8>) -> io::Result<()> {
            use std::io::Write;
            self.0.write_all(&buf)
        }
    }
    impl Resource for Echo {
        type Event = Vec<u8>;
        fn kind(&self) -> ResourceType { ResourceType::Transport }
        fn interests(&self) -> IoType { IoType::read_only() }
        fn handle_io(&mut self, io: Io) -> Option<Self::Event> {
            use std::io::Read;
            assert_eq!(io, Io::Read);
            let mut buf = [0u8; 64];
            match self.0.read(&mut buf) {
                Ok(len) => Some(buf[..len].to_vec()),
                Err(_) => None,
            }
        }
        fn disconnect(self) -> io::Result<()> { Ok(()) }
    }

    #[derive(Default)]
    struct EchoService {
        actions: VecDeque<Action<Echo>>,
        released: Arc<AtomicUsize>,
    }
    impl Iterator for EchoService {
        type Item = Action<Echo>;
        fn next(&mut self) -> Option<Self::Item> { self.actions.pop_front() }
    }
    impl Handler for EchoService {
        type Resource = Echo;
        type Command = TcpStream;

        fn handle_event(&mut self, fd: RawFd, event: Vec<u8>, _time: Timestamp) {
            if event.is_empty() {
                self.actions.push_back(Action::Unregister(fd));
            } else {
                self.actions.push_back(Action::Send(fd, event));
            }
        }
        fn handle_registered(&mut self, _fd: RawFd, ty: ResourceType) {
            assert_eq!(ty, ResourceType::Transport);
        }
        fn handle_command(&mut self, stream: TcpStream) {
            stream.set_nonblocking(true).unwrap();
            self.actions.push_back(Action::Register(Echo(stream)));
        }
        fn handle_error(&mut self, err: Error<Echo>) { panic!("{err}") }
        fn handover(&mut self, _fd: RawFd, _resource: Echo) {
            self.released.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn commands_register_resources() {
        let service = EchoService::default();
        let released = service.released.clone();
        let reactor = Reactor::named(service, Poller::new(), s!("echo")).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        reactor.controller().cmd(server).unwrap();

        use std::io::{Read, Write};
        client.write_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        reactor.controller().shutdown().map_err(|_| "shutdown").unwrap();
        reactor.join().unwrap();
        // The connection still registered on exit is given back to the service.
        assert_eq!(released.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn write_failure_message() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let fd = stream.as_raw_fd();
        let err = Error::WriteFailure(fd, Echo(stream), io::ErrorKind::BrokenPipe.into());
        assert!(err.to_string().starts_with(&format!("resource {fd} has failed to accept the data")));
        assert_eq!(format!("{err:?}"), err.to_string());
    }

    #[test]
    fn shutdown_wakes_idle_reactor() {
        let reactor = Reactor::named(EchoService::default(), Poller::new(), s!("idle")).unwrap();
        thread::sleep(Duration::from_millis(50));
        reactor.controller().shutdown().map_err(|_| "shutdown").unwrap();
        reactor.join().unwrap();
    }
}
