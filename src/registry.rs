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

//! Process-wide table of live client connections.
//!
//! The registry is shared between the acceptor, which adds connections, the workers, which remove
//! them once they close, and the reaper, which evicts idle ones. For each connection it keeps a
//! duplicate of the socket handle: evicting a connection shuts that duplicate down, which makes
//! the owning worker observe end-of-stream and close the socket from its own thread.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::timeouts::{Activity, Timestamp};

/// Unique connection identifier. Unlike file descriptors identifiers are never reused within a
/// process lifetime.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ConnId(u64);

impl Display for ConnId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result { write!(f, "#{}", self.0) }
}

#[derive(Debug)]
struct Entry {
    handle: TcpStream,
    peer: SocketAddr,
    activity: Activity,
}

#[derive(Debug, Default)]
pub struct Registry {
    next_id: AtomicU64,
    entries: Mutex<HashMap<ConnId, Entry>>,
}

impl Registry {
    pub fn new() -> Self { Self::default() }

    /// Adds a connection, keeping a duplicate of its socket handle.
    ///
    /// # Errors
    ///
    /// Fails when the OS refuses to duplicate the socket descriptor.
    pub fn insert(
        &self,
        stream: &TcpStream,
        peer: SocketAddr,
        activity: Activity,
    ) -> io::Result<ConnId> {
        let handle = stream.try_clone()?;
        let id = ConnId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().insert(
            id,
            Entry {
                handle,
                peer,
                activity,
            },
        );
        log::trace!(target: "reaper", "Tracking connection {id} from {peer}");
        Ok(id)
    }

    /// Forgets the connection. Returns `false` if it was already evicted.
    pub fn remove(&self, id: ConnId) -> bool { self.lock().remove(&id).is_some() }

    pub fn contains(&self, id: ConnId) -> bool { self.lock().contains_key(&id) }

    pub fn len(&self) -> usize { self.lock().len() }

    pub fn is_empty(&self) -> bool { self.lock().is_empty() }

    pub fn last_activity(&self, id: ConnId) -> Option<Timestamp> {
        self.lock().get(&id).map(|entry| entry.activity.last())
    }

    /// Evicts every connection which had no activity for longer than `threshold` at the moment
    /// `now`, shutting down both directions of the socket.
    ///
    /// Returns identifiers and peers of the evicted connections.
    pub fn evict_idle(&self, threshold: Duration, now: Timestamp) -> Vec<(ConnId, SocketAddr)> {
        let expired = {
            let mut entries = self.lock();
            let ids = entries
                .iter()
                .filter(|(_, entry)| entry.activity.idle_for(now) > threshold)
                .map(|(id, _)| *id)
                .collect::<Vec<_>>();
            ids.into_iter().filter_map(|id| entries.remove_entry(&id)).collect::<Vec<_>>()
        };

        expired
            .into_iter()
            .map(|(id, entry)| {
                log::debug!(target: "reaper",
                    "Evicting connection {id} from {} idle for {:?}", entry.peer, entry.activity.idle_for(now));
                shutdown(&entry);
                (id, entry.peer)
            })
            .collect()
    }

    /// Shuts down and forgets every remaining connection.
    pub fn clear(&self) -> usize {
        let entries = self.lock().drain().collect::<Vec<_>>();
        for (_, entry) in &entries {
            shutdown(entry);
        }
        entries.len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnId, Entry>> {
        // The map stays consistent whatever panicked while holding the lock.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn shutdown(entry: &Entry) {
    if let Err(err) = entry.handle.shutdown(Shutdown::Both) {
        // The peer may have closed the socket already.
        log::trace!(target: "reaper", "Unable to shut down connection from {}: {err}", entry.peer);
    }
}
