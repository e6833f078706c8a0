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

//! Timer thread closing connections which stayed silent for too long.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel as chan;

use crate::registry::Registry;
use crate::timeouts::Timestamp;

/// Shortest period between two reaping cycles.
pub const MIN_REAP_INTERVAL: Duration = Duration::from_millis(10);

/// Idle connection reaper.
///
/// Runs outside of any reactor: it never touches a poller, only the shared [`Registry`]. Stopped
/// with [`Reaper::shutdown`] or by dropping it.
pub struct Reaper {
    stop: Option<chan::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Reaper {
    /// Spawns the reaper thread which checks the registry every `interval` and evicts connections
    /// idle for longer than `threshold`. Intervals below [`MIN_REAP_INTERVAL`] are raised to it.
    pub fn spawn(registry: Arc<Registry>, threshold: Duration, interval: Duration) -> io::Result<Self> {
        let interval = interval.max(MIN_REAP_INTERVAL);
        let (stop, stopped) = chan::bounded::<()>(1);
        let thread = thread::Builder::new().name(s!("http-reaper")).spawn(move || {
            log::info!(target: "reaper", "Reaping connections idle for more than {threshold:?} every {interval:?}");
            loop {
                match stopped.recv_timeout(interval) {
                    Err(chan::RecvTimeoutError::Timeout) => {
                        sweep(&registry, threshold, Timestamp::now());
                    }
                    // Explicit stop or the owner is gone.
                    Ok(()) | Err(chan::RecvTimeoutError::Disconnected) => break,
                }
            }
            log::info!(target: "reaper", "Reaper has stopped");
        })?;
        Ok(Reaper {
            stop: Some(stop),
            thread: Some(thread),
        })
    }

    /// Stops the reaper thread and waits for it to exit.
    pub fn shutdown(mut self) { self.stop_thread() }

    fn stop_thread(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.try_send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!(target: "reaper", "Reaper thread has panicked");
            }
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) { self.stop_thread() }
}

/// Runs a single reaping cycle, returning the number of evicted connections.
pub fn sweep(registry: &Registry, threshold: Duration, now: Timestamp) -> usize {
    let evicted = registry.evict_idle(threshold, now);
    if !evicted.is_empty() {
        log::info!(target: "reaper", "Closed {} idle connection(s); {} remain", evicted.len(), registry.len());
    }
    evicted.len()
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};
    use std::time::Instant;

    use super::*;
    use crate::timeouts::Activity;

    #[test]
    fn sweep_counts() {
        let registry = Registry::new();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        registry.insert(&server, peer, Activity::new(Timestamp::from(0))).unwrap();
        registry.insert(&server, peer, Activity::new(Timestamp::from(9_500))).unwrap();

        assert_eq!(sweep(&registry, Duration::from_secs(1), Timestamp::from(10_000)), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(sweep(&registry, Duration::from_secs(1), Timestamp::from(10_000)), 0);
    }

    #[test]
    fn reaps_silent_connection() {
        let registry = Arc::new(Registry::new());
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        registry.insert(&server, peer, Activity::new(Timestamp::now())).unwrap();

        let reaper = Reaper::spawn(
            registry.clone(),
            Duration::from_millis(100),
            Duration::from_millis(20),
        )
        .unwrap();

        let started = Instant::now();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
        assert!(started.elapsed() >= Duration::from_millis(90));
        assert!(registry.is_empty());

        reaper.shutdown();
    }

    #[test]
    fn shutdown_is_prompt() {
        let reaper =
            Reaper::spawn(Arc::new(Registry::new()), Duration::from_secs(60), Duration::from_secs(3600))
                .unwrap();
        let started = Instant::now();
        reaper.shutdown();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn zero_interval_still_reaps() {
        let registry = Arc::new(Registry::new());
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        registry.insert(&server, peer, Activity::new(Timestamp::from(0))).unwrap();

        let reaper = Reaper::spawn(registry.clone(), Duration::from_secs(1), Duration::ZERO).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !registry.is_empty() {
            assert!(Instant::now() < deadline);
            thread::sleep(MIN_REAP_INTERVAL);
        }
        reaper.shutdown();
    }
}
