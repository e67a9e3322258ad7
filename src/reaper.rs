//! Background expiry of idle connections.
//!
//! A single thread polls a key -> last-activity map on a fixed cadence and
//! hands expired keys to the pool's close path in one batch. The map lock is
//! never held across the callback.

use std::collections::HashMap;
use std::hash::Hash;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

/// Polling cadence of the reaper thread.
const POLL_INTERVAL: Duration = Duration::from_micros(100);

struct State<K> {
    keys: HashMap<K, Instant>,
    running: bool,
}

/// Tracks last-activity timestamps and reports keys that exceed the timeout.
pub struct IdleReaper<K: Copy + Eq + Hash> {
    state: Arc<Mutex<State<K>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<K: Copy + Eq + Hash + Send + Sync + 'static> IdleReaper<K> {
    pub fn new() -> Self {
        IdleReaper {
            state: Arc::new(Mutex::new(State {
                keys: HashMap::new(),
                running: false,
            })),
            worker: Mutex::new(None),
        }
    }

    /// Start the reaper thread. Expired keys are removed from the map and
    /// delivered to `callback` as one batch per sweep. A zero timeout
    /// disables the reaper entirely; a second call while running is a no-op.
    /// Fails only when the thread cannot be spawned.
    pub fn run<F>(&self, timeout: Duration, callback: F) -> io::Result<()>
    where
        F: Fn(Vec<K>) + Send + 'static,
    {
        if timeout.is_zero() {
            return Ok(());
        }

        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        self.state.lock().running = true;
        let state = Arc::clone(&self.state);
        let spawned = thread::Builder::new()
            .name("myriad-reaper".to_string())
            .spawn(move || sweep_loop(state, timeout, callback));
        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.state.lock().running = false;
                Err(e)
            }
        }
    }

    /// Record activity for `key`, (re)starting its idle clock.
    pub fn set(&self, key: K) {
        self.state.lock().keys.insert(key, Instant::now());
    }

    /// Stop tracking `key`.
    pub fn unset(&self, key: K) {
        self.state.lock().keys.remove(&key);
    }

    /// Stop the reaper thread and join it. Idempotent.
    pub fn stop(&self) {
        let handle = {
            let mut worker = self.worker.lock();
            match worker.take() {
                Some(handle) => {
                    self.state.lock().running = false;
                    handle
                }
                None => return,
            }
        };
        let _ = handle.join();
    }
}

fn sweep_loop<K, F>(state: Arc<Mutex<State<K>>>, timeout: Duration, callback: F)
where
    K: Copy + Eq + Hash,
    F: Fn(Vec<K>),
{
    loop {
        thread::sleep(POLL_INTERVAL);

        let expired = {
            let mut state = state.lock();
            if !state.running {
                break;
            }

            let now = Instant::now();
            let expired: Vec<K> = state
                .keys
                .iter()
                .filter(|&(_, &then)| now.duration_since(then) > timeout)
                .map(|(&key, _)| key)
                .collect();
            for key in &expired {
                state.keys.remove(key);
            }
            expired
        };

        // Deliver outside the lock so the close path can touch the map.
        if !expired.is_empty() {
            debug!(expired = expired.len(), "idle connections timed out");
            callback(expired);
        }
    }
}
