//! Listener pool: owns the listening sockets and feeds accepted connections
//! to the client pool.

use std::collections::BTreeMap;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::client_pool::ClientPool;
use crate::config::Config;
use crate::endpoint;
use crate::error::Error;
use crate::handler::Callbacks;
use crate::poller::{EventSink, Poller};

/// Registration interest for listening sockets. Exclusive wake keeps one
/// readiness event from rousing more than one waiter.
const LISTENER_EVENTS: u32 = (libc::EPOLLIN | libc::EPOLLET | libc::EPOLLEXCLUSIVE) as u32;

struct Listener {
    sfd: RawFd,
}

/// Accepts connections on one or more listening sockets and hands them to
/// the owned [`ClientPool`].
pub struct ServerPool {
    clients: ClientPool,
    poller: Poller,
    listeners: Mutex<BTreeMap<u32, Listener>>,
    lifecycle: Mutex<()>,
    in_wait: AtomicBool,
}

impl ServerPool {
    pub fn new(config: &Config, callbacks: Arc<Callbacks>) -> Result<ServerPool, Error> {
        Ok(ServerPool {
            clients: ClientPool::new(callbacks),
            poller: Poller::new(config.max_events)?,
            listeners: Mutex::new(BTreeMap::new()),
            lifecycle: Mutex::new(()),
            in_wait: AtomicBool::new(false),
        })
    }

    /// Create a listening socket on `port` and register it.
    pub fn bind(&self, port: u16, backlog: i32) -> Result<(), Error> {
        let _guard = self.lifecycle.lock();

        let sfd = endpoint::tcp_listener(port, backlog)?;
        if let Err(e) = endpoint::set_nonblocking(sfd) {
            endpoint::close(sfd);
            return Err(Error::Io(e));
        }
        if let Err(e) = self.register(sfd) {
            endpoint::close(sfd);
            return Err(e);
        }

        debug!(port, "listening");
        Ok(())
    }

    /// Register an existing listening socket. The caller is responsible for
    /// having put it in non-blocking mode.
    pub fn add(&self, sfd: RawFd) -> Result<(), Error> {
        let _guard = self.lifecycle.lock();
        self.register(sfd)
    }

    fn register(&self, sfd: RawFd) -> Result<(), Error> {
        let mut listeners = self.listeners.lock();
        let uuid = listeners.keys().next_back().map_or(1, |id| id + 1);
        self.poller.add(sfd, LISTENER_EVENTS, u64::from(uuid))?;
        listeners.insert(uuid, Listener { sfd });
        Ok(())
    }

    /// Start the client pool, then serve listener readiness on the calling
    /// thread until [`ServerPool::stop`] is invoked. Returns immediately if
    /// the pool is already running.
    pub fn run(&self, config: &Config) -> Result<(), Error> {
        {
            let _guard = self.lifecycle.lock();
            if !self.clients.run(config)? {
                return Ok(());
            }
            self.in_wait.store(true, Ordering::SeqCst);
        }

        let result = self.poller.wait(self);
        self.in_wait.store(false, Ordering::SeqCst);
        result
    }

    /// Shut the listener loop and the client pool down. Synchronous and
    /// idempotent.
    pub fn stop(&self) -> Result<(), Error> {
        let _guard = self.lifecycle.lock();

        if self.in_wait.swap(false, Ordering::SeqCst) {
            self.poller.shutdown().map_err(Error::ShutdownRelay)?;
        }
        self.clients.stop()
    }

    /// Access to the owned client pool.
    pub fn clients(&self) -> &ClientPool {
        &self.clients
    }
}

impl EventSink for ServerPool {
    fn trigger(&self, token: u64, events: u32) {
        let uuid = token as u32;

        if events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
            if let Some(listener) = self.listeners.lock().remove(&uuid) {
                warn!(listener = uuid, "listener failed, closing");
                endpoint::close(listener.sfd);
            }
            return;
        }

        let sfd = match self.listeners.lock().get(&uuid) {
            Some(listener) => listener.sfd,
            None => return,
        };

        // Edge-triggered: drain the accept queue completely.
        loop {
            match endpoint::accept(sfd) {
                Ok(cfd) => {
                    if endpoint::set_nonblocking(cfd).is_err() {
                        endpoint::close(cfd);
                        continue;
                    }
                    match self.clients.add_client(cfd) {
                        Ok(id) => trace!(uuid = id, "accepted"),
                        // At capacity the socket is still ours to dispose of.
                        Err(Error::AtCapacity) => endpoint::close(cfd),
                        // Registration failures already closed the socket.
                        Err(_) => {}
                    }
                }
                Err(_) => break,
            }
        }
    }
}

impl Drop for ServerPool {
    fn drop(&mut self) {
        let _ = self.stop();
        for listener in self.listeners.lock().values() {
            endpoint::close(listener.sfd);
        }
    }
}
