//! Client connection pool: the per-connection state machine and the worker
//! threads that drive it.
//!
//! Slot lifecycle: FREE (on the free list) -> ARMED (registered one-shot,
//! tracked by the reaper) -> DISARMED (event delivered, held by exactly one
//! worker) -> back to ARMED on re-arm, or DEAD (socket closed) -> FREE.
//! Termination is idempotent by construction: whoever swaps the socket out
//! of the slot first owns the teardown, everyone else no-ops.

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::endpoint;
use crate::error::Error;
use crate::handler::{Callbacks, Session};
use crate::poller::{EventSink, Poller};
use crate::reaper::IdleReaper;
use crate::slab::{Slab, Slot};

/// Registration interest for every client connection.
const CLIENT_EVENTS: u32 = (libc::EPOLLIN
    | libc::EPOLLET
    | libc::EPOLLHUP
    | libc::EPOLLRDHUP
    | libc::EPOLLPRI
    | libc::EPOLLONESHOT) as u32;

/// How a connection leaves the pool, which decides the final callback.
enum Exit {
    /// Caller-driven teardown; no callback.
    Silent,
    /// Peer close, hang-up, or idle timeout.
    Closed,
    /// I/O error.
    Error,
}

/// Everything the workers share for one run of the pool.
pub(crate) struct PoolCore {
    slab: Slab,
    poller: Poller,
    reaper: IdleReaper<u32>,
    callbacks: Arc<Callbacks>,
}

struct Running {
    core: Arc<PoolCore>,
    workers: Vec<JoinHandle<Result<(), Error>>>,
}

/// Owns the slab, the poller, the reaper, and the worker threads.
pub struct ClientPool {
    callbacks: Arc<Callbacks>,
    state: RwLock<Option<Running>>,
}

impl ClientPool {
    pub fn new(callbacks: Arc<Callbacks>) -> ClientPool {
        ClientPool {
            callbacks,
            state: RwLock::new(None),
        }
    }

    /// Allocate the slab, start the reaper (when a timeout is configured),
    /// and spawn the worker threads.
    ///
    /// Returns `Ok(false)` if the pool is already running.
    pub fn run(&self, config: &Config) -> Result<bool, Error> {
        let mut state = self.state.write();
        if state.is_some() {
            return Ok(false);
        }

        let core = Arc::new(PoolCore {
            slab: Slab::new(config.max_clients, config.recv_buffer_size),
            poller: Poller::new(config.max_events)?,
            reaper: IdleReaper::new(),
            callbacks: Arc::clone(&self.callbacks),
        });

        if config.idle_timeout_ms > 0 {
            let pool = Arc::downgrade(&core);
            core.reaper
                .run(
                    Duration::from_millis(config.idle_timeout_ms),
                    move |expired| {
                        if let Some(pool) = pool.upgrade() {
                            for index in expired {
                                pool.finish(pool.slab.get(index), Exit::Closed);
                            }
                        }
                    },
                )
                .map_err(Error::Io)?;
        }

        let mut workers = Vec::with_capacity(config.workers);
        for i in 0..config.workers {
            let worker_core = Arc::clone(&core);
            let spawned = thread::Builder::new()
                .name(format!("myriad-worker-{i}"))
                .spawn(move || worker_core.poller.wait(&*worker_core));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    core.reaper.stop();
                    let _ = core.poller.shutdown();
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(Error::Io(e));
                }
            }
        }

        debug!(
            workers = config.workers,
            max_clients = config.max_clients,
            "client pool running"
        );

        *state = Some(Running { core, workers });
        Ok(true)
    }

    /// Stop the reaper, wind down every worker, force-close any remaining
    /// connection, and release the slab. A no-op if not running.
    pub fn stop(&self) -> Result<(), Error> {
        let mut state = self.state.write();
        let Some(Running { core, workers }) = state.take() else {
            return Ok(());
        };

        core.reaper.stop();
        core.poller.shutdown().map_err(Error::ShutdownRelay)?;

        let mut first_err = None;
        for handle in workers {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_err.get_or_insert(e);
                }
                Err(_) => {
                    first_err.get_or_insert(Error::WorkerPanicked);
                }
            }
        }

        // Close whatever is still open, without callbacks. The workers are
        // gone, so nothing races these.
        for index in 0..core.slab.capacity() as u32 {
            core.finish(core.slab.get(index), Exit::Silent);
        }

        debug!("client pool stopped");

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Attach an accepted socket to a free slot and arm it.
    ///
    /// At capacity (or when the pool is not running) the socket is left
    /// untouched for the caller to dispose of. If the poller rejects the
    /// registration the socket is closed and the slot recycled here, and the
    /// failure is returned.
    pub fn add_client(&self, sfd: RawFd) -> Result<u32, Error> {
        let state = self.state.read();
        let Some(running) = state.as_ref() else {
            return Err(Error::AtCapacity);
        };
        running.core.add_client(sfd)
    }
}

impl Drop for ClientPool {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

impl PoolCore {
    fn add_client(&self, sfd: RawFd) -> Result<u32, Error> {
        let Some(index) = self.slab.acquire() else {
            trace!(sfd, "admission refused, no free slot");
            return Err(Error::AtCapacity);
        };

        let slot = self.slab.get(index);
        slot.attach(sfd);

        self.callbacks.accepted(&Session::new(self, slot));

        if let Err(e) = self.poller.add(sfd, CLIENT_EVENTS, u64::from(index)) {
            warn!(uuid = index, error = %e, "failed to register client");
            self.finish(slot, Exit::Silent);
            return Err(Error::Io(e));
        }

        self.reaper.set(index);
        trace!(uuid = index, sfd, "client attached");

        Ok(index)
    }

    pub(crate) fn rearm(&self, slot: &Slot) {
        let sfd = slot.fd();
        if sfd == 0 {
            return;
        }
        if let Err(e) = self.poller.rearm(sfd, CLIENT_EVENTS, u64::from(slot.uuid())) {
            debug!(uuid = slot.uuid(), error = %e, "rearm failed");
        }
    }

    pub(crate) fn terminate(&self, slot: &Slot) {
        self.finish(slot, Exit::Silent);
    }

    /// Tear a connection down. Safe to call from any thread at any time; the
    /// first caller to claim the descriptor performs the teardown and fires
    /// the exit callback, later callers return immediately.
    fn finish(&self, slot: &Slot, exit: Exit) {
        let sfd = slot.take_fd();
        if sfd == 0 {
            return;
        }

        let _ = self.poller.remove(sfd);
        endpoint::close(sfd);
        self.reaper.unset(slot.uuid());

        match exit {
            Exit::Silent => {}
            Exit::Closed => self.callbacks.closed(&Session::new(self, slot)),
            Exit::Error => self.callbacks.error(&Session::new(self, slot)),
        }

        trace!(uuid = slot.uuid(), "client finished");
        self.slab.release(slot.uuid());
    }

    fn drain_read(&self, index: u32, slot: &Slot) {
        // Safety: this worker holds the slot's un-rearmed one-shot event, so
        // it is the only reader of this region until the handler re-arms.
        let buf = unsafe { self.slab.recv_buf(index) };

        loop {
            let sfd = slot.fd();
            if sfd == 0 {
                break;
            }
            match endpoint::recv(sfd, buf) {
                Ok(0) => {
                    self.finish(slot, Exit::Closed);
                    break;
                }
                Ok(n) => {
                    self.callbacks.data(&Session::new(self, slot), &buf[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => {
                    self.finish(slot, Exit::Error);
                    break;
                }
            }
        }
    }

    fn drain_oob(&self, slot: &Slot) {
        loop {
            let sfd = slot.fd();
            if sfd == 0 {
                break;
            }
            match endpoint::at_mark(sfd) {
                Ok(false) => break,
                Err(_) => {
                    self.finish(slot, Exit::Error);
                    break;
                }
                Ok(true) => match endpoint::recv_oob(sfd) {
                    Ok(Some(byte)) => {
                        self.callbacks.oob(&Session::new(self, slot), byte);
                    }
                    Ok(None) => break,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(_) => {
                        self.finish(slot, Exit::Error);
                        break;
                    }
                },
            }
        }
    }
}

impl EventSink for PoolCore {
    fn trigger(&self, token: u64, events: u32) {
        let index = token as u32;
        let slot = self.slab.get(index);
        if slot.fd() == 0 {
            return;
        }

        if events & libc::EPOLLERR as u32 != 0 {
            self.finish(slot, Exit::Error);
            return;
        }

        if events & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0 {
            self.finish(slot, Exit::Closed);
            return;
        }

        if events & libc::EPOLLPRI as u32 != 0 {
            self.reaper.set(index);
            self.drain_oob(slot);
        }

        if events & libc::EPOLLIN as u32 != 0 {
            if slot.fd() == 0 {
                return;
            }
            self.reaper.set(index);
            self.drain_read(index, slot);
        }
    }
}
