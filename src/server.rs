//! Facade tying the listener pool, the client pool, and the callback
//! surface together.

use std::os::fd::RawFd;
use std::sync::Arc;

use crate::config::Config;
use crate::error::Error;
use crate::handler::{Callbacks, Session};
use crate::server_pool::ServerPool;

/// A multi-worker TCP server.
///
/// Bind one or more ports, attach the callbacks you care about, then call
/// [`Server::run`]: it blocks the calling thread as the accept loop while
/// the configured workers service connections. [`Server::stop`] (from any
/// other thread) tears everything down and returns once every worker has
/// joined and every socket is closed.
///
/// ```no_run
/// use myriad::{Config, Server};
///
/// let server = Server::new(Config::default()).unwrap();
/// server.on_data(|session, data| {
///     session.write(data);
///     session.rearm();
/// });
/// server.bind(7000).unwrap();
/// server.run().unwrap();
/// ```
pub struct Server {
    config: Config,
    callbacks: Arc<Callbacks>,
    pool: ServerPool,
}

impl Server {
    pub fn new(config: Config) -> Result<Server, Error> {
        let callbacks = Arc::new(Callbacks::default());
        let pool = ServerPool::new(&config, Arc::clone(&callbacks))?;
        Ok(Server {
            config,
            callbacks,
            pool,
        })
    }

    /// Listen on `port` with the configured backlog.
    pub fn bind(&self, port: u16) -> Result<(), Error> {
        self.pool.bind(port, self.config.backlog)
    }

    /// Listen on `port` with an explicit backlog.
    pub fn bind_with_backlog(&self, port: u16, backlog: i32) -> Result<(), Error> {
        self.pool.bind(port, backlog)
    }

    /// Adopt an existing non-blocking listening socket.
    pub fn add(&self, sfd: RawFd) -> Result<(), Error> {
        self.pool.add(sfd)
    }

    /// Called once per accepted connection, before any data delivery.
    pub fn on_accepted(&self, f: impl Fn(&Session) + Send + Sync + 'static) {
        self.callbacks.set_accepted(f);
    }

    /// Called with each chunk of inbound bytes. Call [`Session::rearm`] from
    /// the handler to keep receiving; edge-triggered delivery will not
    /// repeat bytes already handed over.
    pub fn on_data(&self, f: impl Fn(&Session, &[u8]) + Send + Sync + 'static) {
        self.callbacks.set_data(f);
    }

    /// Called with each out-of-band byte.
    pub fn on_oob(&self, f: impl Fn(&Session, u8) + Send + Sync + 'static) {
        self.callbacks.set_oob(f);
    }

    /// Called exactly once when a connection ends by peer close, hang-up, or
    /// idle timeout. Mutually exclusive with `on_error` for a given
    /// connection.
    pub fn on_closed(&self, f: impl Fn(&Session) + Send + Sync + 'static) {
        self.callbacks.set_closed(f);
    }

    /// Called exactly once when a connection ends on an I/O error.
    pub fn on_error(&self, f: impl Fn(&Session) + Send + Sync + 'static) {
        self.callbacks.set_error(f);
    }

    /// Run the server on the calling thread. Blocks until [`Server::stop`].
    pub fn run(&self) -> Result<(), Error> {
        self.pool.run(&self.config)
    }

    /// Stop the server: no new connections, all workers joined, all client
    /// sockets closed.
    pub fn stop(&self) -> Result<(), Error> {
        self.pool.stop()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
