//! User-facing callback surface.
//!
//! Each callback is independently optional; unbound events are dropped.
//! Bindings can be replaced at any time, including while the pool is
//! running: dispatch clones the bound closure out from under a short lock
//! before invoking it.

use std::os::fd::RawFd;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::client_pool::PoolCore;
use crate::endpoint;
use crate::slab::Slot;

pub(crate) type SessionFn = Arc<dyn Fn(&Session) + Send + Sync>;
pub(crate) type DataFn = Arc<dyn Fn(&Session, &[u8]) + Send + Sync>;
pub(crate) type OobFn = Arc<dyn Fn(&Session, u8) + Send + Sync>;

#[derive(Default)]
struct Table {
    accepted: Option<SessionFn>,
    data: Option<DataFn>,
    oob: Option<OobFn>,
    closed: Option<SessionFn>,
    error: Option<SessionFn>,
}

/// The set of bound event callbacks.
#[derive(Default)]
pub struct Callbacks {
    table: Mutex<Table>,
}

impl Callbacks {
    pub fn set_accepted(&self, f: impl Fn(&Session) + Send + Sync + 'static) {
        self.table.lock().accepted = Some(Arc::new(f));
    }

    pub fn set_data(&self, f: impl Fn(&Session, &[u8]) + Send + Sync + 'static) {
        self.table.lock().data = Some(Arc::new(f));
    }

    pub fn set_oob(&self, f: impl Fn(&Session, u8) + Send + Sync + 'static) {
        self.table.lock().oob = Some(Arc::new(f));
    }

    pub fn set_closed(&self, f: impl Fn(&Session) + Send + Sync + 'static) {
        self.table.lock().closed = Some(Arc::new(f));
    }

    pub fn set_error(&self, f: impl Fn(&Session) + Send + Sync + 'static) {
        self.table.lock().error = Some(Arc::new(f));
    }

    pub(crate) fn accepted(&self, session: &Session) {
        let cb = self.table.lock().accepted.clone();
        if let Some(cb) = cb {
            cb(session);
        }
    }

    pub(crate) fn data(&self, session: &Session, bytes: &[u8]) {
        let cb = self.table.lock().data.clone();
        if let Some(cb) = cb {
            cb(session, bytes);
        }
    }

    pub(crate) fn oob(&self, session: &Session, byte: u8) {
        let cb = self.table.lock().oob.clone();
        if let Some(cb) = cb {
            cb(session, byte);
        }
    }

    pub(crate) fn closed(&self, session: &Session) {
        let cb = self.table.lock().closed.clone();
        if let Some(cb) = cb {
            cb(session);
        }
    }

    pub(crate) fn error(&self, session: &Session) {
        let cb = self.table.lock().error.clone();
        if let Some(cb) = cb {
            cb(session);
        }
    }
}

/// Borrowed view over a live connection, passed to every callback.
///
/// A session is only valid for the duration of the callback; the borrow
/// checker enforces that it cannot be stashed and used later.
pub struct Session<'a> {
    pool: &'a PoolCore,
    slot: &'a Slot,
}

impl<'a> Session<'a> {
    pub(crate) fn new(pool: &'a PoolCore, slot: &'a Slot) -> Self {
        Session { pool, slot }
    }

    /// Slot identifier. Stable for the life of the pool, but reused by later
    /// connections once this one terminates; it names the slot, not the
    /// connection.
    pub fn uuid(&self) -> u32 {
        self.slot.uuid()
    }

    /// Write `data` to the connection, looping until everything is sent or
    /// the socket refuses more. Returns the number of bytes actually sent;
    /// short writes are possible on a non-blocking socket.
    pub fn write(&self, data: &[u8]) -> usize {
        let sfd: RawFd = self.slot.fd();
        if sfd == 0 {
            return 0;
        }

        let mut sent = 0;
        while sent < data.len() {
            match endpoint::send(sfd, &data[sent..]) {
                Ok(0) | Err(_) => break,
                Ok(n) => sent += n,
            }
        }
        sent
    }

    /// Re-arm the connection for its next event. Without this, a connection
    /// that has delivered `on_data`/`on_oob` goes quiet forever.
    pub fn rearm(&self) {
        self.pool.rearm(self.slot);
    }

    /// Close the connection and recycle its slot. No further callbacks fire
    /// for it.
    pub fn terminate(&self) {
        self.pool.terminate(self.slot);
    }
}
