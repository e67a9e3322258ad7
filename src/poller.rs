//! Readiness multiplexer over epoll.
//!
//! All registrations are edge-triggered; client registrations are also
//! one-shot, which is what serializes event handling per connection: after a
//! delivery the registration is disarmed until the owner re-arms it, so at
//! most one worker ever processes a given descriptor's events.
//!
//! Shutdown uses a daisy chain over a self-pipe. The pipe's read end is
//! registered one-shot at construction; [`Poller::shutdown`] re-arms it and
//! writes a single token byte. The one worker that wakes consumes the byte,
//! drops out of its wait loop, and re-posts the token if other waiters
//! remain. epoll does not fan a one-shot event out to every waiter, so the
//! token is relayed rather than broadcast.

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use tracing::debug;

use crate::error::Error;

/// Registration token reserved for the shutdown self-pipe.
const SHUTDOWN_TOKEN: u64 = u64::MAX;

/// Receives non-shutdown events from [`Poller::wait`].
pub trait EventSink {
    /// Called once per delivered event with the registration token and the
    /// raw epoll event bits.
    fn trigger(&self, token: u64, events: u32);
}

/// An epoll instance plus the self-pipe used to wind its waiters down.
pub struct Poller {
    epfd: RawFd,
    pipe: [RawFd; 2],
    max_events: usize,
    waiters: AtomicI32,
}

impl Poller {
    /// Create the epoll instance and the shutdown self-pipe.
    pub fn new(max_events: usize) -> Result<Poller, Error> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        let mut pipe = [0 as RawFd; 2];
        let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, pipe.as_mut_ptr()) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(epfd);
            }
            return Err(Error::Io(err));
        }

        let poller = Poller {
            epfd,
            pipe,
            max_events,
            waiters: AtomicI32::new(0),
        };

        let events = (libc::EPOLLIN | libc::EPOLLET | libc::EPOLLONESHOT) as u32;
        poller.add(pipe[1], events, SHUTDOWN_TOKEN)?;

        Ok(poller)
    }

    /// Register a descriptor.
    pub fn add(&self, sfd: RawFd, events: u32, token: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, sfd, events, token)
    }

    /// Re-arm a one-shot registration.
    pub fn rearm(&self, sfd: RawFd, events: u32, token: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, sfd, events, token)
    }

    /// Drop a registration.
    pub fn remove(&self, sfd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, sfd, 0, 0)
    }

    /// Worker loop: poll for events and hand each one to `sink` until the
    /// shutdown token arrives.
    ///
    /// Polls with a zero timeout; workers are pollers, not blockers.
    /// Returns `Ok(())` on an orderly shutdown. A failure to relay the
    /// shutdown token is fatal, since remaining waiters could never be
    /// joined.
    pub fn wait<S: EventSink>(&self, sink: &S) -> Result<(), Error> {
        self.waiters.fetch_add(1, Ordering::SeqCst);

        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; self.max_events];

        loop {
            let n = unsafe {
                libc::epoll_wait(
                    self.epfd,
                    events.as_mut_ptr(),
                    self.max_events as libc::c_int,
                    0,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                self.waiters.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::Io(err));
            }

            for event in &events[..n as usize] {
                let token = event.u64;
                if token == SHUTDOWN_TOKEN {
                    let mut byte = [0u8; 1];
                    unsafe {
                        libc::recv(self.pipe[1], byte.as_mut_ptr() as *mut libc::c_void, 1, 0);
                    }

                    // Pass the token along if any other worker is still
                    // inside wait().
                    if self.waiters.fetch_sub(1, Ordering::SeqCst) > 1 {
                        self.shutdown().map_err(Error::ShutdownRelay)?;
                    }
                    return Ok(());
                }

                sink.trigger(token, event.events);
            }
        }
    }

    /// Initiate shutdown of every waiter.
    ///
    /// Re-arms the self-pipe registration and posts one token byte; the
    /// waiters relay it among themselves until the last one consumes it.
    pub fn shutdown(&self) -> io::Result<()> {
        debug!(waiters = self.waiters.load(Ordering::SeqCst), "posting shutdown token");

        let events = (libc::EPOLLIN | libc::EPOLLET | libc::EPOLLONESHOT) as u32;
        self.rearm(self.pipe[1], events, SHUTDOWN_TOKEN)?;

        let byte = [0u8; 1];
        let rc = unsafe { libc::send(self.pipe[0], byte.as_ptr() as *const libc::c_void, 1, 0) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn ctl(&self, op: libc::c_int, sfd: RawFd, events: u32, token: u64) -> io::Result<()> {
        let mut event = libc::epoll_event { events, u64: token };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, sfd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
            libc::close(self.pipe[0]);
            libc::close(self.pipe[1]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::thread;
    use std::time::Duration;

    struct NullSink;

    impl EventSink for NullSink {
        fn trigger(&self, _token: u64, _events: u32) {}
    }

    struct RecordingSink {
        seen: Mutex<Vec<(u64, u32)>>,
    }

    impl EventSink for RecordingSink {
        fn trigger(&self, token: u64, events: u32) {
            self.seen.lock().push((token, events));
        }
    }

    fn socket_pair() -> [RawFd; 2] {
        let mut sv = [0 as RawFd; 2];
        let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, sv.as_mut_ptr()) };
        assert_eq!(rc, 0);
        sv
    }

    #[test]
    fn delivers_registered_token_once() {
        let poller = Poller::new(16).unwrap();
        let sv = socket_pair();
        let events = (libc::EPOLLIN | libc::EPOLLET | libc::EPOLLONESHOT) as u32;
        poller.add(sv[1], events, 42).unwrap();

        let sink = RecordingSink {
            seen: Mutex::new(Vec::new()),
        };

        thread::scope(|s| {
            let handle = s.spawn(|| poller.wait(&sink));

            let rc = unsafe { libc::send(sv[0], b"x".as_ptr() as *const libc::c_void, 1, 0) };
            assert_eq!(rc, 1);

            thread::sleep(Duration::from_millis(100));
            poller.shutdown().unwrap();
            handle.join().unwrap().unwrap();
        });

        let seen = sink.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, 42);
        assert_ne!(seen[0].1 & libc::EPOLLIN as u32, 0);

        unsafe {
            libc::close(sv[0]);
            libc::close(sv[1]);
        }
    }

    #[test]
    fn registration_lifecycle() {
        let poller = Poller::new(16).unwrap();
        let sv = socket_pair();
        let events = (libc::EPOLLIN | libc::EPOLLET | libc::EPOLLONESHOT) as u32;

        poller.add(sv[1], events, 1).unwrap();
        // Double-add of the same descriptor is rejected by the kernel.
        assert!(poller.add(sv[1], events, 1).is_err());
        poller.rearm(sv[1], events, 2).unwrap();
        poller.remove(sv[1]).unwrap();
        // Re-arming after removal has nothing to modify.
        assert!(poller.rearm(sv[1], events, 3).is_err());

        unsafe {
            libc::close(sv[0]);
            libc::close(sv[1]);
        }
    }

    #[test]
    fn shutdown_joins_every_waiter() {
        let poller = Poller::new(16).unwrap();

        thread::scope(|s| {
            let mut handles = Vec::new();
            for _ in 0..4 {
                handles.push(s.spawn(|| poller.wait(&NullSink)));
            }

            thread::sleep(Duration::from_millis(100));
            poller.shutdown().unwrap();

            for handle in handles {
                handle.join().unwrap().unwrap();
            }
        });

        assert_eq!(poller.waiters.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn waiters_can_rejoin_after_shutdown() {
        let poller = Poller::new(16).unwrap();

        for _ in 0..2 {
            thread::scope(|s| {
                let handle = s.spawn(|| poller.wait(&NullSink));
                thread::sleep(Duration::from_millis(50));
                poller.shutdown().unwrap();
                handle.join().unwrap().unwrap();
            });
        }
    }
}
