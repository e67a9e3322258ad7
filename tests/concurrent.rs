//! Concurrent accept and echo across a multi-worker pool: no lost
//! connections, no duplicated live slot identities, no stray errors.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use myriad::{Config, Server};

fn available_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn wait_for(counter: &AtomicUsize, expected: usize, deadline: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if counter.load(Ordering::SeqCst) >= expected {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn many_clients_echo_concurrently() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 50;
    const TOTAL: usize = THREADS * PER_THREAD;

    let accepted = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicUsize::new(0));
    let errored = Arc::new(AtomicUsize::new(0));
    // Slot identities of currently-live connections; a duplicate insert
    // means two live connections shared a slot.
    let live = Arc::new(Mutex::new(HashSet::new()));
    let duplicates = Arc::new(AtomicUsize::new(0));

    let server = Arc::new(
        Server::new(Config {
            workers: 4,
            max_clients: 512,
            max_events: 1024,
            ..Config::default()
        })
        .unwrap(),
    );

    {
        let accepted = Arc::clone(&accepted);
        let live = Arc::clone(&live);
        let duplicates = Arc::clone(&duplicates);
        server.on_accepted(move |session| {
            if !live.lock().insert(session.uuid()) {
                duplicates.fetch_add(1, Ordering::SeqCst);
            }
            accepted.fetch_add(1, Ordering::SeqCst);
        });
    }
    server.on_data(|session, data| {
        session.write(data);
        session.rearm();
    });
    {
        let closed = Arc::clone(&closed);
        let live = Arc::clone(&live);
        server.on_closed(move |session| {
            live.lock().remove(&session.uuid());
            closed.fetch_add(1, Ordering::SeqCst);
        });
    }
    {
        let errored = Arc::clone(&errored);
        server.on_error(move |_| {
            errored.fetch_add(1, Ordering::SeqCst);
        });
    }

    let port = available_port();
    server.bind(port).unwrap();
    let runner = {
        let server = Arc::clone(&server);
        thread::spawn(move || server.run())
    };
    thread::sleep(Duration::from_millis(200));

    let mut drivers = Vec::new();
    for t in 0..THREADS {
        drivers.push(thread::spawn(move || {
            for i in 0..PER_THREAD {
                let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
                client
                    .set_read_timeout(Some(Duration::from_secs(5)))
                    .unwrap();

                let payload = format!("thread {t} connection {i}");
                client.write_all(payload.as_bytes()).unwrap();

                let mut buf = vec![0u8; payload.len()];
                client.read_exact(&mut buf).unwrap();
                assert_eq!(buf, payload.as_bytes());
            }
        }));
    }
    for driver in drivers {
        driver.join().unwrap();
    }

    assert!(wait_for(&accepted, TOTAL, Duration::from_secs(10)));
    assert_eq!(accepted.load(Ordering::SeqCst), TOTAL);
    assert_eq!(duplicates.load(Ordering::SeqCst), 0);

    // All clients were dropped by their driver threads.
    assert!(wait_for(&closed, TOTAL, Duration::from_secs(10)));
    assert_eq!(errored.load(Ordering::SeqCst), 0);
    assert!(live.lock().is_empty());

    server.stop().unwrap();
    runner.join().unwrap().unwrap();
}
