//! Minimal echo server.
//!
//! ```text
//! cargo run --example echo -- 7878
//! ```

use myriad::{Config, Server};
use tracing::info;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(7878);

    let config = Config {
        workers: 4,
        max_clients: 10_000,
        idle_timeout_ms: 30_000,
        ..Config::default()
    };

    let server = Server::new(config).expect("failed to create server");

    server.on_accepted(|session| {
        info!(uuid = session.uuid(), "client connected");
    });
    server.on_data(|session, data| {
        session.write(data);
        session.rearm();
    });
    server.on_closed(|session| {
        info!(uuid = session.uuid(), "client gone");
    });

    server.bind(port).expect("failed to bind");
    info!(port, "echo server running");

    server.run().expect("server failed");
}
