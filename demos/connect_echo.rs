//! Echo client: connects, sends one numbered line per second, prints
//! replies. `cargo run --example connect_echo [host:port]`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axle::{EventLoop, TcpClient, TcpConnectionPtr, resolve};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let target = std::env::args().nth(1).unwrap_or_else(|| "127.0.0.1:7000".into());
    let (host, port) = target.rsplit_once(':').expect("expected host:port");
    let addr = resolve(host, port.parse().expect("bad port")).unwrap();

    let event_loop = EventLoop::new().unwrap();
    let client = TcpClient::new(event_loop.handle(), addr, "echo-client");
    client.enable_retry();
    client.set_connection_callback(Arc::new(|conn: &TcpConnectionPtr| {
        info!(peer = %conn.peer_addr(), up = conn.connected(), "connection");
    }));
    client.set_message_callback(Arc::new(|_conn, buffer, _when| {
        let data = buffer.retrieve_all_as_bytes();
        info!(reply = %String::from_utf8_lossy(&data), "echoed");
    }));
    client.connect();

    let counter = AtomicU64::new(0);
    event_loop.handle().run_every(Duration::from_secs(1), move || {
        if let Some(conn) = client.connection() {
            let n = counter.fetch_add(1, Ordering::Relaxed);
            conn.send(format!("tick {n}\n").as_bytes());
        }
    });

    event_loop.run();
}
