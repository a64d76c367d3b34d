//! Multi-threaded echo server. `cargo run --example echo_server [port]`.

use std::sync::Arc;

use axle::{EventLoop, PortReuse, TcpConnectionPtr, TcpServer};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let port = std::env::args()
        .nth(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or(7000u16);
    let addr = format!("0.0.0.0:{port}").parse().unwrap();

    let event_loop = EventLoop::new().unwrap();
    let server =
        TcpServer::new(event_loop.handle(), &addr, "echo", PortReuse::Disabled).unwrap();
    server.set_thread_num(4);
    server.set_connection_callback(Arc::new(|conn: &TcpConnectionPtr| {
        info!(peer = %conn.peer_addr(), up = conn.connected(), "connection");
    }));
    server.set_message_callback(Arc::new(|conn: &TcpConnectionPtr, buffer, _when| {
        let data = buffer.retrieve_all_as_bytes();
        conn.send(&data);
    }));
    server.start().unwrap();
    info!(%addr, "echo server listening");
    event_loop.run();
}
