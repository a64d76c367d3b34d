//! Connector behavior: backoff while the server is away, reconnect
//! after an established connection drops.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::time::{Duration, Instant};

use axle::{EventLoopThread, PortReuse, TcpClient, TcpConnectionPtr, TcpServer};

fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Reserve a loopback port, then free it so the client's first attempts
/// are refused.
fn vacant_port() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

#[test]
fn retries_until_server_appears() {
    init_logging();
    let addr = vacant_port();

    let cli_worker = EventLoopThread::start("retry-cli".into(), None).unwrap();
    let client = TcpClient::new(cli_worker.handle().clone(), addr, "retry");
    let (tx, rx) = mpsc::channel();
    client.set_connection_callback(Arc::new(move |conn: &TcpConnectionPtr| {
        if conn.connected() {
            tx.send(Instant::now()).unwrap();
        }
    }));
    let started = Instant::now();
    client.connect();

    // First attempt is refused; let at least one backoff period elapse
    // before the server shows up.
    std::thread::sleep(Duration::from_millis(200));
    let srv_worker = EventLoopThread::start("retry-srv".into(), None).unwrap();
    let server =
        TcpServer::new(srv_worker.handle().clone(), &addr, "late", PortReuse::Disabled).unwrap();
    server.start().unwrap();

    let connected_at = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    // The retry that succeeded cannot have run before the first 500ms
    // backoff expired.
    assert!(connected_at.duration_since(started) >= Duration::from_millis(450));
    assert!(client.connection().is_some());
}

#[test]
fn reconnects_when_peer_closes() {
    init_logging();
    let srv_worker = EventLoopThread::start("kick-srv".into(), None).unwrap();
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let server =
        TcpServer::new(srv_worker.handle().clone(), &addr, "kick", PortReuse::Disabled).unwrap();

    // Kick the first connection shortly after it lands.
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    server.set_connection_callback(Arc::new(move |conn: &TcpConnectionPtr| {
        if conn.connected() && counter.fetch_add(1, Ordering::SeqCst) == 0 {
            let victim = conn.clone();
            conn.loop_handle().run_after(Duration::from_millis(50), move || {
                victim.force_close();
            });
        }
    }));
    server.start().unwrap();
    let bound = server.local_addr().unwrap();

    let cli_worker = EventLoopThread::start("kick-cli".into(), None).unwrap();
    let client = TcpClient::new(cli_worker.handle().clone(), bound, "kick");
    client.enable_retry();
    let (tx, rx) = mpsc::channel();
    client.set_connection_callback(Arc::new(move |conn: &TcpConnectionPtr| {
        tx.send(conn.connected()).unwrap();
    }));
    client.connect();

    // Up, down (kicked), and up again on the fresh connection.
    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    assert!(!rx.recv_timeout(Duration::from_secs(5)).unwrap());
    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    assert_eq!(accepted.load(Ordering::SeqCst), 2);

    client.stop();
}

#[test]
fn stop_abandons_pending_connect() {
    init_logging();
    let addr = vacant_port();

    let worker = EventLoopThread::start("stop-cli".into(), None).unwrap();
    let client = TcpClient::new(worker.handle().clone(), addr, "stop");
    let (tx, rx) = mpsc::channel();
    client.set_connection_callback(Arc::new(move |conn: &TcpConnectionPtr| {
        tx.send(conn.connected()).unwrap();
    }));
    client.connect();
    std::thread::sleep(Duration::from_millis(100));
    client.stop();

    // Even if the server appears now, the abandoned connector must not
    // complete the connection.
    let srv_worker = EventLoopThread::start("stop-srv".into(), None).unwrap();
    let server =
        TcpServer::new(srv_worker.handle().clone(), &addr, "late", PortReuse::Disabled).unwrap();
    server.start().unwrap();

    assert!(rx.recv_timeout(Duration::from_secs(2)).is_err());
    assert!(client.connection().is_none());
}
