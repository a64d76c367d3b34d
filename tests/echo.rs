//! End-to-end server/client tests over loopback, using a 4-byte
//! big-endian length-prefixed framing.

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::time::Duration;

use axle::{Buffer, EventLoopThread, PortReuse, TcpClient, TcpConnectionPtr, TcpServer};

fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = (payload.len() as u32).to_be_bytes().to_vec();
    out.extend_from_slice(payload);
    out
}

/// Consume one complete frame from the buffer, if present.
fn take_frame(buffer: &mut Buffer) -> Option<Vec<u8>> {
    if buffer.readable_bytes() < 4 {
        return None;
    }
    let len = u32::from_be_bytes(buffer.peek()[..4].try_into().unwrap()) as usize;
    if buffer.readable_bytes() < 4 + len {
        return None;
    }
    buffer.retrieve(4);
    Some(buffer.retrieve_as_bytes(len))
}

fn start_echo_server(threads: usize) -> (EventLoopThread, TcpServer, SocketAddr) {
    let worker = EventLoopThread::start("echo-srv".into(), None).unwrap();
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let server =
        TcpServer::new(worker.handle().clone(), &addr, "echo", PortReuse::Disabled).unwrap();
    server.set_thread_num(threads);
    server.set_message_callback(Arc::new(|conn: &TcpConnectionPtr, buffer, _when| {
        while let Some(payload) = take_frame(buffer) {
            let mut reply = Buffer::new();
            reply.append(&payload);
            reply.prepend(&(payload.len() as u32).to_be_bytes());
            conn.send_buffer(&mut reply);
        }
    }));
    server.start().unwrap();
    let bound = server.local_addr().unwrap();
    (worker, server, bound)
}

#[test]
fn echoes_framed_messages_to_std_stream() {
    init_logging();
    let (_worker, _server, addr) = start_echo_server(0);

    let mut stream = std::net::TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream.write_all(&frame(b"hello")).unwrap();
    // Second message in the same burst exercises partial-frame buffering.
    stream.write_all(&frame(b"world")).unwrap();

    let mut reply = [0u8; 18];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(&reply[..9], &frame(b"hello")[..]);
    assert_eq!(&reply[9..], &frame(b"world")[..]);
}

#[test]
fn client_round_trip_and_graceful_shutdown() {
    init_logging();
    let (_srv_worker, _server, addr) = start_echo_server(1);

    let worker = EventLoopThread::start("echo-cli".into(), None).unwrap();
    let client = TcpClient::new(worker.handle().clone(), addr, "cli");

    let (reply_tx, reply_rx) = mpsc::channel::<Vec<u8>>();
    let (state_tx, state_rx) = mpsc::channel::<bool>();

    client.set_connection_callback(Arc::new(move |conn: &TcpConnectionPtr| {
        state_tx.send(conn.connected()).unwrap();
        if conn.connected() {
            conn.send(&frame(b"ping"));
        }
    }));
    client.set_message_callback(Arc::new(move |_conn, buffer, _when| {
        if let Some(payload) = take_frame(buffer) {
            reply_tx.send(payload).unwrap();
        }
    }));
    client.connect();

    assert!(state_rx.recv_timeout(Duration::from_secs(5)).unwrap());
    let reply = reply_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(reply, b"ping");

    client.disconnect();
    // Server sees our FIN, closes its side, we observe the down event.
    assert!(!state_rx.recv_timeout(Duration::from_secs(5)).unwrap());
    // The client's bookkeeping runs just after the down callback.
    let gone = (0..100).any(|_| {
        if client.connection().is_none() {
            true
        } else {
            std::thread::sleep(Duration::from_millis(10));
            false
        }
    });
    assert!(gone);
}

#[test]
fn shutdown_and_force_close_are_idempotent() {
    init_logging();
    let (_srv_worker, _server, addr) = start_echo_server(0);

    let worker = EventLoopThread::start("idem-cli".into(), None).unwrap();
    let client = TcpClient::new(worker.handle().clone(), addr, "idem");
    let (state_tx, state_rx) = mpsc::channel::<bool>();
    client.set_connection_callback(Arc::new(move |conn: &TcpConnectionPtr| {
        state_tx.send(conn.connected()).unwrap();
    }));
    client.connect();
    assert!(state_rx.recv_timeout(Duration::from_secs(5)).unwrap());

    let conn = client.connection().unwrap();
    conn.shutdown();
    conn.shutdown();
    conn.force_close();
    conn.force_close();

    // Exactly one down transition.
    assert!(!state_rx.recv_timeout(Duration::from_secs(5)).unwrap());
    assert!(state_rx.recv_timeout(Duration::from_millis(300)).is_err());
    assert!(conn.disconnected());
}

#[test]
fn write_complete_fires_after_drain() {
    init_logging();
    let (_worker, server, addr) = start_echo_server(0);

    let (tx, rx) = mpsc::channel();
    server.set_write_complete_callback(Arc::new(move |conn: &TcpConnectionPtr| {
        tx.send(conn.name().to_string()).unwrap();
    }));

    let mut stream = std::net::TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream.write_all(&frame(b"abc")).unwrap();
    let mut reply = [0u8; 7];
    stream.read_exact(&mut reply).unwrap();

    let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(name.starts_with("echo-"));
}

#[test]
fn stop_read_pauses_delivery_until_start_read() {
    init_logging();
    let worker = EventLoopThread::start("pause-srv".into(), None).unwrap();
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let server =
        TcpServer::new(worker.handle().clone(), &addr, "pause", PortReuse::Disabled).unwrap();

    let (msg_tx, msg_rx) = mpsc::channel::<Vec<u8>>();
    server.set_message_callback(Arc::new(move |_conn, buffer: &mut Buffer, _when| {
        msg_tx.send(buffer.retrieve_all_as_bytes()).unwrap();
    }));
    let (conn_tx, conn_rx) = mpsc::channel::<TcpConnectionPtr>();
    server.set_connection_callback(Arc::new(move |conn: &TcpConnectionPtr| {
        if conn.connected() {
            conn_tx.send(conn.clone()).unwrap();
        }
    }));
    server.start().unwrap();
    let bound = server.local_addr().unwrap();

    let mut stream = std::net::TcpStream::connect(bound).unwrap();
    let conn = conn_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    conn.stop_read();
    // Round-trip through the loop so the interest change is applied
    // before any bytes land.
    let (tx, rx) = mpsc::channel();
    conn.loop_handle().run_in_loop(move || tx.send(()).unwrap());
    rx.recv_timeout(Duration::from_secs(5)).unwrap();

    stream.write_all(b"while paused").unwrap();
    assert!(
        msg_rx.recv_timeout(Duration::from_millis(300)).is_err(),
        "bytes delivered while reading was stopped"
    );

    // Level-triggered: re-enabling must deliver the queued bytes.
    conn.start_read();
    let got = msg_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(got, b"while paused");
}

#[test]
fn server_drop_racing_close_destroys_connection_once() {
    init_logging();
    let worker = EventLoopThread::start("race-srv".into(), None).unwrap();
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let server =
        TcpServer::new(worker.handle().clone(), &addr, "race", PortReuse::Disabled).unwrap();
    server.set_thread_num(1);
    let (conn_tx, conn_rx) = mpsc::channel::<TcpConnectionPtr>();
    server.set_connection_callback(Arc::new(move |conn: &TcpConnectionPtr| {
        if conn.connected() {
            conn_tx.send(conn.clone()).unwrap();
        }
    }));
    server.start().unwrap();
    let bound = server.local_addr().unwrap();

    let stream = std::net::TcpStream::connect(bound).unwrap();
    let conn = conn_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // Stall the base loop so the close path's map removal stays queued
    // while the server drops and schedules its own teardown.
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    worker.handle().queue_in_loop(move || {
        let _ = gate_rx.recv_timeout(Duration::from_secs(5));
    });

    conn.force_close();
    let down = (0..200).any(|_| {
        if conn.disconnected() {
            true
        } else {
            std::thread::sleep(Duration::from_millis(5));
            false
        }
    });
    assert!(down);

    drop(server);
    gate_tx.send(()).unwrap();

    // Both teardown paths have now queued a destroy for this connection;
    // its loop must survive running them.
    let (tx, rx) = mpsc::channel();
    conn.loop_handle().run_in_loop(move || tx.send(()).unwrap());
    assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok(), "io loop died during teardown");
    drop(stream);
}

#[test]
fn high_water_mark_fires_once_per_crossing() {
    init_logging();
    let worker = EventLoopThread::start("hwm-srv".into(), None).unwrap();
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let server =
        TcpServer::new(worker.handle().clone(), &addr, "hwm", PortReuse::Disabled).unwrap();

    let crossings = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();
    let counter = crossings.clone();
    server.set_connection_callback(Arc::new(move |conn: &TcpConnectionPtr| {
        if !conn.connected() {
            return;
        }
        let counter = counter.clone();
        let tx = tx.clone();
        conn.set_high_water_mark_callback(
            Arc::new(move |_conn, size| {
                counter.fetch_add(1, Ordering::SeqCst);
                assert!(size >= 64 * 1024);
                tx.send(size).unwrap();
            }),
            64 * 1024,
        );
        // Flood a peer that is not reading; once the kernel stops
        // accepting bytes the output buffer must cross the mark exactly
        // once even though many appends land above it.
        let chunk = vec![0u8; 128 * 1024];
        for _ in 0..64 {
            conn.send(&chunk);
        }
    }));
    server.start().unwrap();
    let bound = server.local_addr().unwrap();

    let stream = std::net::TcpStream::connect(bound).unwrap();
    let size = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(size >= 64 * 1024);

    // Give any (incorrect) duplicate callbacks time to arrive.
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(crossings.load(Ordering::SeqCst), 1);
    drop(stream);
}
