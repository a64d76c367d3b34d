//! Same reactor, poll(2) backend. Lives in its own test binary because
//! the backend choice is read from the environment at loop creation.

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once, mpsc};
use std::time::Duration;

use axle::{EventLoop, EventLoopThread, PortReuse, TcpConnectionPtr, TcpServer};

fn force_poll_backend() {
    static ONCE: Once = Once::new();
    // Safe here: every test enters through this Once, so the variable is
    // set exactly once before any loop (or other thread) exists.
    ONCE.call_once(|| unsafe { std::env::set_var("AXLE_USE_POLL", "1") });
}

#[test]
fn poll_backend_serves_echo_and_timers() {
    force_poll_backend();

    let worker = EventLoopThread::start("poll-srv".into(), None).unwrap();
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let server =
        TcpServer::new(worker.handle().clone(), &addr, "poll-echo", PortReuse::Disabled).unwrap();
    server.set_message_callback(Arc::new(|conn: &TcpConnectionPtr, buffer, _when| {
        let data = buffer.retrieve_all_as_bytes();
        conn.send(&data);
    }));
    server.start().unwrap();
    let bound = server.local_addr().unwrap();

    let mut stream = std::net::TcpStream::connect(bound).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream.write_all(b"over poll").unwrap();
    let mut reply = [0u8; 9];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"over poll");

    // Timers ride the same backend via timerfd.
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();
    let ticks = Arc::new(AtomicUsize::new(0));
    let t = ticks.clone();
    handle.run_after(Duration::from_millis(10), move || {
        t.fetch_add(1, Ordering::SeqCst);
    });
    let quitter = handle.clone();
    handle.run_after(Duration::from_millis(40), move || quitter.quit());
    event_loop.run();
    assert_eq!(ticks.load(Ordering::SeqCst), 1);
}

#[test]
fn poll_backend_parks_and_unparks_stopped_readers() {
    force_poll_backend();

    let worker = EventLoopThread::start("poll-pause".into(), None).unwrap();
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let server =
        TcpServer::new(worker.handle().clone(), &addr, "poll-pause", PortReuse::Disabled).unwrap();

    let (msg_tx, msg_rx) = mpsc::channel::<Vec<u8>>();
    server.set_message_callback(Arc::new(move |_conn, buffer, _when| {
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

    // Empty interest parks the pollfd slot; the queued bytes must not
    // surface until the slot is live again.
    conn.stop_read();
    let (tx, rx) = mpsc::channel();
    conn.loop_handle().run_in_loop(move || tx.send(()).unwrap());
    rx.recv_timeout(Duration::from_secs(5)).unwrap();

    stream.write_all(b"parked").unwrap();
    assert!(msg_rx.recv_timeout(Duration::from_millis(300)).is_err());

    conn.start_read();
    assert_eq!(msg_rx.recv_timeout(Duration::from_secs(5)).unwrap(), b"parked");
}
