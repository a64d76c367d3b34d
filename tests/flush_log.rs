//! A flood drained under backpressure is normal operation and must not
//! produce error-level log events. Lives in its own test binary because
//! it installs the process-global subscriber.

use std::io::Read;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::time::Duration;

use axle::{EventLoopThread, PortReuse, TcpConnectionPtr, TcpServer};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Registry;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

struct ErrorCounter(Arc<AtomicUsize>);

impl<S: Subscriber> Layer<S> for ErrorCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == Level::ERROR {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[test]
fn drain_under_backpressure_logs_no_errors() {
    let errors = Arc::new(AtomicUsize::new(0));
    tracing::subscriber::set_global_default(
        Registry::default().with(ErrorCounter(errors.clone())),
    )
    .unwrap();

    const CHUNK: usize = 256 * 1024;
    const CHUNKS: usize = 16;

    let worker = EventLoopThread::start("flood-srv".into(), None).unwrap();
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let server =
        TcpServer::new(worker.handle().clone(), &addr, "flood", PortReuse::Disabled).unwrap();
    let (down_tx, down_rx) = mpsc::channel::<()>();
    server.set_connection_callback(Arc::new(move |conn: &TcpConnectionPtr| {
        if conn.connected() {
            let chunk = vec![0x5a; CHUNK];
            for _ in 0..CHUNKS {
                conn.send(&chunk);
            }
        } else {
            down_tx.send(()).unwrap();
        }
    }));
    server.start().unwrap();
    let bound = server.local_addr().unwrap();

    let mut stream = std::net::TcpStream::connect(bound).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    // Let the kernel buffers fill so the drain runs against a writable
    // socket that keeps going back to sleep.
    std::thread::sleep(Duration::from_millis(100));

    let mut remaining = CHUNK * CHUNKS;
    let mut buf = vec![0u8; 64 * 1024];
    while remaining > 0 {
        let n = stream.read(&mut buf).unwrap();
        assert!(n > 0, "peer closed mid-flood");
        remaining -= n;
    }

    // A clean peer close must stay quiet too.
    drop(stream);
    down_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    assert_eq!(errors.load(Ordering::SeqCst), 0, "drain produced error-level events");
}
