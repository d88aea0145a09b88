//! Scenario: an echo `TcpListener` serving one real loopback client —
//! admission control, the accept/read-loop protocol, and disconnect
//! notification all exercised end-to-end.

mod util;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use svckit::registry::SocketRegistry;
use svckit::scheduler::Scheduler;
use svckit::tcp::TcpListener;

#[test]
fn echoes_one_request_then_notifies_disconnect() {
    util::init_logging();

    let scheduler = Scheduler::create(32, 8).unwrap();
    let registry = Arc::new(SocketRegistry::new());
    let port = util::random_high_port();

    let disconnected = Arc::new(AtomicBool::new(false));
    let disconnected_cl = disconnected.clone();

    let listener: TcpListener<()> = TcpListener::init(
        &scheduler,
        registry.clone(),
        port,
        4096,
        // Admit every connection and arm the read loop.
        Box::new(|_listener, _handle, _ip, _port| true),
        // Echo whatever was sent back to the same client, then end the
        // transaction.
        Box::new(|listener, handle, data| {
            let _ = listener.send(handle, data);
            true
        }),
    )
    .unwrap();
    listener.set_on_disconnected(Box::new(move |_listener, _handle| {
        disconnected_cl.store(true, Ordering::SeqCst);
    }));

    scheduler.start_thread().unwrap();
    std::thread::sleep(Duration::from_millis(50));

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.write_all(b"hello").unwrap();

    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello");

    std::thread::sleep(Duration::from_millis(150));
    assert!(disconnected.load(Ordering::SeqCst), "on_disconnected never fired after transaction completed");

    listener.stop();
    scheduler.stop();
}

#[test]
fn on_waiting_rejection_keeps_connection_pending_without_admitting() {
    util::init_logging();

    let scheduler = Scheduler::create(32, 8).unwrap();
    let registry = Arc::new(SocketRegistry::new());
    let port = util::random_high_port();

    let admitted = Arc::new(AtomicUsize::new(0));
    let admitted_cl = admitted.clone();
    let gate_open = Arc::new(AtomicBool::new(false));
    let gate_open_cl = gate_open.clone();

    let listener: TcpListener<()> = TcpListener::init(
        &scheduler,
        registry,
        port,
        4096,
        Box::new(move |_listener, _handle, _ip, _port| {
            admitted_cl.fetch_add(1, Ordering::SeqCst);
            true
        }),
        Box::new(|_listener, _handle, _data| false),
    )
    .unwrap();
    listener.set_on_waiting(Box::new(move |_listener| gate_open_cl.load(Ordering::SeqCst)));

    scheduler.start_thread().unwrap();
    std::thread::sleep(Duration::from_millis(50));

    // The gate is closed: connecting should not be admitted yet, though the
    // TCP-level connect itself (into the kernel's listen backlog) still
    // succeeds since nothing has rejected it at the socket layer.
    let _pending = TcpStream::connect(("127.0.0.1", port)).unwrap();
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(admitted.load(Ordering::SeqCst), 0, "on_waiting rejected every round; on_connected must not have run");

    gate_open.store(true, Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(admitted.load(Ordering::SeqCst), 1, "accept should proceed once on_waiting admits");

    listener.stop();
    scheduler.stop();
}

#[test]
fn stop_drains_clients_without_notifying_disconnected() {
    util::init_logging();

    let scheduler = Scheduler::create(32, 8).unwrap();
    let registry = Arc::new(SocketRegistry::new());
    let port = util::random_high_port();

    let disconnected = Arc::new(Mutex::new(0usize));
    let disconnected_cl = disconnected.clone();

    let listener: TcpListener<()> = TcpListener::init(
        &scheduler,
        registry,
        port,
        4096,
        Box::new(|_listener, _handle, _ip, _port| true),
        Box::new(|_listener, _handle, _data| false),
    )
    .unwrap();
    listener.set_on_disconnected(Box::new(move |_listener, _handle| {
        *disconnected_cl.lock().unwrap() += 1;
    }));

    scheduler.start_thread().unwrap();
    std::thread::sleep(Duration::from_millis(50));

    let _client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    std::thread::sleep(Duration::from_millis(100));

    // stop()'s contract: the client list is drained, but on_disconnected
    // is a notification about an *unplanned* teardown, not about the
    // listener shutting down — it must stay silent here.
    listener.stop();
    assert_eq!(*disconnected.lock().unwrap(), 0);

    scheduler.stop();
}
