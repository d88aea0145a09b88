//! Scenarios: asynchronous `TcpClient::connect` against a real loopback
//! peer, and against an unroutable TEST-NET-1 address to force the
//! deadline path.

mod util;

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use svckit::error::CONNECT_TIMEOUT_ERRCODE;
use svckit::registry::SocketRegistry;
use svckit::scheduler::Scheduler;
use svckit::tcp::{TcpClient, TcpListener};

#[test]
fn connect_succeeds_against_local_listener_and_exchanges_data() {
    util::init_logging();

    let scheduler = Scheduler::create(16, 16).unwrap();
    let registry = Arc::new(SocketRegistry::new());
    let port = util::random_high_port();

    let received = Arc::new(AtomicUsize::new(0));
    let received_cl = received.clone();

    let listener: TcpListener<()> = TcpListener::init(
        &scheduler,
        registry,
        port,
        4096,
        Box::new(|_listener, _handle, _ip, _port| true),
        Box::new(move |_listener, _handle, data| {
            received_cl.fetch_add(data.len(), Ordering::SeqCst);
            false
        }),
    )
    .unwrap();

    scheduler.start_thread().unwrap();
    std::thread::sleep(Duration::from_millis(50));

    let client: TcpClient<()> = TcpClient::init(&scheduler, 4096, ()).unwrap();
    let errcode = Arc::new(AtomicI32::new(i32::MIN));
    let errcode_cl = errcode.clone();

    let started = client.connect(
        Ipv4Addr::LOCALHOST,
        port,
        Duration::from_secs(2),
        Box::new(move |_client, _user, err| {
            errcode_cl.store(err, Ordering::SeqCst);
        }),
        Box::new(|_client, _user, _data| false),
        Box::new(|_client, _user, _reason| {}),
    );
    assert!(started, "connect() to a reachable local address must start an attempt");

    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(errcode.load(Ordering::SeqCst), 0, "on_connected must report success (errcode 0)");

    client.send(b"ping").unwrap();
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(received.load(Ordering::SeqCst), 4);

    client.disconnect();
    listener.stop();
    scheduler.stop();
}

#[test]
fn connect_times_out_against_unroutable_test_net_address() {
    util::init_logging();

    let scheduler = Scheduler::create(8, 8).unwrap();
    scheduler.start_thread().unwrap();

    let client: TcpClient<()> = TcpClient::init(&scheduler, 4096, ()).unwrap();
    let errcode = Arc::new(AtomicI32::new(i32::MIN));
    let errcode_cl = errcode.clone();

    // 192.0.2.1 is TEST-NET-1 (RFC 5737): guaranteed non-routable, so the
    // connect attempt should neither succeed nor fail fast — it should sit
    // until the deadline and be reported as CONNECT_TIMEOUT_ERRCODE.
    let started = client.connect(
        Ipv4Addr::new(192, 0, 2, 1),
        9,
        Duration::from_millis(500),
        Box::new(move |_client, _user, err| {
            errcode_cl.store(err, Ordering::SeqCst);
        }),
        Box::new(|_client, _user, _data| false),
        Box::new(|_client, _user, _reason| {}),
    );

    if started {
        std::thread::sleep(Duration::from_millis(1200));
        let got = errcode.load(Ordering::SeqCst);
        assert_eq!(got, CONNECT_TIMEOUT_ERRCODE, "expected the deadline sentinel, got {got}");
    }
    // If the attempt could not even be started (e.g. no route to host is
    // reported synchronously in this network environment), `on_connected`
    // is never invoked per its documented contract — nothing further to
    // assert in that case.

    scheduler.stop();
}

#[test]
fn disconnect_is_idempotent_and_fires_on_closed_exactly_once() {
    util::init_logging();

    let scheduler = Scheduler::create(16, 16).unwrap();
    let registry = Arc::new(SocketRegistry::new());
    let port = util::random_high_port();

    let listener: TcpListener<()> = TcpListener::init(
        &scheduler,
        registry,
        port,
        4096,
        Box::new(|_listener, _handle, _ip, _port| true),
        Box::new(|_listener, _handle, _data| false),
    )
    .unwrap();

    scheduler.start_thread().unwrap();
    std::thread::sleep(Duration::from_millis(50));

    let client: TcpClient<()> = TcpClient::init(&scheduler, 4096, ()).unwrap();
    let closes = Arc::new(AtomicUsize::new(0));
    let closes_cl = closes.clone();

    client.connect(
        Ipv4Addr::LOCALHOST,
        port,
        Duration::from_secs(2),
        Box::new(|_client, _user, _err| {}),
        Box::new(|_client, _user, _data| false),
        Box::new(move |_client, _user, _reason| {
            closes_cl.fetch_add(1, Ordering::SeqCst);
        }),
    );
    std::thread::sleep(Duration::from_millis(150));

    client.disconnect();
    client.disconnect();
    client.disconnect();

    assert_eq!(closes.load(Ordering::SeqCst), 1, "on_closed must fire exactly once across repeated disconnect() calls");

    listener.stop();
    scheduler.stop();
}
