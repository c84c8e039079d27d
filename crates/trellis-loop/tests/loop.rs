//! Loop integration: readiness, the pending self-notify, automatic child
//! adoption and cross-thread ipc fan-in.

use std::time::{Duration, Instant};

use trellis_channel::testing::{collect, ECHO_IMPL};
use trellis_channel::Context;
use trellis_loop::Loop;
use trellis_types::{DCaps, Msg, MsgMask, State};

fn trace_init() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn drive(event_loop: &Loop, timeout: Duration, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !done() {
        assert!(Instant::now() < deadline, "loop did not converge in time");
        if let Some(ready) = event_loop.poll(Duration::from_millis(10)).unwrap() {
            let _ = ready.process();
        }
    }
}

#[test]
fn process_set_drives_lifecycle() {
    let ctx = Context::default();
    ctx.register(&ECHO_IMPL, None).unwrap();
    let c = ctx.new_channel("echo://;name=loop-echo").unwrap();

    let event_loop = Loop::new().unwrap();
    event_loop.add(&c.handle()).unwrap();
    assert_eq!(event_loop.len(), 1);

    c.open("").unwrap();
    assert_eq!(c.state(), State::Opening);
    // echo carries PROCESS, so one round moves it along
    event_loop.process().unwrap();
    assert_eq!(c.state(), State::Active);
    assert!(event_loop.process().unwrap_err().is_again());
}

#[test]
fn pending_channel_wakes_poll_immediately() {
    let ctx = Context::default();
    let server = ctx.new_channel("mem://;name=pend-server").unwrap();
    let client = ctx
        .new_channel("mem://;name=pend-client;master=pend-server")
        .unwrap();
    server.open("").unwrap();
    client.open("").unwrap();

    let event_loop = Loop::new().unwrap();
    event_loop.add(&server.handle()).unwrap();
    let seen = collect(&server.handle(), MsgMask::DATA);

    client.post(&Msg::data(11, b"buffered")).unwrap();
    assert!(server.dcaps().contains(DCaps::PENDING));

    // the self-notify is armed: a long timeout returns at once
    let start = Instant::now();
    let ready = event_loop.poll(Duration::from_secs(5)).unwrap();
    assert!(start.elapsed() < Duration::from_millis(500));
    assert!(ready.is_none(), "pending work is drained inside poll");

    assert_eq!(seen.msgs().len(), 1);
    assert_eq!(seen.msgs()[0].seq, 11);
    assert!(!server.dcaps().contains(DCaps::PENDING));

    // disarmed again: the next poll actually waits out its timeout
    let start = Instant::now();
    let ready = event_loop.poll(Duration::from_millis(50)).unwrap();
    assert!(ready.is_none());
    assert!(start.elapsed() >= Duration::from_millis(40));
}

#[test]
fn destroy_removes_from_loop() {
    let ctx = Context::default();
    ctx.register(&ECHO_IMPL, None).unwrap();
    let c = ctx.new_channel("echo://;name=loop-gone").unwrap();

    let event_loop = Loop::new().unwrap();
    event_loop.add(&c.handle()).unwrap();
    assert_eq!(event_loop.len(), 1);

    drop(c);
    assert_eq!(event_loop.len(), 0, "Destroy state deletes the channel");
}

#[test]
fn suspended_channel_is_quiescent() {
    let ctx = Context::default();
    ctx.register(&ECHO_IMPL, None).unwrap();
    let c = ctx.new_channel("echo://;name=loop-susp").unwrap();

    let event_loop = Loop::new().unwrap();
    event_loop.add(&c.handle()).unwrap();
    c.open("").unwrap();
    event_loop.process().unwrap();
    assert_eq!(c.state(), State::Active);

    c.suspend();
    assert!(event_loop.process().unwrap_err().is_again());
    c.resume();
    assert!(event_loop.process().unwrap_err().is_again());
}

#[test]
fn tcp_children_are_adopted_automatically() {
    trace_init();
    let ctx = Context::default();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("loop.sock");

    let server = ctx
        .new_channel(&format!("tcp://{};mode=server;name=loop-srv", path.display()))
        .unwrap();
    let event_loop = Loop::new().unwrap();
    // adopt before open so child announcements reach the loop
    event_loop.add(&server.handle()).unwrap();
    let seen = collect(&server.handle(), MsgMask::DATA);

    server.open("").unwrap();
    assert_eq!(event_loop.len(), 2, "listening socket adopted");

    let client = ctx
        .new_channel(&format!("tcp://{};mode=client;name=loop-cli", path.display()))
        .unwrap();
    client.open("").unwrap();
    client.post(&Msg::data(21, b"hello")).unwrap();

    drive(&event_loop, Duration::from_secs(5), || {
        !seen.msgs().is_empty()
    });
    assert_eq!(event_loop.len(), 3, "connection child adopted");
    assert_eq!(seen.msgs()[0].seq, 21);
    assert_eq!(seen.msgs()[0].data, b"hello");
}

#[test]
fn ipc_fan_in_across_threads() {
    trace_init();
    let ctx = Context::default();
    let server = ctx.new_channel("ipc://;name=loop-ipc;mode=server").unwrap();
    let event_loop = Loop::new().unwrap();
    event_loop.add(&server.handle()).unwrap();
    server.open("").unwrap();
    let seen = collect(&server.handle(), MsgMask::DATA);

    let client = ctx
        .new_channel("ipc://;name=loop-ipc-cli;master=loop-ipc")
        .unwrap();

    let producer = std::thread::spawn(move || {
        client.open("").unwrap();
        for seq in 0..3 {
            client
                .post(&Msg::data(seq, format!("msg-{seq}").as_bytes()))
                .unwrap();
        }
        client
    });

    drive(&event_loop, Duration::from_secs(5), || seen.msgs().len() == 3);
    let client = producer.join().unwrap();

    let msgs = seen.msgs();
    assert_eq!(
        msgs.iter().map(|m| m.seq).collect::<Vec<_>>(),
        vec![0, 1, 2],
        "per-client order is preserved"
    );
    let addr = msgs[0].addr;
    assert!(msgs.iter().all(|m| m.addr == addr));

    // reply routes back by address
    let on_client = collect(&client.handle(), MsgMask::DATA);
    let mut reply = Msg::data(100, b"ack");
    reply.addr = addr;
    server.post(&reply).unwrap();
    let deadline = Instant::now() + Duration::from_secs(1);
    while on_client.msgs().is_empty() {
        assert!(Instant::now() < deadline);
        let _ = client.process();
    }
    assert_eq!(on_client.msgs()[0].seq, 100);
}
