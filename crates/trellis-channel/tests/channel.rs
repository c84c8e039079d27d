//! End-to-end channel tests: registry round trips, alias resolution,
//! lifecycle, init replacement, prefix stacking, suspension and the
//! unix-socket server.

use std::time::Duration;

use trellis_channel::testing::{collect, poll_for, MsgCollector, ECHO_IMPL};
use trellis_channel::{
    builtin, callback_fn, Channel, ChannelData, ChannelRef, Context, Impl, InitResult, Prefix,
};
use trellis_types::{Caps, DCaps, Error, Msg, MsgMask, Result, State, Url};

static PREFIX_IMPL: Impl = Impl {
    name: "prefix+",
    new_data: || Box::new(Prefix::<()>::default()),
};

fn trace_init() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn ctx_with_echo() -> Context {
    let ctx = Context::default();
    ctx.register(&ECHO_IMPL, None).unwrap();
    ctx
}

/// Drives open → Active → post → close → Closed, checking every
/// intermediate state; for prefix stacks the child does the processing.
fn exercise_channel(ctx: &Context, url: &str, impl_: &'static Impl, expected_url: &str) {
    let process = |c: &Channel| -> Result<()> {
        match c.children().first() {
            Some(child) => child.process(),
            None => c.process(),
        }
    };

    let c = ctx.new_channel(url).unwrap();
    assert!(Impl::same(c.impl_ref(), impl_));
    assert_eq!(c.state(), State::Closed);

    c.open("").unwrap();
    assert_eq!(c.state(), State::Opening);
    process(&c).unwrap();
    assert_eq!(c.state(), State::Active);
    assert!(process(&c).unwrap_err().is_again());

    let cfg = c.config();
    assert_eq!(cfg.get("state").as_deref(), Some("Active"));
    assert_eq!(cfg.get("url").as_deref(), Some(expected_url));

    let seen = collect(&c.handle(), MsgMask::DATA);
    c.post(&Msg::data(100, b"")).unwrap();
    assert_eq!(seen.msgs().len(), 1);
    assert_eq!(seen.msgs()[0].seq, 100);

    c.close(false).unwrap();
    assert_eq!(c.state(), State::Closing);
    process(&c).unwrap();
    assert_eq!(c.state(), State::Closed);
}

#[test]
fn register_and_unregister() {
    let ctx = Context::default();

    assert!(ctx.new_channel("echo://;name=echo").is_err());
    ctx.register(&ECHO_IMPL, None).unwrap();
    assert!(matches!(
        ctx.register(&ECHO_IMPL, None).unwrap_err(),
        Error::AlreadyExists(_)
    ));

    assert!(ctx.new_channel("other://;name=other").is_err());
    ctx.register(&ECHO_IMPL, Some("other")).unwrap();
    let c = ctx.new_channel("other://;name=other").unwrap();
    drop(c);

    ctx.unregister(&ECHO_IMPL, Some("other")).unwrap();
    assert!(ctx.new_channel("other://;name=other").is_err());
    let c = ctx.new_channel("echo://;name=echo").unwrap();
    drop(c);

    assert!(ctx.new_channel("prefix+echo://;name=p").is_err());
    ctx.register(&PREFIX_IMPL, None).unwrap();
    let c = ctx.new_channel("prefix+echo://;name=p").unwrap();
    drop(c);

    ctx.unregister(&ECHO_IMPL, None).unwrap();
    assert!(matches!(
        ctx.unregister(&ECHO_IMPL, None).unwrap_err(),
        Error::NotFound(_)
    ));
}

#[test]
fn unregister_refuses_foreign_entries() {
    let ctx = ctx_with_echo();
    // different impl under the same name
    assert!(matches!(
        ctx.unregister(&PREFIX_IMPL, Some("echo")).unwrap_err(),
        Error::Invalid(_)
    ));
    // aliases are not impls
    ctx.alias_register("echo-alias", Url::parse("echo://").unwrap())
        .unwrap();
    assert!(matches!(
        ctx.unregister(&ECHO_IMPL, Some("echo-alias")).unwrap_err(),
        Error::Invalid(_)
    ));
}

#[test]
fn echo_lifecycle() {
    let ctx = ctx_with_echo();
    exercise_channel(&ctx, "echo://;name=echo", &ECHO_IMPL, "echo://;name=echo");
}

#[test]
fn prefix_over_echo() {
    let ctx = ctx_with_echo();
    ctx.register(&PREFIX_IMPL, None).unwrap();
    exercise_channel(
        &ctx,
        "prefix+echo://;name=echo",
        &PREFIX_IMPL,
        "prefix+echo://;name=echo",
    );
}

#[test]
fn prefix_child_is_named_and_internal() {
    let ctx = ctx_with_echo();
    ctx.register(&PREFIX_IMPL, None).unwrap();
    let c = ctx.new_channel("prefix+echo://;name=p").unwrap();

    let children = c.children();
    assert_eq!(children.len(), 1);
    let child = &children[0];
    assert_eq!(child.name(), "p/prefix");
    assert!(Impl::same(child.impl_ref(), &ECHO_IMPL));
    assert!(child.caps().contains(Caps::CUSTOM));
    // internal channels stay out of the name index
    assert!(ctx.get("p/prefix").is_none());
}

#[test]
fn alias_of_echo() {
    let ctx = Context::default();

    // collides with a built-in impl name
    assert!(matches!(
        ctx.alias_register("null", Url::parse("zero://").unwrap())
            .unwrap_err(),
        Error::AlreadyExists(_)
    ));
    // target protocol not registered yet
    assert!(matches!(
        ctx.alias_register("alias", Url::parse("echo://").unwrap())
            .unwrap_err(),
        Error::NotFound(_)
    ));
    // reserved properties
    assert!(matches!(
        ctx.alias_register("alias", Url::parse("echo://;name=x").unwrap())
            .unwrap_err(),
        Error::Invalid(_)
    ));
    assert!(matches!(
        ctx.alias_register("alias", Url::parse("echo://;tll.host=x").unwrap())
            .unwrap_err(),
        Error::Invalid(_)
    ));

    ctx.register(&ECHO_IMPL, None).unwrap();
    // a host segment is fine: aliases may carry a default target
    ctx.alias_register("hosted", Url::parse("echo://fallback-host").unwrap())
        .unwrap();
    ctx.alias_register("alias", Url::parse("echo://").unwrap())
        .unwrap();
    assert!(matches!(
        ctx.alias_register("alias", Url::parse("echo://").unwrap())
            .unwrap_err(),
        Error::AlreadyExists(_)
    ));

    exercise_channel(&ctx, "alias://;name=echo", &ECHO_IMPL, "echo://;name=echo");
}

#[test]
fn alias_unregister_checks() {
    let ctx = ctx_with_echo();
    ctx.alias_register("alias", Url::parse("echo://").unwrap())
        .unwrap();

    // impls are off limits
    assert!(matches!(
        ctx.alias_unregister("echo", &Url::parse("echo://").unwrap())
            .unwrap_err(),
        Error::Invalid(_)
    ));
    // protocol must match
    assert!(matches!(
        ctx.alias_unregister("alias", &Url::parse("null://").unwrap())
            .unwrap_err(),
        Error::Invalid(_)
    ));
    ctx.alias_unregister("alias", &Url::parse("echo://").unwrap())
        .unwrap();
    assert!(matches!(
        ctx.alias_unregister("alias", &Url::parse("echo://").unwrap())
            .unwrap_err(),
        Error::NotFound(_)
    ));
}

#[test]
fn alias_prefix_composition() {
    let ctx = ctx_with_echo();
    ctx.register(&PREFIX_IMPL, None).unwrap();

    ctx.alias_register("alias+", Url::parse("prefix+://").unwrap())
        .unwrap();
    ctx.alias_register("other", Url::parse("echo://").unwrap())
        .unwrap();

    exercise_channel(
        &ctx,
        "alias+other://;name=echo",
        &PREFIX_IMPL,
        "prefix+other://;name=echo",
    );
}

#[test]
fn alias_indirect_chain() {
    let ctx = ctx_with_echo();
    ctx.register(&PREFIX_IMPL, None).unwrap();

    ctx.alias_register("other+", Url::parse("prefix+://").unwrap())
        .unwrap();
    ctx.alias_register("alias", Url::parse("other+echo://").unwrap())
        .unwrap();

    exercise_channel(
        &ctx,
        "alias://;name=echo",
        &PREFIX_IMPL,
        "prefix+echo://;name=echo",
    );
}

#[test]
fn alias_resolution_is_deterministic() {
    let ctx = ctx_with_echo();
    ctx.alias_register("alias", Url::parse("echo://;extra=1").unwrap())
        .unwrap();
    let mut first = Url::parse("alias://;name=a").unwrap();
    let mut second = Url::parse("alias://;name=a").unwrap();
    let impl_a = ctx.lookup(&mut first).unwrap();
    let impl_b = ctx.lookup(&mut second).unwrap();
    assert!(Impl::same(impl_a, impl_b));
    assert_eq!(first, second);
    assert_eq!(first.to_string(), "echo://;extra=1;name=a");
}

#[test]
fn alias_duplicate_key_rejected_at_resolution() {
    let ctx = ctx_with_echo();
    ctx.alias_register("alias", Url::parse("echo://;extra=1").unwrap())
        .unwrap();
    let err = ctx.new_channel("alias://;name=a;extra=2").unwrap_err();
    assert!(matches!(err, Error::Invalid(_)));
}

#[test]
fn alias_carries_params_into_init_replace() {
    let ctx = ctx_with_echo();
    ctx.alias_register("alias", Url::parse("echo://;null=yes").unwrap())
        .unwrap();
    let c = ctx.new_channel("alias://;name=alias").unwrap();
    assert!(Impl::same(c.impl_ref(), &builtin::NULL_IMPL));
    assert_eq!(
        c.config().get("url").as_deref(),
        Some("echo://;name=alias;null=yes")
    );
}

#[test]
fn init_replace_to_null() {
    let ctx = ctx_with_echo();
    let c = ctx.new_channel("echo://;name=echo-null;null=yes").unwrap();
    assert!(Impl::same(c.impl_ref(), &builtin::NULL_IMPL));

    assert_eq!(c.state(), State::Closed);
    c.open("").unwrap();
    assert_eq!(c.state(), State::Active);
    assert!(c.process().unwrap_err().is_again());
}

struct Loopy;

static LOOPY_IMPL: Impl = Impl {
    name: "loopy",
    new_data: || Box::new(Loopy),
};

impl ChannelData for Loopy {
    fn init(
        &mut self,
        _base: &ChannelRef,
        _url: &Url,
        _master: Option<&ChannelRef>,
        _ctx: &Context,
    ) -> Result<InitResult> {
        Ok(InitResult::Replace(&LOOPY_IMPL))
    }

    fn open(&mut self, _base: &ChannelRef, _params: &Url) -> Result<()> {
        Ok(())
    }

    fn close(&mut self, _base: &ChannelRef, _force: bool) -> Result<()> {
        Ok(())
    }

    fn process(&mut self, _base: &ChannelRef) -> Result<()> {
        Err(Error::Again)
    }

    fn post(&mut self, _base: &ChannelRef, _msg: &Msg<'_>) -> Result<()> {
        Ok(())
    }
}

#[test]
fn init_replace_loop_is_detected() {
    let ctx = Context::default();
    ctx.register(&LOOPY_IMPL, None).unwrap();
    let err = ctx.new_channel("loopy://;name=l").unwrap_err();
    assert!(matches!(err, Error::Invalid(_)));
    assert!(err.to_string().contains("loop"));
}

#[test]
fn default_context_is_a_singleton() {
    let a = Context::default_context();
    let b = Context::default_context();
    assert!(Context::same(&a, &b));
    assert!(!Context::same(&a, &Context::default()));
}

#[test]
fn name_index_tracks_alive_channels() {
    let ctx = ctx_with_echo();
    let c = ctx.new_channel("echo://;name=indexed").unwrap();
    let found = ctx.get("indexed").expect("channel is indexed");
    assert!(ChannelRef::same(&found, &c.handle()));
    assert!(!c.caps().contains(Caps::CUSTOM));

    drop(c);
    assert!(ctx.get("indexed").is_none(), "destroy unlinks the name");
}

#[test]
fn duplicate_name_is_rejected() {
    let ctx = ctx_with_echo();
    let _first = ctx.new_channel("echo://;name=dup").unwrap();
    let err = ctx.new_channel("echo://;name=dup").unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)));
}

#[test]
fn internal_channels_are_custom_and_hidden() {
    let ctx = ctx_with_echo();
    let c = ctx
        .new_channel("echo://;name=hidden;tll.internal=yes")
        .unwrap();
    assert!(c.caps().contains(Caps::CUSTOM));
    assert!(ctx.get("hidden").is_none());
}

#[test]
fn missing_master_is_not_found() {
    let ctx = ctx_with_echo();
    let err = ctx.new_channel("echo://;name=m;master=ghost").unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[test]
fn process_gates_on_dcaps() {
    let ctx = ctx_with_echo();
    let c = ctx.new_channel("echo://;name=gated").unwrap();
    // no PROCESS dcap yet
    assert!(c.process().unwrap_err().is_again());

    c.open("").unwrap();
    c.process().unwrap();
    assert_eq!(c.state(), State::Active);

    c.suspend();
    // suspended channels report AGAIN without entering the impl
    assert!(c.process().unwrap_err().is_again());
    c.resume();
    assert!(c.process().unwrap_err().is_again());
}

#[test]
fn callback_add_is_idempotent_and_del_is_exact() {
    let ctx = ctx_with_echo();
    let c = ctx.new_channel("echo://;name=cb").unwrap();
    c.open("").unwrap();
    c.process().unwrap();

    let collector = MsgCollector::new();
    let handle = collector.callback();
    c.callback_add(&handle, MsgMask::DATA);
    c.callback_add(&handle, MsgMask::DATA | MsgMask::STATE);

    c.post(&Msg::data(1, b"once")).unwrap();
    assert_eq!(collector.msgs().len(), 1, "no duplicate delivery");

    c.callback_del(&handle, MsgMask::ALL).unwrap();
    c.post(&Msg::data(2, b"after-del")).unwrap();
    assert_eq!(collector.msgs().len(), 1);
    assert!(matches!(
        c.callback_del(&handle, MsgMask::ALL).unwrap_err(),
        Error::NotFound(_)
    ));
}

#[test]
fn callbacks_filter_by_mask() {
    let ctx = ctx_with_echo();
    let c = ctx.new_channel("echo://;name=masked").unwrap();

    let states = collect(&c.handle(), MsgMask::STATE);
    let data = collect(&c.handle(), MsgMask::DATA);

    c.open("").unwrap();
    c.process().unwrap();
    assert_eq!(states.msgs().len(), 2, "Opening and Active");
    assert_eq!(states.msgs()[0].msgid, State::Opening as i32);
    assert_eq!(states.msgs()[1].msgid, State::Active as i32);
    assert!(data.msgs().is_empty());

    c.post(&Msg::data(5, b"x")).unwrap();
    assert_eq!(data.msgs().len(), 1);
    assert_eq!(states.msgs().len(), 2);
}

#[test]
fn callback_errors_are_swallowed() {
    let ctx = ctx_with_echo();
    let c = ctx.new_channel("echo://;name=poison").unwrap();
    c.open("").unwrap();
    c.process().unwrap();

    let broken = callback_fn(|_, _| Err(Error::invalid("subscriber bug")));
    let collector = collect(&c.handle(), MsgMask::DATA);
    c.callback_add(&broken, MsgMask::DATA);

    c.post(&Msg::data(9, b"still-delivered")).unwrap();
    assert_eq!(collector.msgs().len(), 1);
    assert_eq!(c.state(), State::Active);
}

#[test]
fn suspend_propagates_and_resume_respects_pins() {
    let ctx = ctx_with_echo();
    ctx.register(&PREFIX_IMPL, None).unwrap();
    let outer = ctx.new_channel("prefix+echo://;name=outer").unwrap();
    let inner = outer.children()[0].clone();

    let suspended = DCaps::SUSPEND | DCaps::SUSPEND_PERMANENT;

    outer.suspend();
    assert!(outer.dcaps().contains(suspended));
    assert!(inner.dcaps().contains(suspended));

    // idempotent
    outer.suspend();
    assert!(outer.dcaps().contains(suspended));

    outer.resume();
    assert!(!outer.dcaps().intersects(suspended));
    assert!(!inner.dcaps().intersects(suspended));

    // a pin on the inner survives a resume from above
    inner.suspend();
    outer.suspend();
    outer.resume();
    assert!(!outer.dcaps().intersects(suspended));
    assert!(inner.dcaps().contains(suspended));

    inner.resume();
    assert!(!inner.dcaps().intersects(suspended));
}

#[test]
fn dcaps_update_carries_previous_bits() {
    let ctx = ctx_with_echo();
    let c = ctx.new_channel("echo://;name=up").unwrap();
    let updates = collect(&c.handle(), MsgMask::CHANNEL);

    c.open("").unwrap(); // echo raises PROCESS
    let msgs = updates.msgs();
    assert_eq!(msgs.len(), 1);
    let old = i64::from_le_bytes(msgs[0].data.as_slice().try_into().unwrap());
    assert_eq!(old, 0, "previous dcaps were empty");
    assert!(c.dcaps().contains(DCaps::PROCESS));
}

#[test]
fn stat_counts_posted_data() {
    let ctx = ctx_with_echo();
    let c = ctx.new_channel("echo://;name=counted;stat=yes").unwrap();
    c.open("").unwrap();
    c.process().unwrap();

    c.post(&Msg::data(1, b"xxx")).unwrap();
    c.post(&Msg::data(2, b"yy")).unwrap();

    let stat = c.stat().expect("stat block registered");
    assert_eq!(stat.name().as_deref(), Some("counted"));
    let (tx, txb, _, _) = stat.snapshot();
    assert_eq!(tx, 2);
    assert_eq!(txb, 5);
    assert_eq!(ctx.stat_list().len(), 1);

    drop(c);
    assert!(ctx.stat_list().is_empty(), "destroy unlinks the stat");
}

#[test]
fn scheme_load_caches_and_borrows() {
    let ctx = ctx_with_echo();

    let first = ctx.scheme_load("inline://messages", true).unwrap();
    let second = ctx.scheme_load("inline://messages", true).unwrap();
    assert!(std::sync::Arc::ptr_eq(&first, &second), "cache hit");

    let uncached = ctx.scheme_load("inline://messages", false).unwrap();
    assert!(!std::sync::Arc::ptr_eq(&first, &uncached));

    assert!(matches!(
        ctx.scheme_load("channel://missing", true).unwrap_err(),
        Error::NotFound(_)
    ));
    let _c = ctx.new_channel("echo://;name=schemeless").unwrap();
    assert!(matches!(
        ctx.scheme_load("channel://schemeless", true).unwrap_err(),
        Error::NotFound(_)
    ));
}

#[test]
fn tcp_server_adopts_and_routes() {
    trace_init();
    let ctx = Context::default();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s.sock");

    let server = ctx
        .new_channel(&format!("tcp://{};mode=server;name=srv", path.display()))
        .unwrap();
    let on_server = collect(&server.handle(), MsgMask::DATA);
    server.open("").unwrap();
    assert_eq!(server.state(), State::Active);

    // only the listening socket so far
    assert_eq!(server.children().len(), 1);
    let socket = server.children()[0].clone();

    let c0 = ctx
        .new_channel(&format!("tcp://{};mode=client;name=c0", path.display()))
        .unwrap();
    let c1 = ctx
        .new_channel(&format!("tcp://{};mode=client;name=c1", path.display()))
        .unwrap();
    let on_c0 = collect(&c0.handle(), MsgMask::DATA);
    let on_c1 = collect(&c1.handle(), MsgMask::DATA);

    c0.open("").unwrap();
    poll_for(&socket, Duration::from_secs(1)).unwrap();
    assert_eq!(server.children().len(), 2);
    let s0 = server.children()[1].clone();

    c1.open("").unwrap();
    poll_for(&socket, Duration::from_secs(1)).unwrap();
    assert_eq!(server.children().len(), 3);

    assert!(s0.process().unwrap_err().is_again());

    c0.post(&Msg::data(1, b"xxx")).unwrap();
    assert!(on_server.msgs().is_empty());

    poll_for(&s0, Duration::from_secs(1)).unwrap();
    let incoming = on_server.msgs();
    assert_eq!(incoming.len(), 1);
    assert_eq!(incoming[0].seq, 1);
    assert_eq!(incoming[0].data, b"xxx");

    let _ = c0.process();
    let _ = c1.process();
    assert!(on_c0.msgs().is_empty());
    assert!(on_c1.msgs().is_empty());

    // reply using the incoming address token
    let mut reply = Msg::data(10, b"xxx");
    reply.addr = incoming[0].addr;
    server.post(&reply).unwrap();

    poll_for(&c0.handle(), Duration::from_secs(1)).unwrap();
    assert_eq!(on_c0.msgs().len(), 1);
    assert_eq!(on_c0.msgs()[0].seq, 10);
    assert_eq!(on_c0.msgs()[0].data, b"xxx");
    assert!(on_c1.msgs().is_empty());
}
