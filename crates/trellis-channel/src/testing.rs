//! Test support: the echo fixture impl and polling helpers.
//!
//! Kept in the library (not behind `cfg(test)`) so integration tests and
//! downstream crates can exercise channels without a real transport.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use trellis_types::{Caps, DCaps, Error, Msg, MsgMask, OwnedMsg, Result, State, Url};

use crate::callback::{CallbackRef, ChannelCallback};
use crate::channel::ChannelRef;
use crate::context::Context;
use crate::implement::{ChannelData, Impl, InitResult};

/// `echo://` — reflects every post back to the subscribers; `Opening` and
/// `Closing` are driven to completion by `process`, so lifecycle tests can
/// observe every intermediate state. `null=yes` makes init replace the impl
/// with `null`.
///
/// Not in the default registry; tests register it explicitly.
pub static ECHO_IMPL: Impl = Impl {
    name: "echo",
    new_data: || Box::new(Echo),
};

pub(crate) struct Echo;

impl ChannelData for Echo {
    fn init(
        &mut self,
        base: &ChannelRef,
        url: &Url,
        _master: Option<&ChannelRef>,
        _ctx: &Context,
    ) -> Result<InitResult> {
        if url.get_bool("null", false)? {
            return Ok(InitResult::Replace(&crate::builtin::NULL_IMPL));
        }
        base.caps_add(Caps::INOUT);
        Ok(InitResult::Ok)
    }

    fn open(&mut self, base: &ChannelRef, _params: &Url) -> Result<()> {
        // stays in Opening until the first process call
        base.update_dcaps(DCaps::PROCESS, DCaps::PROCESS);
        Ok(())
    }

    fn close(&mut self, _base: &ChannelRef, _force: bool) -> Result<()> {
        // long close: the transition to Closed happens in process
        Ok(())
    }

    fn process(&mut self, base: &ChannelRef) -> Result<()> {
        match base.state() {
            State::Opening => {
                base.state_set(State::Active);
                Ok(())
            }
            State::Closing => {
                base.update_dcaps(DCaps::empty(), DCaps::PROCESS);
                base.state_set(State::Closed);
                Ok(())
            }
            _ => Err(Error::Again),
        }
    }

    fn post(&mut self, base: &ChannelRef, msg: &Msg<'_>) -> Result<()> {
        base.callback(msg);
        Ok(())
    }
}

/// Collects every delivered message for later assertions.
#[derive(Clone, Default)]
pub struct MsgCollector {
    msgs: Arc<Mutex<Vec<OwnedMsg>>>,
}

struct CollectorCallback {
    msgs: Arc<Mutex<Vec<OwnedMsg>>>,
}

impl ChannelCallback for CollectorCallback {
    fn message(&self, _channel: &ChannelRef, msg: &Msg<'_>) -> Result<()> {
        self.msgs.lock().push(OwnedMsg::from(msg));
        Ok(())
    }
}

impl MsgCollector {
    /// New empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The subscriber handle to pass to `callback_add`/`callback_del`.
    /// Each call returns a distinct handle; keep it if you plan to delete.
    #[must_use]
    pub fn callback(&self) -> CallbackRef {
        Arc::new(CollectorCallback {
            msgs: self.msgs.clone(),
        })
    }

    /// Snapshot of the collected messages.
    #[must_use]
    pub fn msgs(&self) -> Vec<OwnedMsg> {
        self.msgs.lock().clone()
    }

    /// Drops everything collected so far.
    pub fn clear(&self) {
        self.msgs.lock().clear();
    }
}

/// Calls `process` until it reports progress or an error.
///
/// # Errors
///
/// `TIMED_OUT` when the deadline passes with nothing but `AGAIN`.
pub fn poll_for(channel: &ChannelRef, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        match channel.process() {
            Err(Error::Again) => {}
            other => return other,
        }
        if Instant::now() >= deadline {
            return Err(Error::TimedOut);
        }
        std::thread::sleep(Duration::from_micros(100));
    }
}

/// Subscribes a collector with the given mask and returns it.
pub fn collect(channel: &ChannelRef, mask: MsgMask) -> MsgCollector {
    let collector = MsgCollector::new();
    channel.callback_add(&collector.callback(), mask);
    collector
}
