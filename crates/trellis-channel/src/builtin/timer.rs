//! Timerfd expirations as messages.
//!
//! `interval=<ms>` fires repeatedly, `oneshot=<ms>` fires once; one DATA
//! message per expiry with a monotonically increasing `seq` and the expiry
//! count as an 8-byte LE payload.

use std::io::{ErrorKind, Read};
use std::os::fd::AsFd;
use std::time::Duration;

use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};

use trellis_types::{Caps, DCaps, Error, Msg, MsgType, Result, State, Url};

use crate::channel::ChannelRef;
use crate::context::Context;
use crate::implement::{ChannelData, Impl, InitResult};

/// `timer://;interval=<ms>` or `timer://;oneshot=<ms>`.
pub static TIMER_IMPL: Impl = Impl {
    name: "timer",
    new_data: || Box::new(Timer::default()),
};

const POLL_DCAPS: DCaps = DCaps::POLLIN.union(DCaps::PROCESS);

#[derive(Default)]
pub(crate) struct Timer {
    interval: Option<Duration>,
    oneshot: Option<Duration>,
    fd: Option<TimerFd>,
    reader: Option<std::fs::File>,
    seq: i64,
}

impl ChannelData for Timer {
    fn init(
        &mut self,
        base: &ChannelRef,
        url: &Url,
        _master: Option<&ChannelRef>,
        _ctx: &Context,
    ) -> Result<InitResult> {
        let interval = url.get_typed("interval", 0u64)?;
        let oneshot = url.get_typed("oneshot", 0u64)?;
        if interval != 0 && oneshot != 0 {
            return Err(Error::invalid("interval and oneshot are exclusive"));
        }
        if interval == 0 && oneshot == 0 {
            return Err(Error::invalid("timer needs interval= or oneshot="));
        }
        self.interval = (interval != 0).then(|| Duration::from_millis(interval));
        self.oneshot = (oneshot != 0).then(|| Duration::from_millis(oneshot));
        base.caps_add(Caps::INPUT);
        Ok(InitResult::Ok)
    }

    fn open(&mut self, base: &ChannelRef, _params: &Url) -> Result<()> {
        let timer = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )
        .map_err(|e| Error::invalid(format!("timerfd failed: {e}")))?;
        let expiration = match (self.interval, self.oneshot) {
            (Some(d), _) => Expiration::Interval(TimeSpec::from_duration(d)),
            (None, Some(d)) => Expiration::OneShot(TimeSpec::from_duration(d)),
            (None, None) => return Err(Error::invalid("timer is unconfigured")),
        };
        timer
            .set(expiration, TimerSetTimeFlags::empty())
            .map_err(|e| Error::invalid(format!("timerfd set failed: {e}")))?;
        let reader = timer
            .as_fd()
            .try_clone_to_owned()
            .map(std::fs::File::from)
            .map_err(|e| Error::invalid(format!("timerfd dup failed: {e}")))?;
        base.fd_set(Some(nix_fd(&timer)));
        self.fd = Some(timer);
        self.reader = Some(reader);
        self.seq = 0;
        base.update_dcaps(POLL_DCAPS, POLL_DCAPS);
        base.state_set(State::Active);
        Ok(())
    }

    fn close(&mut self, base: &ChannelRef, _force: bool) -> Result<()> {
        self.reader = None;
        self.fd = None;
        base.update_dcaps(DCaps::empty(), POLL_DCAPS);
        base.fd_set(None);
        base.state_set(State::Closed);
        Ok(())
    }

    fn process(&mut self, base: &ChannelRef) -> Result<()> {
        let reader = self.reader.as_mut().ok_or(Error::Again)?;
        let mut expiries = [0u8; 8];
        match reader.read_exact(&mut expiries) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Err(Error::Again),
            Err(e) => return Err(Error::invalid(format!("timerfd read failed: {e}"))),
        }
        let msg = Msg {
            type_: MsgType::Data,
            seq: self.seq,
            data: &expiries,
            ..Default::default()
        };
        self.seq += 1;
        base.callback_data(&msg);
        if self.oneshot.is_some() {
            base.update_dcaps(DCaps::empty(), POLL_DCAPS);
        }
        Ok(())
    }

    fn post(&mut self, _base: &ChannelRef, _msg: &Msg<'_>) -> Result<()> {
        Err(Error::invalid("timer channel is input only"))
    }
}

fn nix_fd(timer: &TimerFd) -> std::os::fd::RawFd {
    use std::os::fd::AsRawFd;
    timer.as_fd().as_raw_fd()
}
