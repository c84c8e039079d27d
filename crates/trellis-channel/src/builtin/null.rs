//! Message sink: accepts everything, emits nothing.

use trellis_types::{Caps, Error, Msg, Result, State, Url};

use crate::channel::ChannelRef;
use crate::context::Context;
use crate::implement::{ChannelData, Impl, InitResult};

/// `null://` — the message sink.
pub static NULL_IMPL: Impl = Impl {
    name: "null",
    new_data: || Box::new(Null),
};

pub(crate) struct Null;

impl ChannelData for Null {
    fn init(
        &mut self,
        base: &ChannelRef,
        _url: &Url,
        _master: Option<&ChannelRef>,
        _ctx: &Context,
    ) -> Result<InitResult> {
        base.caps_add(Caps::OUTPUT);
        Ok(InitResult::Ok)
    }

    fn open(&mut self, base: &ChannelRef, _params: &Url) -> Result<()> {
        base.state_set(State::Active);
        Ok(())
    }

    fn close(&mut self, base: &ChannelRef, _force: bool) -> Result<()> {
        base.state_set(State::Closed);
        Ok(())
    }

    fn process(&mut self, _base: &ChannelRef) -> Result<()> {
        Err(Error::Again)
    }

    fn post(&mut self, _base: &ChannelRef, _msg: &Msg<'_>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_lifecycle() {
        let ctx = Context::default();
        let c = ctx.new_channel("null://;name=sink").unwrap();
        assert_eq!(c.state(), State::Closed);
        c.open("").unwrap();
        assert_eq!(c.state(), State::Active);
        c.post(&Msg::data(1, b"ignored")).unwrap();
        c.close(false).unwrap();
        assert_eq!(c.state(), State::Closed);
    }
}
