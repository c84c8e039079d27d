//! Paired in-process endpoints.
//!
//! The first endpoint is created standalone; the second joins it with
//! `master=<name>`. A post on either side is dispatched straight to the
//! other side's subscribers — the simplest possible transport, used to wire
//! logic blocks together inside one loop.

use tracing::debug;

use trellis_types::{Caps, Error, Msg, Result, State, Url};

use crate::channel::{ChannelRef, ChannelWeak};
use crate::context::Context;
use crate::implement::{ChannelData, Impl, InitResult};

/// `direct://` — paired pass-through endpoints.
pub static DIRECT_IMPL: Impl = Impl {
    name: "direct",
    new_data: || Box::new(Direct::default()),
};

#[derive(Default)]
pub(crate) struct Direct {
    peer: Option<ChannelWeak>,
}

impl ChannelData for Direct {
    fn init(
        &mut self,
        base: &ChannelRef,
        _url: &Url,
        master: Option<&ChannelRef>,
        _ctx: &Context,
    ) -> Result<InitResult> {
        base.caps_add(Caps::INOUT);
        if let Some(master) = master {
            // link both sides through the master's state
            let mut guard = master
                .data_lock()
                .ok_or_else(|| Error::invalid("master is busy"))?;
            let data = guard
                .as_mut()
                .ok_or_else(|| Error::invalid("master is dead"))?;
            let other = data
                .as_any()
                .and_then(|any| any.downcast_mut::<Direct>())
                .ok_or_else(|| {
                    Error::invalid(format!(
                        "master '{}' is not a direct channel",
                        master.name()
                    ))
                })?;
            other.peer = Some(base.downgrade());
            self.peer = Some(master.downgrade());
        }
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

    fn post(&mut self, base: &ChannelRef, msg: &Msg<'_>) -> Result<()> {
        let Some(peer) = self.peer.as_ref().and_then(ChannelWeak::upgrade) else {
            debug!(channel = %base.name(), "no peer, message dropped");
            return Ok(());
        };
        if peer.state() != State::Active {
            return Ok(());
        }
        peer.callback(msg);
        Ok(())
    }

    fn as_any(&mut self) -> Option<&mut dyn std::any::Any> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MsgCollector;
    use trellis_types::MsgMask;

    #[test]
    fn pair_exchanges_messages() {
        let ctx = Context::default();
        let server = ctx.new_channel("direct://;name=d-server").unwrap();
        let client = ctx
            .new_channel("direct://;name=d-client;master=d-server")
            .unwrap();
        server.open("").unwrap();
        client.open("").unwrap();

        let on_server = MsgCollector::new();
        let on_client = MsgCollector::new();
        server.callback_add(&on_server.callback(), MsgMask::DATA);
        client.callback_add(&on_client.callback(), MsgMask::DATA);

        client.post(&Msg::data(7, b"up")).unwrap();
        server.post(&Msg::data(8, b"down")).unwrap();

        assert_eq!(on_server.msgs().len(), 1);
        assert_eq!(on_server.msgs()[0].seq, 7);
        assert_eq!(on_client.msgs().len(), 1);
        assert_eq!(on_client.msgs()[0].data, b"down");
    }

    #[test]
    fn unknown_master_fails() {
        let ctx = Context::default();
        let err = ctx
            .new_channel("direct://;name=d1;master=missing")
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
