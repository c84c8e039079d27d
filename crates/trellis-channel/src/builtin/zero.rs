//! Benchmark source: a zero-filled message on every process call.

use trellis_types::{Caps, DCaps, Error, Msg, MsgType, Result, State, Url};

use crate::channel::ChannelRef;
use crate::context::Context;
use crate::implement::{ChannelData, Impl, InitResult};

/// `zero://;size=<bytes>` — endless zero-filled input.
pub static ZERO_IMPL: Impl = Impl {
    name: "zero",
    new_data: || Box::new(Zero::default()),
};

#[derive(Default)]
pub(crate) struct Zero {
    size: usize,
    seq: i64,
}

impl ChannelData for Zero {
    fn init(
        &mut self,
        base: &ChannelRef,
        url: &Url,
        _master: Option<&ChannelRef>,
        _ctx: &Context,
    ) -> Result<InitResult> {
        self.size = url.get_typed("size", 1024usize)?;
        base.caps_add(Caps::INPUT);
        Ok(InitResult::Ok)
    }

    fn open(&mut self, base: &ChannelRef, _params: &Url) -> Result<()> {
        self.seq = 0;
        base.update_dcaps(DCaps::PROCESS, DCaps::PROCESS);
        base.state_set(State::Active);
        Ok(())
    }

    fn close(&mut self, base: &ChannelRef, _force: bool) -> Result<()> {
        base.update_dcaps(DCaps::empty(), DCaps::PROCESS);
        base.state_set(State::Closed);
        Ok(())
    }

    fn process(&mut self, base: &ChannelRef) -> Result<()> {
        let data = vec![0u8; self.size];
        let msg = Msg {
            type_: MsgType::Data,
            seq: self.seq,
            data: &data,
            ..Default::default()
        };
        self.seq += 1;
        base.callback_data(&msg);
        Ok(())
    }

    fn post(&mut self, _base: &ChannelRef, _msg: &Msg<'_>) -> Result<()> {
        Err(Error::invalid("zero channel is input only"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MsgCollector;
    use trellis_types::MsgMask;

    #[test]
    fn emits_zeroes_with_monotonic_seq() {
        let ctx = Context::default();
        let c = ctx.new_channel("zero://;name=z;size=16").unwrap();
        let collector = MsgCollector::new();
        c.callback_add(&collector.callback(), MsgMask::DATA);
        c.open("").unwrap();
        assert_eq!(c.state(), State::Active);

        c.process().unwrap();
        c.process().unwrap();

        let msgs = collector.msgs();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].seq, 0);
        assert_eq!(msgs[1].seq, 1);
        assert_eq!(msgs[0].data, vec![0u8; 16]);
    }

    #[test]
    fn post_is_rejected() {
        let ctx = Context::default();
        let c = ctx.new_channel("zero://;name=z2").unwrap();
        c.open("").unwrap();
        assert!(c.post(&Msg::data(0, b"x")).is_err());
    }
}
