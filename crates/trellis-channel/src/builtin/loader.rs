//! Module-loading pseudo-channel.
//!
//! `loader://;module=<path>` loads the module into the owning context during
//! init; the channel itself stays `Closed` and never becomes active. It
//! exists so module loading can be driven by the same URL lists that
//! describe ordinary channels.

use trellis_types::{Error, Msg, Result, State, Url};

use crate::channel::ChannelRef;
use crate::context::Context;
use crate::implement::{ChannelData, Impl, InitResult};

/// `loader://;module=<path>;symbol=<name>` — loads a module at init.
pub static LOADER_IMPL: Impl = Impl {
    name: "loader",
    new_data: || Box::new(Loader),
};

const DEFAULT_SYMBOL: &str = "trellis_module";

pub(crate) struct Loader;

impl ChannelData for Loader {
    fn init(
        &mut self,
        _base: &ChannelRef,
        url: &Url,
        _master: Option<&ChannelRef>,
        ctx: &Context,
    ) -> Result<InitResult> {
        let module = url
            .get("module")
            .ok_or_else(|| Error::invalid("loader needs module="))?;
        let symbol = url.get("symbol").unwrap_or(DEFAULT_SYMBOL);
        ctx.load(module, symbol)?;
        Ok(InitResult::Ok)
    }

    fn open(&mut self, base: &ChannelRef, _params: &Url) -> Result<()> {
        // the work happened at init; there is nothing to open
        base.state_set(State::Closed);
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
    fn missing_module_key_fails() {
        let ctx = Context::default();
        let err = ctx.new_channel("loader://;name=l").unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[test]
    fn missing_module_file_fails() {
        let ctx = Context::default();
        assert!(ctx
            .new_channel("loader://;name=l2;module=./missing-module")
            .is_err());
    }
}
