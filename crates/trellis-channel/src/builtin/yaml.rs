//! Scripted message replay.
//!
//! Reads a YAML scenario from the URL host and emits one message per
//! process call:
//!
//! ```yaml
//! - seq: 0
//!   msgid: 10
//!   data: "first"
//! - seq: 1
//!   data: "second"
//! ```
//!
//! With `autoclose=yes` (the default) the channel closes itself after the
//! last message; otherwise it parks with its `PROCESS` dcap cleared.

use serde::Deserialize;

use trellis_types::{Caps, DCaps, Error, Msg, MsgType, Result, State, Url};

use crate::channel::ChannelRef;
use crate::context::Context;
use crate::implement::{ChannelData, Impl, InitResult};

/// `yaml://<file>;autoclose=yes|no` — scripted replay.
pub static YAML_IMPL: Impl = Impl {
    name: "yaml",
    new_data: || Box::new(Yaml::default()),
};

#[derive(Debug, Deserialize)]
struct ScriptedMsg {
    #[serde(default)]
    seq: i64,
    #[serde(default)]
    msgid: i32,
    #[serde(default)]
    data: String,
}

#[derive(Default)]
pub(crate) struct Yaml {
    path: String,
    autoclose: bool,
    script: Vec<ScriptedMsg>,
    cursor: usize,
}

impl ChannelData for Yaml {
    fn init(
        &mut self,
        base: &ChannelRef,
        url: &Url,
        _master: Option<&ChannelRef>,
        _ctx: &Context,
    ) -> Result<InitResult> {
        self.path = url.host().to_string();
        if self.path.is_empty() {
            return Err(Error::invalid("yaml url has no file"));
        }
        self.autoclose = url.get_bool("autoclose", true)?;
        base.caps_add(Caps::INPUT);
        Ok(InitResult::Ok)
    }

    fn open(&mut self, base: &ChannelRef, _params: &Url) -> Result<()> {
        let body = std::fs::read_to_string(&self.path)
            .map_err(|e| Error::invalid(format!("read '{}' failed: {e}", self.path)))?;
        self.script = serde_yaml::from_str(&body)
            .map_err(|e| Error::invalid(format!("parse '{}' failed: {e}", self.path)))?;
        self.cursor = 0;
        base.update_dcaps(DCaps::PROCESS, DCaps::PROCESS);
        base.state_set(State::Active);
        Ok(())
    }

    fn close(&mut self, base: &ChannelRef, _force: bool) -> Result<()> {
        self.script.clear();
        base.update_dcaps(DCaps::empty(), DCaps::PROCESS);
        base.state_set(State::Closed);
        Ok(())
    }

    fn process(&mut self, base: &ChannelRef) -> Result<()> {
        let Some(scripted) = self.script.get(self.cursor) else {
            if self.autoclose {
                base.update_dcaps(DCaps::empty(), DCaps::PROCESS);
                base.state_set(State::Closing);
                base.state_set(State::Closed);
                return Ok(());
            }
            base.update_dcaps(DCaps::empty(), DCaps::PROCESS);
            return Err(Error::Again);
        };
        let msg = Msg {
            type_: MsgType::Data,
            msgid: scripted.msgid,
            seq: scripted.seq,
            data: scripted.data.as_bytes(),
            ..Default::default()
        };
        base.callback_data(&msg);
        self.cursor += 1;
        Ok(())
    }

    fn post(&mut self, _base: &ChannelRef, _msg: &Msg<'_>) -> Result<()> {
        Err(Error::invalid("yaml channel is input only"))
    }
}
