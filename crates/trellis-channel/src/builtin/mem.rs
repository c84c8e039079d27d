//! In-process queue pair.
//!
//! Like `direct`, but buffered: a post lands in the peer's queue and raises
//! the peer's `PENDING` dcap, so a processor loop drains it on its next
//! round instead of the message being delivered inside the poster's call
//! stack. Both endpoints live under one loop.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use trellis_types::{Caps, DCaps, Error, Msg, OwnedMsg, Result, State, Url};

use crate::channel::{ChannelRef, ChannelWeak};
use crate::context::Context;
use crate::implement::{ChannelData, Impl, InitResult};

/// `mem://;size=<messages>` — buffered in-process pair.
pub static MEM_IMPL: Impl = Impl {
    name: "mem",
    new_data: || Box::new(Mem::default()),
};

#[derive(Default)]
struct Shared {
    // one queue per direction, indexed by the receiving side
    queues: [Mutex<VecDeque<OwnedMsg>>; 2],
    peers: [Mutex<Option<ChannelWeak>>; 2],
}

pub(crate) struct Mem {
    shared: Arc<Shared>,
    /// Which side of the pair this endpoint is.
    side: usize,
    limit: usize,
}

impl Default for Mem {
    fn default() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            side: 0,
            limit: 0,
        }
    }
}

impl ChannelData for Mem {
    fn init(
        &mut self,
        base: &ChannelRef,
        url: &Url,
        master: Option<&ChannelRef>,
        _ctx: &Context,
    ) -> Result<InitResult> {
        self.limit = url.get_typed("size", 128usize)?;
        base.caps_add(Caps::INOUT);
        if let Some(master) = master {
            let mut guard = master
                .data_lock()
                .ok_or_else(|| Error::invalid("master is busy"))?;
            let data = guard
                .as_mut()
                .ok_or_else(|| Error::invalid("master is dead"))?;
            let other = data
                .as_any()
                .and_then(|any| any.downcast_mut::<Mem>())
                .ok_or_else(|| {
                    Error::invalid(format!("master '{}' is not a mem channel", master.name()))
                })?;
            self.shared = other.shared.clone();
            self.side = 1;
        }
        *self.shared.peers[self.side].lock() = Some(base.downgrade());
        Ok(InitResult::Ok)
    }

    fn open(&mut self, base: &ChannelRef, _params: &Url) -> Result<()> {
        base.state_set(State::Active);
        Ok(())
    }

    fn close(&mut self, base: &ChannelRef, _force: bool) -> Result<()> {
        self.shared.queues[self.side].lock().clear();
        base.update_dcaps(DCaps::empty(), DCaps::PENDING);
        base.state_set(State::Closed);
        Ok(())
    }

    fn process(&mut self, base: &ChannelRef) -> Result<()> {
        let (msg, empty) = {
            let mut queue = self.shared.queues[self.side].lock();
            let msg = queue.pop_front();
            (msg, queue.is_empty())
        };
        if empty {
            base.update_dcaps(DCaps::empty(), DCaps::PENDING);
        }
        let Some(msg) = msg else {
            return Err(Error::Again);
        };
        base.callback_data(&msg.view());
        Ok(())
    }

    fn post(&mut self, _base: &ChannelRef, msg: &Msg<'_>) -> Result<()> {
        let other = 1 - self.side;
        {
            let mut queue = self.shared.queues[other].lock();
            if queue.len() >= self.limit {
                return Err(Error::Again);
            }
            queue.push_back(OwnedMsg::from(msg));
        }
        if let Some(peer) = self.shared.peers[other].lock().clone() {
            if let Some(peer) = peer.upgrade() {
                peer.update_dcaps(DCaps::PENDING, DCaps::PENDING);
            }
        }
        Ok(())
    }

    fn as_any(&mut self) -> Option<&mut dyn std::any::Any> {
        Some(self)
    }
}
