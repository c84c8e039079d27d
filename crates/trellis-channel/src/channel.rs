//! The polymorphic channel object.
//!
//! A channel is an implementation's private state ([`ChannelData`]) plus the
//! shared bookkeeping every channel carries: state machine, capability bits,
//! optional file descriptor, name, live config, stat block, child list and
//! the two callback tables. Two handle types expose it:
//!
//! | Handle | Ownership |
//! |--------|-----------|
//! | [`Channel`] | Unique owner; dropping it destroys the channel |
//! | [`ChannelRef`] | Cheap shared handle (context index, loop, callbacks) |
//!
//! Destruction is graceful even with outstanding `ChannelRef`s: the owner
//! announces `Destroy`, releases the implementation and unlinks itself from
//! the context; surviving refs observe a dead channel whose operations fail
//! with `INVALID`.
//!
//! # Lifecycle
//!
//! ```text
//! Closed ──open()──► Opening ──impl──► Active ──close()──► Closing ──► Closed
//!    │                                                                  │
//!    └──────────────────────── drop ──► Destroy ◄───────────────────────┘
//! ```
//!
//! Every transition, dcap change and child mutation is announced through the
//! callback tables, so observers (the processor loop included) follow the
//! channel through the same path data flows on.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use trellis_types::{
    channel_msg, Caps, Config, DCaps, Error, Msg, MsgMask, MsgType, Result, SchemeRef, State,
    StatRef, Url,
};

use crate::callback::{CallbackRef, CallbackTable};
use crate::context::Context;
use crate::implement::{ChannelData, Impl};

/// Shared per-channel bookkeeping.
pub(crate) struct Internal {
    state: AtomicU8,
    caps: Mutex<Caps>,
    dcaps: Mutex<DCaps>,
    fd: AtomicI32,
    name: RwLock<String>,
    dump: AtomicBool,
    /// Set by an explicit `suspend` on this very channel, as opposed to
    /// suspension inherited from a parent. `resume` from above skips
    /// subtrees that are pinned here.
    pinned: AtomicBool,
    config: Config,
    stat: Mutex<Option<StatRef>>,
    children: Mutex<Vec<Channel>>,
    data_cbs: Mutex<CallbackTable>,
    other_cbs: Mutex<CallbackTable>,
}

impl Default for Internal {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(State::Closed as u8),
            caps: Mutex::new(Caps::empty()),
            dcaps: Mutex::new(DCaps::empty()),
            fd: AtomicI32::new(-1),
            name: RwLock::new(String::new()),
            dump: AtomicBool::new(false),
            pinned: AtomicBool::new(false),
            config: Config::new(),
            stat: Mutex::new(None),
            children: Mutex::new(Vec::new()),
            data_cbs: Mutex::new(CallbackTable::default()),
            other_cbs: Mutex::new(CallbackTable::default()),
        }
    }
}

pub(crate) struct ChannelShared {
    pub(crate) context: Context,
    pub(crate) impl_: RwLock<&'static Impl>,
    pub(crate) data: Mutex<Option<Box<dyn ChannelData>>>,
    pub(crate) internal: Internal,
}

/// Cheap shared handle to a channel.
///
/// Held by the context name index, the processor loop, parents and
/// subscribers. Implementation-side operations (`state_set`,
/// `update_dcaps`, `child_add`, `callback_data`, ...) live here too: a
/// [`ChannelData`] receives its own channel as `base`.
#[derive(Clone)]
pub struct ChannelRef(pub(crate) Arc<ChannelShared>);

/// Unique owning handle. Dropping it destroys the channel: pending children
/// are torn down, `Destroy` is announced, the implementation is freed and
/// the context unlinks the name and stat block.
pub struct Channel(ChannelRef);

/// Weak channel handle; upgrades only while the channel is alive.
#[derive(Clone)]
pub struct ChannelWeak(Weak<ChannelShared>);

impl ChannelWeak {
    /// A strong handle, unless every other reference is gone.
    #[must_use]
    pub fn upgrade(&self) -> Option<ChannelRef> {
        self.0.upgrade().map(ChannelRef)
    }
}

impl ChannelRef {
    pub(crate) fn new(context: Context, impl_: &'static Impl, data: Box<dyn ChannelData>) -> Self {
        Self(Arc::new(ChannelShared {
            context,
            impl_: RwLock::new(impl_),
            data: Mutex::new(Some(data)),
            internal: Internal::default(),
        }))
    }

    /// Address identity of two handles.
    #[must_use]
    pub fn same(a: &ChannelRef, b: &ChannelRef) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    /// A weak handle that does not keep the channel alive.
    #[must_use]
    pub fn downgrade(&self) -> ChannelWeak {
        ChannelWeak(Arc::downgrade(&self.0))
    }

    /// The implementation this channel ended up with.
    #[must_use]
    pub fn impl_ref(&self) -> &'static Impl {
        *self.0.impl_.read()
    }

    /// Channel name; empty for nameless channels.
    #[must_use]
    pub fn name(&self) -> String {
        self.0.internal.name.read().clone()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> State {
        // stored as the state's discriminant, so the unwrap cannot fire
        State::from_msgid(i32::from(self.0.internal.state.load(Ordering::Acquire)))
            .unwrap_or(State::Destroy)
    }

    /// Static capabilities.
    #[must_use]
    pub fn caps(&self) -> Caps {
        *self.0.internal.caps.lock()
    }

    /// Dynamic capabilities.
    #[must_use]
    pub fn dcaps(&self) -> DCaps {
        *self.0.internal.dcaps.lock()
    }

    /// The channel's fd, if it exposes one.
    #[must_use]
    pub fn fd(&self) -> Option<RawFd> {
        match self.0.internal.fd.load(Ordering::Acquire) {
            -1 => None,
            fd => Some(fd),
        }
    }

    /// Live config handle (`state`, `url`, implementation extras).
    #[must_use]
    pub fn config(&self) -> Config {
        self.0.internal.config.clone()
    }

    /// The owning context.
    #[must_use]
    pub fn context(&self) -> Context {
        self.0.context.clone()
    }

    /// Snapshot of the child list.
    #[must_use]
    pub fn children(&self) -> Vec<ChannelRef> {
        self.0
            .internal
            .children
            .lock()
            .iter()
            .map(|c| c.0.clone())
            .collect()
    }

    /// The channel's scheme for a message type.
    #[must_use]
    pub fn scheme(&self, type_: MsgType) -> Option<SchemeRef> {
        let guard = self.0.data.lock();
        guard.as_ref().and_then(|data| data.scheme(type_))
    }

    // === Lifecycle ===

    /// Opens the channel with `key=value;…` parameters.
    ///
    /// # Errors
    ///
    /// `INVALID` when the channel is dead or not `Closed`; implementation
    /// errors pass through and leave the channel in `Error`.
    pub fn open(&self, params: &str) -> Result<()> {
        let url = Url::parse(&format!("open://;{params}"))?;
        if self.state() != State::Closed {
            return Err(Error::invalid(format!(
                "channel '{}' is {}, not Closed",
                self.name(),
                self.state()
            )));
        }
        self.state_set(State::Opening);
        let r = {
            let mut guard = self.0.data.try_lock().ok_or(Error::Again)?;
            let data = guard
                .as_mut()
                .ok_or_else(|| Error::invalid("dead channel"))?;
            data.open(self, &url)
        };
        if let Err(e) = r {
            warn!(channel = %self.name(), error = %e, "open failed");
            self.state_set(State::Error);
            return Err(e);
        }
        Ok(())
    }

    /// Closes the channel. `force` demands immediate teardown; otherwise
    /// long-closing transports stay in `Closing` until they finish.
    pub fn close(&self, force: bool) -> Result<()> {
        match self.state() {
            State::Closed | State::Destroy => return Ok(()),
            State::Closing if !force => return Ok(()),
            _ => {}
        }
        self.state_set(State::Closing);
        let r = {
            let mut guard = self.0.data.try_lock().ok_or(Error::Again)?;
            match guard.as_mut() {
                Some(data) => data.close(self, force),
                None => Err(Error::invalid("dead channel")),
            }
        };
        if let Err(ref e) = r {
            // teardown keeps forcing through errors
            warn!(channel = %self.name(), error = %e, "close failed");
        }
        if force && self.state() != State::Closed {
            self.state_set(State::Closed);
        }
        r
    }

    /// Drives one unit of work.
    ///
    /// Returns `Err(Again)` — without entering the implementation — while
    /// the channel is suspended or carries neither `PROCESS` nor `PENDING`.
    pub fn process(&self) -> Result<()> {
        if !self.dcaps().need_process() {
            return Err(Error::Again);
        }
        let mut guard = self.0.data.try_lock().ok_or(Error::Again)?;
        let data = guard
            .as_mut()
            .ok_or_else(|| Error::invalid("dead channel"))?;
        data.process(self)
    }

    /// Posts a message. On a successful DATA post the stat block's `tx`
    /// counters are bumped.
    pub fn post(&self, msg: &Msg<'_>) -> Result<()> {
        {
            let mut guard = self.0.data.try_lock().ok_or(Error::Again)?;
            let data = guard
                .as_mut()
                .ok_or_else(|| Error::invalid("dead channel"))?;
            data.post(self, msg)?;
        }
        if msg.type_ == MsgType::Data {
            if let Some(stat) = self.0.internal.stat.lock().clone() {
                if let Some(page) = stat.acquire() {
                    page.update_tx(msg.data.len());
                    stat.release();
                }
            }
        }
        Ok(())
    }

    // === Suspension ===

    /// Suspends this channel and every descendant: both `SUSPEND` and
    /// `SUSPEND_PERMANENT` are raised through the subtree, and this channel
    /// is remembered as the explicit suspension root.
    ///
    /// Idempotent; the tree walk goes through the child list directly, not
    /// through callbacks, so it completes synchronously.
    pub fn suspend(&self) {
        self.0.internal.pinned.store(true, Ordering::Release);
        self.suspend_tree();
    }

    fn suspend_tree(&self) {
        self.update_dcaps(
            DCaps::SUSPEND | DCaps::SUSPEND_PERMANENT,
            DCaps::SUSPEND | DCaps::SUSPEND_PERMANENT,
        );
        for child in self.children() {
            child.suspend_tree();
        }
    }

    /// Resumes this channel and its descendants, clearing both suspension
    /// bits — except in subtrees whose root was itself explicitly
    /// suspended: an operator's pin is not undone by a parent's resume.
    pub fn resume(&self) {
        self.0.internal.pinned.store(false, Ordering::Release);
        self.update_dcaps(DCaps::empty(), DCaps::SUSPEND | DCaps::SUSPEND_PERMANENT);
        for child in self.children() {
            child.resume_tree();
        }
    }

    fn resume_tree(&self) {
        if self.0.internal.pinned.load(Ordering::Acquire) {
            return;
        }
        self.update_dcaps(DCaps::empty(), DCaps::SUSPEND | DCaps::SUSPEND_PERMANENT);
        for child in self.children() {
            child.resume_tree();
        }
    }

    // === Callbacks ===

    /// Subscribes `cb` for the message types in `mask`. Re-adding the same
    /// handle widens the mask instead of duplicating.
    pub fn callback_add(&self, cb: &CallbackRef, mask: MsgMask) {
        if mask.contains(MsgMask::DATA) {
            self.0.internal.data_cbs.lock().add(cb, MsgMask::DATA);
            let rest = mask & !MsgMask::DATA;
            if rest.is_empty() {
                return;
            }
            self.0.internal.other_cbs.lock().add(cb, rest);
        } else {
            self.0.internal.other_cbs.lock().add(cb, mask);
        }
    }

    /// Removes `mask` bits from the subscription; a fully cleared handle is
    /// dropped from the tables.
    ///
    /// # Errors
    ///
    /// `NOT_FOUND` when the handle matched in no table.
    pub fn callback_del(&self, cb: &CallbackRef, mask: MsgMask) -> Result<()> {
        let mut found = false;
        if mask.contains(MsgMask::DATA) {
            found |= self
                .0
                .internal
                .data_cbs
                .lock()
                .del(cb, MsgMask::DATA)
                .is_ok();
        }
        let rest = mask & !MsgMask::DATA;
        if !rest.is_empty() {
            found |= self.0.internal.other_cbs.lock().del(cb, rest).is_ok();
        }
        if found {
            Ok(())
        } else {
            Err(Error::NotFound("callback".into()))
        }
    }

    // === Implementation-side operations ===

    /// Transitions the state machine and announces the new state. The STATE
    /// callback fires before this returns.
    pub fn state_set(&self, new: State) {
        let old = self
            .0
            .internal
            .state
            .swap(new as u8, Ordering::AcqRel);
        if old == new as u8 {
            return;
        }
        let old = State::from_msgid(i32::from(old)).unwrap_or(State::Destroy);
        debug!(channel = %self.name(), "state {old} -> {new}");
        self.0.internal.config.set("state", new.to_string());
        let msg = Msg {
            type_: MsgType::State,
            msgid: new as i32,
            ..Default::default()
        };
        self.dispatch(&msg);
    }

    /// Applies `value` under `mask` to the dcaps and announces the change
    /// with a CHANNEL/`UPDATE` message carrying the previous bits.
    pub fn update_dcaps(&self, value: DCaps, mask: DCaps) {
        let old = {
            let mut guard = self.0.internal.dcaps.lock();
            let old = *guard;
            let new = (old & !mask) | (value & mask);
            if new == old {
                return;
            }
            *guard = new;
            old
        };
        let payload = i64::from(old.bits()).to_le_bytes();
        let msg = Msg {
            type_: MsgType::Channel,
            msgid: channel_msg::UPDATE,
            data: &payload,
            ..Default::default()
        };
        self.dispatch(&msg);
    }

    /// Emits a DATA message to the dedicated DATA table.
    pub fn callback_data(&self, msg: &Msg<'_>) {
        self.dispatch(msg);
    }

    /// Emits a non-DATA message through the masked table.
    pub fn callback(&self, msg: &Msg<'_>) {
        self.dispatch(msg);
    }

    /// Adopts `child`, announcing it with CHANNEL/`ADD`. The child is owned
    /// by this channel from here on.
    pub fn child_add(&self, child: Channel) {
        let payload = ptr_payload(&child.0);
        debug!(channel = %self.name(), child = %child.name(), "child added");
        self.0.internal.children.lock().push(child);
        let msg = Msg {
            type_: MsgType::Channel,
            msgid: channel_msg::ADD,
            data: &payload,
            ..Default::default()
        };
        self.dispatch(&msg);
    }

    /// Removes a child, announcing CHANNEL/`DELETE` while it is still alive,
    /// then destroys it.
    ///
    /// # Errors
    ///
    /// `NOT_FOUND` when `child` is not on the child list.
    pub fn child_del(&self, child: &ChannelRef) -> Result<()> {
        let pos = {
            let children = self.0.internal.children.lock();
            children.iter().position(|c| ChannelRef::same(&c.0, child))
        };
        let Some(pos) = pos else {
            return Err(Error::NotFound(format!("child '{}'", child.name())));
        };
        let payload = ptr_payload(child);
        let msg = Msg {
            type_: MsgType::Channel,
            msgid: channel_msg::DELETE,
            data: &payload,
            ..Default::default()
        };
        self.dispatch(&msg);
        let removed = self.0.internal.children.lock().remove(pos);
        debug!(channel = %self.name(), child = %removed.name(), "child removed");
        drop(removed);
        Ok(())
    }

    /// Sets the channel name. Called by the context during instantiation.
    pub(crate) fn set_name(&self, name: &str) {
        *self.0.internal.name.write() = name.to_string();
    }

    /// Merges static caps. Implementations call this from `init`.
    pub fn caps_add(&self, caps: Caps) {
        *self.0.internal.caps.lock() |= caps;
    }

    /// Publishes (or clears) the channel fd. By contract the fd only changes
    /// during `Opening`/`Closing` transitions.
    pub fn fd_set(&self, fd: Option<RawFd>) {
        self.0.internal.fd.store(fd.unwrap_or(-1), Ordering::Release);
    }

    /// Attaches a stat block.
    pub fn stat_set(&self, stat: StatRef) {
        *self.0.internal.stat.lock() = Some(stat);
    }

    /// The attached stat block, if any.
    #[must_use]
    pub fn stat(&self) -> Option<StatRef> {
        self.0.internal.stat.lock().clone()
    }

    pub(crate) fn set_dump(&self, dump: bool) {
        self.0.internal.dump.store(dump, Ordering::Relaxed);
    }

    /// Non-blocking access to the implementation state, used by paired
    /// channels joining through a master. `None` while another operation
    /// holds the state.
    pub(crate) fn data_lock(
        &self,
    ) -> Option<parking_lot::MutexGuard<'_, Option<Box<dyn ChannelData>>>> {
        self.0.data.try_lock()
    }

    fn dispatch(&self, msg: &Msg<'_>) {
        if self.0.internal.dump.load(Ordering::Relaxed) && msg.type_ == MsgType::Data {
            debug!(
                channel = %self.name(),
                seq = msg.seq,
                size = msg.data.len(),
                "message"
            );
        }
        let is_data = msg.type_ == MsgType::Data;
        let table = if is_data {
            &self.0.internal.data_cbs
        } else {
            &self.0.internal.other_cbs
        };
        let want = msg.type_.mask();
        let mut i = 0;
        loop {
            let cb = {
                let guard = table.lock();
                match guard.slots.get(i) {
                    None => break,
                    Some(None) => None,
                    Some(Some(entry)) => {
                        if is_data || entry.mask.intersects(want) {
                            Some(entry.cb.clone())
                        } else {
                            None
                        }
                    }
                }
            };
            if let Some(cb) = cb {
                if let Err(e) = cb.message(self, msg) {
                    // a misbehaving subscriber must not poison the channel
                    debug!(channel = %self.name(), error = %e, "callback error ignored");
                }
            }
            i += 1;
        }
    }

    /// Recovers the channel announced by a CHANNEL `ADD`/`DELETE` message.
    ///
    /// # Safety
    ///
    /// The pointer in the payload is only valid for the duration of the
    /// callback delivering `msg`; calling this outside that window is
    /// undefined behavior.
    #[must_use]
    pub unsafe fn from_channel_msg(msg: &Msg<'_>) -> Option<ChannelRef> {
        if msg.type_ != MsgType::Channel {
            return None;
        }
        if msg.msgid != channel_msg::ADD && msg.msgid != channel_msg::DELETE {
            return None;
        }
        let bytes: [u8; 8] = msg.data.try_into().ok()?;
        let ptr = usize::from_ne_bytes(bytes) as *const ChannelShared;
        if ptr.is_null() {
            return None;
        }
        // SAFETY: the emitter holds the channel alive for the duration of
        // the call; we turn the borrow into an owned reference.
        unsafe {
            Arc::increment_strong_count(ptr);
            Some(ChannelRef(Arc::from_raw(ptr)))
        }
    }
}

fn ptr_payload(c: &ChannelRef) -> [u8; 8] {
    (Arc::as_ptr(&c.0) as usize).to_ne_bytes()
}

impl std::fmt::Debug for ChannelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name())
            .field("impl", &self.impl_ref().name)
            .field("state", &self.state())
            .finish()
    }
}

impl Channel {
    pub(crate) fn from_ref(inner: ChannelRef) -> Self {
        Self(inner)
    }

    /// A shared handle to this channel.
    #[must_use]
    pub fn handle(&self) -> ChannelRef {
        self.0.clone()
    }

    fn destroy(&self) {
        let dead = self.0 .0.data.try_lock().map_or(false, |guard| guard.is_none());
        if dead {
            return;
        }
        if self.state() != State::Closed {
            let _ = self.close(true);
        }
        // children first, depth before breadth
        loop {
            let child = self.0 .0.internal.children.lock().pop();
            let Some(child) = child else { break };
            let payload = ptr_payload(&child.0);
            let msg = Msg {
                type_: MsgType::Channel,
                msgid: channel_msg::DELETE,
                data: &payload,
                ..Default::default()
            };
            self.0.dispatch(&msg);
            drop(child);
        }
        self.0.state_set(State::Destroy);

        let context = self.0 .0.context.clone();
        if let Some(stat) = self.0 .0.internal.stat.lock().take() {
            context.stat_unlink(&stat);
        }
        if !self.caps().contains(Caps::CUSTOM) {
            let name = self.name();
            if !name.is_empty() {
                context.channel_unlink(&name, &self.0);
            }
        }
        // try_lock: destruction from inside one's own callback must not
        // deadlock; the state is dropped with the allocation either way
        let data = self.0 .0.data.try_lock().and_then(|mut guard| guard.take());
        if let Some(mut data) = data {
            data.free(&self.0);
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::ops::Deref for Channel {
    type Target = ChannelRef;

    fn deref(&self) -> &ChannelRef {
        &self.0
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.0, f)
    }
}
