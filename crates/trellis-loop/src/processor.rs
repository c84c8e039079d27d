//! The readiness-driven processor loop.
//!
//! The loop keeps three collections: every adopted channel (`list`), the
//! channels carrying `PROCESS` (`list_p`) and the channels carrying
//! `PENDING` (`list_pending`). OS readiness comes from epoll; a self-notify
//! fd interleaves pending work with polling:
//!
//! ```text
//!             ┌───────────── epoll ─────────────┐
//!             │  fd → channel     self-notify   │
//!             └───────┬───────────────┬─────────┘
//!   poll(timeout) ────┘               │ armed ⟺ list_pending ≠ ∅
//!        │                            ▼
//!        ▼                     drain list_pending
//!   ready channel
//! ```
//!
//! The self-notify fd is kept permanently readable; arming and disarming
//! happen by toggling its epoll interest, so an empty pending list costs
//! nothing and a non-empty one makes any `poll` return immediately.
//!
//! The loop subscribes to every adopted channel with mask CHANNEL|STATE:
//! `Active`/`Closing` drive fd registration, `Destroy` deletes, CHANNEL
//! `ADD`/`DELETE` adopt and drop children, and CHANNEL `UPDATE` applies
//! dcap deltas. Composite channels (servers spawning connections, prefix
//! stacks) therefore plug in automatically once their root is added.

use std::collections::HashMap;
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::{Arc, Weak};
use std::time::Duration;

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use parking_lot::Mutex;
use tracing::{debug, warn};

use trellis_channel::{CallbackRef, ChannelCallback, ChannelRef, Notify};
use trellis_types::{channel_msg, DCaps, Error, Msg, MsgMask, MsgType, Result, State};

use crate::list::ChanList;

/// Cooperative scheduler for a set of channels.
///
/// Single-threaded by contract: `poll` and `process` are called from the
/// owning thread; channels belong to exactly one loop.
pub struct Loop {
    inner: Arc<LoopInner>,
    callback: CallbackRef,
}

struct LoopInner {
    epoll: Epoll,
    notify: Notify,
    list: Mutex<Vec<ChannelRef>>,
    list_p: Mutex<ChanList>,
    list_pending: Mutex<ChanList>,
    fds: Mutex<HashMap<RawFd, ChannelRef>>,
}

struct LoopCallback {
    inner: Weak<LoopInner>,
}

impl ChannelCallback for LoopCallback {
    fn message(&self, channel: &ChannelRef, msg: &Msg<'_>) -> Result<()> {
        let Some(inner) = self.inner.upgrade() else {
            return Ok(());
        };
        match msg.type_ {
            MsgType::State => match State::from_msgid(msg.msgid)? {
                State::Active => inner.poll_add(channel),
                State::Closing => inner.poll_del(channel),
                State::Destroy => inner.del(channel),
                _ => Ok(()),
            },
            MsgType::Channel => match msg.msgid {
                channel_msg::UPDATE => {
                    let bytes: [u8; 8] = msg
                        .data
                        .try_into()
                        .map_err(|_| Error::invalid("malformed dcaps update payload"))?;
                    let old = DCaps::from_bits_truncate(i64::from_le_bytes(bytes) as u32);
                    inner.update(channel, old)
                }
                channel_msg::ADD => {
                    // SAFETY: decoded inside the announcing callback, where
                    // the payload pointer is contractually alive
                    match unsafe { ChannelRef::from_channel_msg(msg) } {
                        Some(child) => inner.add(&child, &make_callback(&inner)),
                        None => Ok(()),
                    }
                }
                channel_msg::DELETE => {
                    match unsafe { ChannelRef::from_channel_msg(msg) } {
                        Some(child) => inner.del(&child),
                        None => Ok(()),
                    }
                }
                _ => Ok(()),
            },
            _ => Ok(()),
        }
    }
}

fn make_callback(inner: &Arc<LoopInner>) -> CallbackRef {
    Arc::new(LoopCallback {
        inner: Arc::downgrade(inner),
    })
}

impl Loop {
    /// Creates an empty loop.
    pub fn new() -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|e| Error::invalid(format!("epoll create failed: {e}")))?;
        let notify = Notify::new()?;
        // permanently readable; pending arms it by toggling epoll interest
        notify.notify()?;
        let event = EpollEvent::new(EpollFlags::empty(), notify.fd() as u64);
        // SAFETY: notify lives as long as the epoll registration
        epoll
            .add(unsafe { BorrowedFd::borrow_raw(notify.fd()) }, event)
            .map_err(|e| Error::invalid(format!("epoll add failed: {e}")))?;
        let inner = Arc::new(LoopInner {
            epoll,
            notify,
            list: Mutex::new(Vec::new()),
            list_p: Mutex::new(ChanList::default()),
            list_pending: Mutex::new(ChanList::default()),
            fds: Mutex::new(HashMap::new()),
        });
        let callback = make_callback(&inner);
        Ok(Self { inner, callback })
    }

    /// Adopts a channel: subscribes for lifecycle traffic, tracks its
    /// process/pending dcaps and registers its fd.
    pub fn add(&self, channel: &ChannelRef) -> Result<()> {
        self.inner.add(channel, &self.callback)
    }

    /// Drops a channel from every collection.
    pub fn del(&self, channel: &ChannelRef) -> Result<()> {
        self.inner.del(channel)
    }

    /// Blocks up to `timeout` for one readiness event.
    ///
    /// Returns the signalled channel for the caller to `process`, or `None`
    /// after a timeout — or after a self-notify wakeup, in which case the
    /// pending set has already been driven.
    pub fn poll(&self, timeout: Duration) -> Result<Option<ChannelRef>> {
        let mut events = [EpollEvent::empty()];
        let ms = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        let n = self
            .inner
            .epoll
            .wait(&mut events, EpollTimeout::from(ms))
            .map_err(|e| Error::invalid(format!("epoll wait failed: {e}")))?;
        if n == 0 {
            return Ok(None);
        }
        let fd = events[0].data() as RawFd;
        if fd == self.inner.notify.fd() {
            debug!("poll woke on pending list");
            for channel in self.inner.list_pending.lock().snapshot() {
                if let Err(e) = channel.process() {
                    if !e.is_again() {
                        warn!(channel = %channel.name(), error = %e, "pending process failed");
                    }
                }
            }
            return Ok(None);
        }
        let channel = self.inner.fds.lock().get(&fd).cloned();
        if let Some(ref c) = channel {
            debug!(channel = %c.name(), "poll ready");
        }
        Ok(channel)
    }

    /// Drives one round over the process and pending sets.
    ///
    /// # Errors
    ///
    /// `AGAIN` when every channel reported `AGAIN` — nothing to do without
    /// blocking.
    pub fn process(&self) -> Result<()> {
        let mut progress = false;
        let round = {
            let mut chans = self.inner.list_p.lock().snapshot();
            chans.extend(self.inner.list_pending.lock().snapshot());
            chans
        };
        for channel in round {
            match channel.process() {
                Ok(()) => progress = true,
                Err(Error::Again) => {}
                Err(e) => {
                    warn!(channel = %channel.name(), error = %e, "process failed");
                    progress = true;
                }
            }
        }
        if progress {
            Ok(())
        } else {
            Err(Error::Again)
        }
    }

    /// Channels currently adopted.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.list.lock().len()
    }

    /// `true` when no channel is adopted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.list.lock().is_empty()
    }
}

impl LoopInner {
    fn add(&self, channel: &ChannelRef, callback: &CallbackRef) -> Result<()> {
        debug!(channel = %channel.name(), fd = ?channel.fd(), "loop add");
        channel.callback_add(callback, MsgMask::CHANNEL | MsgMask::STATE);
        self.list.lock().push(channel.clone());
        let dcaps = channel.dcaps();
        if dcaps.contains(DCaps::PROCESS) {
            self.list_p.lock().add(channel);
        }
        if dcaps.contains(DCaps::PENDING) {
            self.pending_add(channel)?;
        }
        self.poll_add(channel)
    }

    fn del(&self, channel: &ChannelRef) -> Result<()> {
        debug!(channel = %channel.name(), "loop del");
        self.list
            .lock()
            .retain(|c| !ChannelRef::same(c, channel));
        self.list_p.lock().del(channel);
        self.pending_del(channel)?;
        self.poll_del(channel)
    }

    fn pending_add(&self, channel: &ChannelRef) -> Result<()> {
        let mut pending = self.list_pending.lock();
        let was_empty = pending.is_empty();
        if !pending.contains(channel) {
            pending.add(channel);
        }
        drop(pending);
        if was_empty {
            self.arm_notify(true)?;
        }
        Ok(())
    }

    fn pending_del(&self, channel: &ChannelRef) -> Result<()> {
        let mut pending = self.list_pending.lock();
        pending.del(channel);
        let empty = pending.is_empty();
        drop(pending);
        if empty {
            self.arm_notify(false)?;
        }
        Ok(())
    }

    fn arm_notify(&self, armed: bool) -> Result<()> {
        let flags = if armed {
            EpollFlags::EPOLLIN
        } else {
            EpollFlags::empty()
        };
        let mut event = EpollEvent::new(flags, self.notify.fd() as u64);
        // SAFETY: the notify fd outlives the registration
        self.epoll
            .modify(unsafe { BorrowedFd::borrow_raw(self.notify.fd()) }, &mut event)
            .map_err(|e| Error::invalid(format!("epoll modify failed: {e}")))
    }

    fn poll_events(dcaps: DCaps) -> EpollFlags {
        let mut flags = EpollFlags::empty();
        if !dcaps.contains(DCaps::SUSPEND) {
            if dcaps.contains(DCaps::POLLIN) {
                flags |= EpollFlags::EPOLLIN;
            }
            if dcaps.contains(DCaps::POLLOUT) {
                flags |= EpollFlags::EPOLLOUT;
            }
        }
        flags
    }

    fn poll_add(&self, channel: &ChannelRef) -> Result<()> {
        let Some(fd) = channel.fd() else {
            return Ok(());
        };
        let mut fds = self.fds.lock();
        let flags = Self::poll_events(channel.dcaps());
        let mut event = EpollEvent::new(flags, fd as u64);
        // SAFETY: the channel owns the fd; Closing/Destroy deregister it
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        if fds.contains_key(&fd) {
            self.epoll
                .modify(borrowed, &mut event)
                .map_err(|e| Error::invalid(format!("epoll modify failed: {e}")))?;
        } else {
            debug!(channel = %channel.name(), fd, "register fd");
            self.epoll
                .add(borrowed, event)
                .map_err(|e| Error::invalid(format!("epoll add failed: {e}")))?;
            fds.insert(fd, channel.clone());
        }
        Ok(())
    }

    fn poll_del(&self, channel: &ChannelRef) -> Result<()> {
        let mut fds = self.fds.lock();
        let Some((&fd, _)) = fds
            .iter()
            .find(|(_, c)| ChannelRef::same(c, channel))
        else {
            return Ok(());
        };
        fds.remove(&fd);
        // SAFETY: deregistration; the fd may already be gone, errors are moot
        let _ = self.epoll.delete(unsafe { BorrowedFd::borrow_raw(fd) });
        Ok(())
    }

    fn update(&self, channel: &ChannelRef, old: DCaps) -> Result<()> {
        let new = channel.dcaps();
        let delta = new ^ old;
        debug!(channel = %channel.name(), ?old, ?new, "dcaps update");
        if delta.intersects(DCaps::POLLMASK | DCaps::SUSPEND) && channel.fd().is_some() {
            self.poll_add(channel)?;
        }
        if delta.contains(DCaps::PROCESS) {
            if new.contains(DCaps::PROCESS) {
                self.list_p.lock().add(channel);
            } else {
                self.list_p.lock().del(channel);
            }
        }
        if delta.contains(DCaps::PENDING) {
            if new.contains(DCaps::PENDING) {
                self.pending_add(channel)?;
            } else {
                self.pending_del(channel)?;
            }
        }
        Ok(())
    }
}
