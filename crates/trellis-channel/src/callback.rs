//! Multi-subscriber callback tables.
//!
//! Each channel carries two tables: one dedicated to DATA messages and one
//! for everything else. DATA is the hot path — its table is iterated without
//! mask checks. Entries are identified by the subscriber handle (`Arc`
//! pointer identity); adding the same handle again never duplicates, it only
//! widens the stored mask. Deleting clears mask bits, tombstones emptied
//! slots and truncates trailing tombstones, so a fully removed subscriber
//! leaves nothing behind.

use std::sync::Arc;

use trellis_types::{Error, Msg, MsgMask, Result};

use crate::ChannelRef;

/// A message subscriber.
///
/// Errors returned from `message` are logged and swallowed by the dispatch
/// path: a misbehaving subscriber must not poison the channel.
pub trait ChannelCallback: Send + Sync {
    /// Delivers one message. `channel` is the source; `msg.data` is only
    /// valid for the duration of this call.
    fn message(&self, channel: &ChannelRef, msg: &Msg<'_>) -> Result<()>;
}

/// Shared subscriber handle. Identity (for dedup and delete) is the `Arc`
/// allocation, so keep a clone of the handle you subscribed with.
pub type CallbackRef = Arc<dyn ChannelCallback>;

/// Wraps a closure as a [`ChannelCallback`].
pub fn callback_fn<F>(f: F) -> CallbackRef
where
    F: Fn(&ChannelRef, &Msg<'_>) -> Result<()> + Send + Sync + 'static,
{
    struct FnCallback<F>(F);
    impl<F> ChannelCallback for FnCallback<F>
    where
        F: Fn(&ChannelRef, &Msg<'_>) -> Result<()> + Send + Sync,
    {
        fn message(&self, channel: &ChannelRef, msg: &Msg<'_>) -> Result<()> {
            (self.0)(channel, msg)
        }
    }
    Arc::new(FnCallback(f))
}

pub(crate) struct Entry {
    pub cb: CallbackRef,
    pub mask: MsgMask,
}

/// Append-only vector with tombstone slots and lazy shrink.
#[derive(Default)]
pub(crate) struct CallbackTable {
    pub slots: Vec<Option<Entry>>,
}

impl CallbackTable {
    /// Add-or-update: an existing entry for the same handle widens its mask;
    /// otherwise the entry lands in the first tombstone, growing last.
    pub fn add(&mut self, cb: &CallbackRef, mask: MsgMask) {
        let mut empty = None;
        for (i, slot) in self.slots.iter_mut().enumerate() {
            match slot {
                Some(entry) if Arc::ptr_eq(&entry.cb, cb) => {
                    entry.mask |= mask;
                    return;
                }
                Some(_) => {}
                None => {
                    if empty.is_none() {
                        empty = Some(i);
                    }
                }
            }
        }
        let entry = Entry {
            cb: cb.clone(),
            mask,
        };
        match empty {
            Some(i) => self.slots[i] = Some(entry),
            None => self.slots.push(Some(entry)),
        }
    }

    /// Clears `mask` bits from the matching entry; removes it entirely when
    /// no bits remain.
    ///
    /// # Errors
    ///
    /// `NOT_FOUND` when no entry matches the handle.
    pub fn del(&mut self, cb: &CallbackRef, mask: MsgMask) -> Result<()> {
        for slot in self.slots.iter_mut() {
            let Some(entry) = slot else { continue };
            if !Arc::ptr_eq(&entry.cb, cb) {
                continue;
            }
            entry.mask &= !mask;
            if !entry.mask.is_empty() {
                return Ok(());
            }
            *slot = None;
            self.shrink();
            return Ok(());
        }
        Err(Error::NotFound("callback".into()))
    }

    /// Drops trailing tombstones.
    fn shrink(&mut self) {
        while matches!(self.slots.last(), Some(None)) {
            self.slots.pop();
        }
    }

    /// Number of live entries.
    #[cfg(test)]
    pub fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_types::MsgType;

    fn cb() -> CallbackRef {
        callback_fn(|_, _| Ok(()))
    }

    #[test]
    fn add_is_idempotent_and_widens_mask() {
        let mut table = CallbackTable::default();
        let handle = cb();
        table.add(&handle, MsgMask::STATE);
        table.add(&handle, MsgMask::CHANNEL);
        assert_eq!(table.live(), 1);
        let mask = table.slots[0].as_ref().unwrap().mask;
        assert_eq!(mask, MsgMask::STATE | MsgMask::CHANNEL);
    }

    #[test]
    fn del_clears_bits_then_slot() {
        let mut table = CallbackTable::default();
        let handle = cb();
        table.add(&handle, MsgMask::STATE | MsgMask::CHANNEL);
        table.del(&handle, MsgMask::STATE).unwrap();
        assert_eq!(table.live(), 1);
        table.del(&handle, MsgMask::CHANNEL).unwrap();
        assert_eq!(table.live(), 0);
        assert!(table.slots.is_empty(), "trailing tombstones truncated");
        assert!(table.del(&handle, MsgMask::ALL).is_err());
    }

    #[test]
    fn tombstone_reused_before_growth() {
        let mut table = CallbackTable::default();
        let first = cb();
        let second = cb();
        let third = cb();
        table.add(&first, MsgMask::ALL);
        table.add(&second, MsgMask::ALL);
        table.del(&first, MsgMask::ALL).unwrap();
        assert_eq!(table.slots.len(), 2);
        table.add(&third, MsgMask::ALL);
        assert_eq!(table.slots.len(), 2, "reused the tombstone");
        assert!(table.slots[0].is_some());
    }

    #[test]
    fn distinct_handles_do_not_dedup() {
        let mut table = CallbackTable::default();
        table.add(&cb(), MsgMask::DATA);
        table.add(&cb(), MsgMask::DATA);
        assert_eq!(table.live(), 2);
    }

    #[test]
    fn data_mask_bit_matches_type() {
        assert_eq!(MsgType::Data.mask(), MsgMask::DATA);
    }
}
