//! Compact channel list with tombstone slots.
//!
//! Deletion nulls the slot (O(1), no shifting while the loop iterates);
//! trailing nulls are truncated lazily and insertion prefers a null slot
//! before growing. Iteration tolerates tombstones.

use trellis_channel::ChannelRef;

#[derive(Default)]
pub(crate) struct ChanList {
    slots: Vec<Option<ChannelRef>>,
}

impl ChanList {
    /// Inserts into the first tombstone, growing last.
    pub fn add(&mut self, c: &ChannelRef) {
        for slot in self.slots.iter_mut() {
            if slot.is_none() {
                *slot = Some(c.clone());
                return;
            }
        }
        self.slots.push(Some(c.clone()));
    }

    /// Nulls the matching slot and truncates trailing tombstones.
    pub fn del(&mut self, c: &ChannelRef) {
        for slot in self.slots.iter_mut() {
            if slot.as_ref().is_some_and(|s| ChannelRef::same(s, c)) {
                *slot = None;
                break;
            }
        }
        while matches!(self.slots.last(), Some(None)) {
            self.slots.pop();
        }
    }

    pub fn contains(&self, c: &ChannelRef) -> bool {
        self.slots
            .iter()
            .any(|slot| slot.as_ref().is_some_and(|s| ChannelRef::same(s, c)))
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Snapshot of the live entries in slot order.
    pub fn snapshot(&self) -> Vec<ChannelRef> {
        self.slots.iter().flatten().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_channel::Context;

    fn chan(ctx: &Context, name: &str) -> trellis_channel::Channel {
        ctx.new_channel(&format!("null://;name={name}")).unwrap()
    }

    #[test]
    fn add_del_reuses_slots() {
        let ctx = Context::default();
        let a = chan(&ctx, "list-a");
        let b = chan(&ctx, "list-b");
        let c = chan(&ctx, "list-c");

        let mut list = ChanList::default();
        list.add(&a.handle());
        list.add(&b.handle());
        assert_eq!(list.slots.len(), 2);

        list.del(&a.handle());
        assert!(!list.contains(&a.handle()));
        assert_eq!(list.slots.len(), 2, "tombstone kept for reuse");

        list.add(&c.handle());
        assert_eq!(list.slots.len(), 2, "tombstone reused");
        assert!(list.contains(&c.handle()));
    }

    #[test]
    fn trailing_tombstones_truncate() {
        let ctx = Context::default();
        let a = chan(&ctx, "list-t-a");
        let b = chan(&ctx, "list-t-b");

        let mut list = ChanList::default();
        list.add(&a.handle());
        list.add(&b.handle());
        list.del(&b.handle());
        assert_eq!(list.slots.len(), 1);
        list.del(&a.handle());
        assert!(list.slots.is_empty());
        assert!(list.is_empty());
    }

    #[test]
    fn snapshot_skips_tombstones() {
        let ctx = Context::default();
        let a = chan(&ctx, "list-s-a");
        let b = chan(&ctx, "list-s-b");
        let c = chan(&ctx, "list-s-c");

        let mut list = ChanList::default();
        list.add(&a.handle());
        list.add(&b.handle());
        list.add(&c.handle());
        list.del(&b.handle());

        let snap = list.snapshot();
        assert_eq!(snap.len(), 2);
        assert!(ChannelRef::same(&snap[0], &a.handle()));
        assert!(ChannelRef::same(&snap[1], &c.handle()));
    }
}
