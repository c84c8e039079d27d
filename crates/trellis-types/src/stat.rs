//! Lock-free per-channel traffic counters.
//!
//! A channel may register a [`Stat`] block at init; the context links it
//! into its stat list, defaulting the block's name to the channel's. The
//! post path acquires the page, bumps `tx`/`txb` and releases; acquisition
//! is a single atomic flag so a busy page is skipped rather than waited on.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Counter page. All fields are monotonic totals.
#[derive(Debug, Default)]
pub struct StatPage {
    /// Messages sent.
    pub tx: AtomicI64,
    /// Bytes sent.
    pub txb: AtomicI64,
    /// Messages received.
    pub rx: AtomicI64,
    /// Bytes received.
    pub rxb: AtomicI64,
}

/// Shared stat block.
#[derive(Debug, Default)]
pub struct Stat {
    name: Mutex<Option<String>>,
    busy: AtomicBool,
    page: StatPage,
}

/// Shared handle to a stat block.
pub type StatRef = Arc<Stat>;

impl Stat {
    /// New unnamed stat block.
    #[must_use]
    pub fn new() -> StatRef {
        Arc::new(Self::default())
    }

    /// The block's name, if set.
    #[must_use]
    pub fn name(&self) -> Option<String> {
        self.name.lock().clone()
    }

    /// Sets the name unless one is already present.
    pub fn name_default(&self, name: &str) {
        let mut guard = self.name.lock();
        if guard.is_none() {
            *guard = Some(name.to_string());
        }
    }

    /// Acquires the page for updating. Returns `None` while another writer
    /// holds it; callers skip the update rather than block.
    #[must_use]
    pub fn acquire(&self) -> Option<&StatPage> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(&self.page)
        } else {
            None
        }
    }

    /// Releases a page obtained from [`Stat::acquire`].
    pub fn release(&self) {
        self.busy.store(false, Ordering::Release);
    }

    /// Snapshot of (tx, txb, rx, rxb).
    #[must_use]
    pub fn snapshot(&self) -> (i64, i64, i64, i64) {
        (
            self.page.tx.load(Ordering::Relaxed),
            self.page.txb.load(Ordering::Relaxed),
            self.page.rx.load(Ordering::Relaxed),
            self.page.rxb.load(Ordering::Relaxed),
        )
    }
}

impl StatPage {
    /// Adds one message of `bytes` to the tx counters.
    pub fn update_tx(&self, bytes: usize) {
        self.tx.fetch_add(1, Ordering::Relaxed);
        self.txb.fetch_add(bytes as i64, Ordering::Relaxed);
    }

    /// Adds one message of `bytes` to the rx counters.
    pub fn update_rx(&self, bytes: usize) {
        self.rx.fetch_add(1, Ordering::Relaxed);
        self.rxb.fetch_add(bytes as i64, Ordering::Relaxed);
    }
}
