//! Latency-measuring prefix.
//!
//! `timeit+<inner>://…` forwards everything to the stacked channel and
//! tracks how long its `post` takes, logging a running average every 1024
//! posts. Zero configuration; stack it in front of any transport to get a
//! cheap latency probe.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tracing::info;

use trellis_types::{Msg, Result};

use crate::channel::ChannelRef;
use crate::implement::Impl;
use crate::prefix::{Prefix, PrefixHook};

/// `timeit+` — post-latency measuring prefix.
pub static TIMEIT_IMPL: Impl = Impl {
    name: "timeit+",
    new_data: || Box::new(Prefix::<TimeitHook>::default()),
};

const REPORT_EVERY: u64 = 1024;

#[derive(Default)]
pub(crate) struct TimeitHook {
    posts: AtomicU64,
    nanos: AtomicU64,
}

impl PrefixHook for TimeitHook {
    fn on_post(&self, parent: &ChannelRef, child: &ChannelRef, msg: &Msg<'_>) -> Result<()> {
        let start = Instant::now();
        let result = child.post(msg);
        let elapsed = start.elapsed().as_nanos() as u64;
        let posts = self.posts.fetch_add(1, Ordering::Relaxed) + 1;
        let nanos = self.nanos.fetch_add(elapsed, Ordering::Relaxed) + elapsed;
        if posts % REPORT_EVERY == 0 {
            info!(
                channel = %parent.name(),
                posts,
                avg_ns = nanos / posts,
                "post latency"
            );
        }
        result
    }
}
