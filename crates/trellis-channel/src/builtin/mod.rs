//! Built-in channel implementations.
//!
//! Registered into every fresh [`Context`](crate::Context):
//!
//! | proto | behavior |
//! |-------|----------|
//! | `null` | accepts posts, never emits |
//! | `zero` | emits zero-filled messages on every process |
//! | `direct` | paired in-process endpoints, post on one emits on the other |
//! | `mem` | in-process queue pair driving the loop's pending set |
//! | `ipc` | cross-thread client/server over lock-free queues |
//! | `tcp` | framed stream transport, unix and inet, server spawns children |
//! | `udp` | framed datagram transport, optional multicast |
//! | `serial` | raw character device |
//! | `timer` | timerfd expirations as messages |
//! | `yaml` | scripted message replay from a YAML file |
//! | `timeit+` | prefix measuring post latency of the stacked channel |
//! | `loader` | loads a module into the context at init |
//!
//! plus the `mudp` alias for `udp://;udp.multicast=yes`.

mod direct;
mod ipc;
mod loader;
mod mem;
mod null;
mod serial;
mod tcp;
mod timeit;
mod timer;
mod udp;
mod yaml;
mod zero;

pub use direct::DIRECT_IMPL;
pub use ipc::{IPC_IMPL, IPC_SERVER_IMPL};
pub use loader::LOADER_IMPL;
pub use mem::MEM_IMPL;
pub use null::NULL_IMPL;
pub use serial::SERIAL_IMPL;
pub use tcp::{TCP_IMPL, TCP_SERVER_IMPL};
pub use timeit::TIMEIT_IMPL;
pub use timer::TIMER_IMPL;
pub use udp::UDP_IMPL;
pub use yaml::YAML_IMPL;
pub use zero::ZERO_IMPL;

use crate::context::Context;

pub(crate) fn register_all(ctx: &Context) {
    for impl_ in [
        &DIRECT_IMPL,
        &IPC_IMPL,
        &LOADER_IMPL,
        &MEM_IMPL,
        &NULL_IMPL,
        &SERIAL_IMPL,
        &TCP_IMPL,
        &TIMEIT_IMPL,
        &TIMER_IMPL,
        &UDP_IMPL,
        &YAML_IMPL,
        &ZERO_IMPL,
    ] {
        // a fresh registry cannot collide with itself
        let _ = ctx.register(impl_, None);
    }
}
