//! Channel contract, context registry and built-in transports.
//!
//! This crate is the middle layer of the trellis workspace: everything that
//! makes channel polymorphism correct and composable.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            Context                               │
//! │   registry: name → Impl | Alias        name index: name → chan   │
//! │   module loader        scheme cache        config mirror         │
//! └───────────────┬──────────────────────────────────────────────────┘
//!                 │ new_channel("prefix+tcp://…;name=x")
//!                 ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  Channel = &'static Impl + Box<dyn ChannelData> + bookkeeping    │
//! │   state machine   caps/dcaps   fd   children   callback tables   │
//! └───────────────┬──────────────────────────────────────────────────┘
//!                 │ STATE / CHANNEL / DATA messages
//!                 ▼
//!          subscribers (the processor loop among them)
//! ```
//!
//! # Core Concepts
//!
//! | Type | Purpose |
//! |------|---------|
//! | [`Context`] | Registry, resolution, instantiation, scheme cache |
//! | [`Channel`] / [`ChannelRef`] | Owning and shared channel handles |
//! | [`Impl`] / [`ChannelData`] | The plug-in unit and its operation table |
//! | [`ChannelCallback`] | Typed multi-subscriber message delivery |
//! | [`Prefix`] / [`PrefixHook`] | Base for `x+inner` stacked channels |
//! | [`ChannelModule`] | Descriptor exported by loadable modules |
//!
//! # Example
//!
//! ```
//! use trellis_channel::{testing, Context};
//! use trellis_types::{Msg, MsgMask, State};
//!
//! let ctx = Context::default();
//! ctx.register(&testing::ECHO_IMPL, None).unwrap();
//!
//! let chan = ctx.new_channel("echo://;name=e").unwrap();
//! let seen = testing::collect(&chan, MsgMask::DATA);
//!
//! chan.open("").unwrap();
//! assert_eq!(chan.state(), State::Opening);
//! chan.process().unwrap();
//! assert_eq!(chan.state(), State::Active);
//!
//! chan.post(&Msg::data(100, b"payload")).unwrap();
//! assert_eq!(seen.msgs()[0].seq, 100);
//! ```

pub mod builtin;
mod callback;
mod channel;
mod context;
mod event;
mod implement;
mod module;
mod prefix;
pub mod testing;

pub use callback::{callback_fn, CallbackRef, ChannelCallback};
pub use channel::{Channel, ChannelRef, ChannelWeak};
pub use context::Context;
pub use event::{Notifier, Notify};
pub use implement::{ChannelData, Impl, InitResult};
pub use module::{ChannelModule, ImplArray, ModuleFlags};
pub use prefix::{Prefix, PrefixHook};
