//! The implementation contract: what a protocol plugs into the runtime.
//!
//! An [`Impl`] is the plug-in unit — a named descriptor with a constructor
//! for the protocol's private state. The state implements [`ChannelData`],
//! the operation table every channel is driven through. Implementations are
//! registered with a [`Context`](crate::Context) (directly or via a loaded
//! module) and matched by protocol name when a URL is instantiated.
//!
//! # Identity
//!
//! Impls are `'static` and compared by address: two registrations are "the
//! same impl" only when they point at the same descriptor. This is what
//! `unregister` and the init-replace loop detector check.
//!
//! # Init replacement
//!
//! `init` may decide the URL belongs to a different implementation (e.g. a
//! client/server split behind one protocol name) by returning
//! [`InitResult::Replace`]. The context restarts initialization with the
//! replacement; a repeat of an already-seen impl is a fatal initialization
//! loop.

use trellis_types::{Msg, MsgType, Result, SchemeRef, Url};

use crate::{ChannelRef, Context};

/// Implementation descriptor: protocol name plus private-state constructor.
///
/// Declared as a `static` so registry entries and channels can hold
/// `&'static Impl` and compare identity by address.
pub struct Impl {
    /// Protocol name used for registration when none is supplied.
    pub name: &'static str,
    /// Constructs the fresh private state for one channel.
    pub new_data: fn() -> Box<dyn ChannelData>,
}

impl Impl {
    /// Address identity.
    #[must_use]
    pub fn same(a: &'static Impl, b: &'static Impl) -> bool {
        std::ptr::eq(a, b)
    }
}

impl std::fmt::Debug for Impl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Impl").field("name", &self.name).finish()
    }
}

/// Outcome of [`ChannelData::init`].
pub enum InitResult {
    /// Initialization complete.
    Ok,
    /// Restart initialization with a different implementation.
    Replace(&'static Impl),
}

/// Operation table of a channel implementation.
///
/// One boxed instance per channel holds the protocol's private state. The
/// `base` argument is the channel the state belongs to: implementations use
/// it to set their name/caps/fd, transition state, update dcaps, announce
/// children and emit messages.
///
/// All methods run on the channel's owning loop thread; none may block — a
/// transport that would block arms its poll bits and returns
/// [`Error::Again`](trellis_types::Error::Again).
pub trait ChannelData: Send {
    /// Initializes the channel from its merged URL.
    ///
    /// Called once by the context before the channel is registered. May
    /// return [`InitResult::Replace`] to restart with a different impl.
    fn init(
        &mut self,
        base: &ChannelRef,
        url: &Url,
        master: Option<&ChannelRef>,
        ctx: &Context,
    ) -> Result<InitResult>;

    /// Starts the transition out of `Closed`. The base has already moved the
    /// channel to `Opening`; implementations that are ready immediately set
    /// `Active` themselves.
    fn open(&mut self, base: &ChannelRef, params: &Url) -> Result<()>;

    /// Starts (or forces) the transition to `Closed`. The base has already
    /// moved the channel to `Closing`; short-closing implementations set
    /// `Closed` before returning, long-closing ones finish from `process`.
    fn close(&mut self, base: &ChannelRef, force: bool) -> Result<()>;

    /// Makes forward progress. `Ok(())` means progress was made and the
    /// caller should come back; `Err(Again)` means no work right now.
    fn process(&mut self, base: &ChannelRef) -> Result<()>;

    /// Posts a message into the channel.
    fn post(&mut self, base: &ChannelRef, msg: &Msg<'_>) -> Result<()>;

    /// The channel's scheme for a message type, if any.
    fn scheme(&self, _type_: MsgType) -> Option<SchemeRef> {
        None
    }

    /// Downcasting hook for implementations that pair through a master
    /// (direct, mem, ipc). Override to expose the concrete state.
    fn as_any(&mut self) -> Option<&mut dyn std::any::Any> {
        None
    }

    /// Releases implementation resources. Runs once during destruction,
    /// after the `Destroy` state was announced.
    fn free(&mut self, _base: &ChannelRef) {}
}
