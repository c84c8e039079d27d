//! Base for prefix channels.
//!
//! A prefix channel's protocol is `X+<inner>`: it owns one child of protocol
//! `<inner>` and stacks behavior on top of it. This module provides the
//! common machinery — child creation and lifecycle translation — so a
//! concrete prefix only supplies a [`PrefixHook`]:
//!
//! - `on_init` mutates the child URL before creation;
//! - `on_post` wraps forwarding into the child;
//! - `on_data` / `on_other` translate upward traffic (default: re-emit);
//! - `on_active` / `on_error` / `on_closing` / `on_closed` follow the
//!   child's state machine (default: mirror it).
//!
//! At init the child URL keeps the outer host and properties, gets protocol
//! `<inner>`, name `<self>/X` and `tll.internal=yes`; `dump` and `stat` are
//! stripped because they describe outer instrumentation only. Open, close
//! and post forward to the child. Nothing distinguishes this generic base
//! from a framing or compression layer at the design level.

use std::sync::Arc;

use trellis_types::{Caps, Error, Msg, MsgType, Result, SchemeRef, State, Url};

use crate::callback::{CallbackRef, ChannelCallback};
use crate::channel::{ChannelRef, ChannelWeak};
use crate::context::Context;
use crate::implement::{ChannelData, InitResult};

/// Behavior hooks for a concrete prefix implementation.
///
/// Hooks take `&self`; stateful hooks keep interior mutability of their own
/// (the latency prefix counts with atomics, for example).
pub trait PrefixHook: Send + Sync + Default + 'static {
    /// Adjusts the child URL before the child is created.
    fn on_init(
        &self,
        _child_url: &mut Url,
        _url: &Url,
        _master: Option<&ChannelRef>,
    ) -> Result<()> {
        Ok(())
    }

    /// Forwards a posted message into the child.
    fn on_post(&self, _parent: &ChannelRef, child: &ChannelRef, msg: &Msg<'_>) -> Result<()> {
        child.post(msg)
    }

    /// Handles data coming up from the child.
    fn on_data(&self, parent: &ChannelRef, msg: &Msg<'_>) -> Result<()> {
        parent.callback_data(msg);
        Ok(())
    }

    /// Handles non-data, non-state messages from the child.
    fn on_other(&self, parent: &ChannelRef, msg: &Msg<'_>) -> Result<()> {
        parent.callback(msg);
        Ok(())
    }

    /// Child is ready; parent enters `Active` by default.
    fn on_active(&self, parent: &ChannelRef) -> Result<()> {
        parent.state_set(State::Active);
        Ok(())
    }

    /// Child broke; parent enters `Error` by default.
    fn on_error(&self, parent: &ChannelRef) -> Result<()> {
        parent.state_set(State::Error);
        Ok(())
    }

    /// Child started closing.
    fn on_closing(&self, parent: &ChannelRef) -> Result<()> {
        if matches!(parent.state(), State::Opening | State::Active) {
            parent.state_set(State::Closing);
        }
        Ok(())
    }

    /// Child finished closing.
    fn on_closed(&self, parent: &ChannelRef) -> Result<()> {
        if parent.state() == State::Closing {
            parent.state_set(State::Closed);
        }
        Ok(())
    }
}

/// Hook with the default behavior everywhere: a transparent prefix.
impl PrefixHook for () {}

/// Generic prefix channel state, parameterized by its hook.
pub struct Prefix<T: PrefixHook> {
    shared: Arc<T>,
    child: Option<ChannelRef>,
    subscription: Option<CallbackRef>,
}

impl<T: PrefixHook> Default for Prefix<T> {
    fn default() -> Self {
        Self {
            shared: Arc::new(T::default()),
            child: None,
            subscription: None,
        }
    }
}

struct PrefixCallback<T: PrefixHook> {
    hook: Arc<T>,
    parent: ChannelWeak,
}

impl<T: PrefixHook> ChannelCallback for PrefixCallback<T> {
    fn message(&self, _child: &ChannelRef, msg: &Msg<'_>) -> Result<()> {
        let Some(parent) = self.parent.upgrade() else {
            return Ok(());
        };
        match msg.type_ {
            MsgType::Data => self.hook.on_data(&parent, msg),
            MsgType::State => {
                let state = State::from_msgid(msg.msgid)?;
                match state {
                    State::Active => self.hook.on_active(&parent),
                    State::Error => self.hook.on_error(&parent),
                    State::Closing => self.hook.on_closing(&parent),
                    State::Closed => self.hook.on_closed(&parent),
                    // the parent drives its own Opening and Destroy
                    _ => Ok(()),
                }
            }
            _ => self.hook.on_other(&parent, msg),
        }
    }
}

impl<T: PrefixHook> Prefix<T> {
    fn child(&self) -> Result<&ChannelRef> {
        self.child
            .as_ref()
            .ok_or_else(|| Error::invalid("prefix channel has no child"))
    }
}

impl<T: PrefixHook> ChannelData for Prefix<T> {
    fn init(
        &mut self,
        base: &ChannelRef,
        url: &Url,
        master: Option<&ChannelRef>,
        ctx: &Context,
    ) -> Result<InitResult> {
        let proto = url.proto();
        let Some(sep) = proto.find('+') else {
            return Err(Error::invalid(format!(
                "invalid prefix url proto '{proto}': no + found"
            )));
        };
        let outer = &proto[..sep];
        let inner = &proto[sep + 1..];

        let mut child_url = url.clone();
        child_url.set_proto(inner);
        child_url.set("name", format!("{}/{}", base.name(), outer));
        child_url.set("tll.internal", "yes");
        // outer instrumentation only
        child_url.unset("dump");
        child_url.unset("stat");
        child_url.unset("master");

        self.shared.on_init(&mut child_url, url, master)?;

        let child = ctx.new_channel_url(child_url, master, None)?;
        let callback: CallbackRef = Arc::new(PrefixCallback {
            hook: self.shared.clone(),
            parent: base.downgrade(),
        });
        child.callback_add(&callback, trellis_types::MsgMask::ALL);
        self.subscription = Some(callback);
        self.child = Some(child.handle());
        base.caps_add(Caps::PROXY);
        base.child_add(child);
        Ok(InitResult::Ok)
    }

    fn open(&mut self, _base: &ChannelRef, params: &Url) -> Result<()> {
        self.child()?.open(&params.props_string())
    }

    fn close(&mut self, _base: &ChannelRef, force: bool) -> Result<()> {
        self.child()?.close(force)
    }

    fn process(&mut self, _base: &ChannelRef) -> Result<()> {
        Err(Error::Again)
    }

    fn post(&mut self, base: &ChannelRef, msg: &Msg<'_>) -> Result<()> {
        let child = self.child()?.clone();
        self.shared.on_post(base, &child, msg)
    }

    fn scheme(&self, type_: MsgType) -> Option<SchemeRef> {
        self.child.as_ref().and_then(|c| c.scheme(type_))
    }

    fn free(&mut self, _base: &ChannelRef) {
        self.subscription = None;
        self.child = None;
    }
}
