//! Message value types passed on every channel edge.
//!
//! [`Msg`] is the borrowed view handed to callbacks: the payload slice is
//! valid only for the duration of the call. Subscribers that need the data
//! afterwards copy it into an [`OwnedMsg`].
//!
//! # Message Types
//!
//! | Type | Purpose |
//! |------|---------|
//! | `Data` | Normal payload traffic (the hot path) |
//! | `Control` | Channel-specific control (cache flush, seek, ...) |
//! | `State` | Lifecycle updates, `msgid` = new [`State`](crate::State) |
//! | `Channel` | Internal updates: dcaps changes, child add/delete |
//!
//! CHANNEL messages use [`channel_msg`] ids: `UPDATE` carries the previous
//! dcaps as a little-endian i64; `ADD`/`DELETE` carry a pointer to the
//! affected channel that is valid only during the callback.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Opaque 64-bit routing token. Its meaning is transport-defined: the TCP
/// server uses it to select a connection, the IPC server a client queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Addr(pub i64);

impl From<i64> for Addr {
    fn from(v: i64) -> Self {
        Self(v)
    }
}

/// Message type discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum MsgType {
    /// Data message with payload.
    #[default]
    Data = 0,
    /// Control message, if supported by the channel.
    Control = 1,
    /// State update, `msgid` equal to the new state.
    State = 2,
    /// Channel internal update: dcaps or child list changes.
    Channel = 3,
}

impl MsgType {
    /// The mask bit selecting this message type.
    #[must_use]
    pub fn mask(self) -> MsgMask {
        MsgMask::from_bits_truncate(1 << self as u32)
    }
}

/// Message ids for [`MsgType::Channel`] messages.
pub mod channel_msg {
    /// Dcaps changed; payload is the previous dcaps bits as i64 LE.
    pub const UPDATE: i32 = 0;
    /// New child channel; payload is a pointer valid only during the call.
    pub const ADD: i32 = 1;
    /// Child channel removed; payload as for `ADD`.
    pub const DELETE: i32 = 2;
}

bitflags! {
    /// Bitwise selection of message types for callback subscriptions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MsgMask: u32 {
        /// Data messages.
        const DATA = 1 << MsgType::Data as u32;
        /// Control messages.
        const CONTROL = 1 << MsgType::Control as u32;
        /// State messages.
        const STATE = 1 << MsgType::State as u32;
        /// Child channel updates.
        const CHANNEL = 1 << MsgType::Channel as u32;
        /// All message types.
        const ALL = !0;
    }
}

/// Borrowed message view.
///
/// `data` is only guaranteed alive for the duration of the callback call;
/// copy via [`OwnedMsg::from`] to keep it.
#[derive(Debug, Clone, Copy, Default)]
pub struct Msg<'a> {
    /// Message type.
    pub type_: MsgType,
    /// Message id; for STATE messages the new state as i32.
    pub msgid: i32,
    /// Sequence number. Monotonic by convention, not enforced by the core.
    pub seq: i64,
    /// User-defined flags.
    pub flags: u16,
    /// Borrowed payload.
    pub data: &'a [u8],
    /// Opaque routing token.
    pub addr: Addr,
}

impl<'a> Msg<'a> {
    /// Data message with payload and sequence number.
    #[must_use]
    pub fn data(seq: i64, data: &'a [u8]) -> Self {
        Self {
            type_: MsgType::Data,
            seq,
            data,
            ..Default::default()
        }
    }

    /// Copies meta info (type, msgid, seq, addr) from another message,
    /// leaving payload and flags untouched.
    pub fn copy_info(&mut self, src: &Msg<'_>) {
        self.type_ = src.type_;
        self.msgid = src.msgid;
        self.seq = src.seq;
        self.addr = src.addr;
    }
}

/// Heap-owning message, the copying counterpart of [`Msg`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnedMsg {
    /// Message type.
    pub type_: MsgType,
    /// Message id.
    pub msgid: i32,
    /// Sequence number.
    pub seq: i64,
    /// User-defined flags.
    pub flags: u16,
    /// Owned payload.
    pub data: Vec<u8>,
    /// Opaque routing token.
    pub addr: Addr,
}

impl OwnedMsg {
    /// Borrowed view of this message.
    #[must_use]
    pub fn view(&self) -> Msg<'_> {
        Msg {
            type_: self.type_,
            msgid: self.msgid,
            seq: self.seq,
            flags: self.flags,
            data: &self.data,
            addr: self.addr,
        }
    }
}

impl From<&Msg<'_>> for OwnedMsg {
    fn from(m: &Msg<'_>) -> Self {
        Self {
            type_: m.type_,
            msgid: m.msgid,
            seq: m.seq,
            flags: m.flags,
            data: m.data.to_vec(),
            addr: m.addr,
        }
    }
}
