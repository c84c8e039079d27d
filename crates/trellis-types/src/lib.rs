//! Core types for the trellis channel runtime.
//!
//! This crate provides the boundary value types shared by every layer of the
//! workspace: messages, lifecycle states, capability bits, the portable
//! error taxonomy, channel URLs, config handles and scheme/stat blocks.
//!
//! # Crate Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  trellis-types  : Msg, State, Caps/DCaps, Error, Url  ◄── HERE
//! ├─────────────────────────────────────────────────────────────┤
//! │  trellis-channel: Channel contract, Context, built-ins       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  trellis-loop   : readiness-driven processor loop            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Core Concepts
//!
//! | Type | Purpose |
//! |------|---------|
//! | [`Msg`] / [`OwnedMsg`] | Immutable value passed on all channel edges |
//! | [`State`] | Six-state channel lifecycle |
//! | [`Caps`] / [`DCaps`] | Static and dynamic capability bits |
//! | [`Error`] | Portable error kinds with [`ErrorCode`] codes |
//! | [`Url`] | `proto://host;key=value` channel addresses |
//! | [`Config`] | Shared live-state trees mirrored by the context |
//!
//! # Example
//!
//! ```
//! use trellis_types::{Msg, MsgMask, MsgType, Url};
//!
//! let url = Url::parse("tcp://./s.sock;mode=server;name=srv").unwrap();
//! assert_eq!(url.proto(), "tcp");
//! assert_eq!(url.get("mode"), Some("server"));
//!
//! let msg = Msg::data(100, b"payload");
//! assert!(MsgMask::DATA.contains(msg.type_.mask()));
//! assert_eq!(msg.type_, MsgType::Data);
//! ```

mod caps;
mod config;
mod error;
mod message;
mod scheme;
mod state;
mod stat;
mod url;

pub use caps::{Caps, DCaps};
pub use config::Config;
pub use error::{assert_error_code, assert_error_codes, Error, ErrorCode, Result};
pub use message::{channel_msg, Addr, Msg, MsgMask, MsgType, OwnedMsg};
pub use scheme::{Scheme, SchemeRef};
pub use state::State;
pub use stat::{Stat, StatPage, StatRef};
pub use url::Url;
