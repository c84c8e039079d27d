//! Channel lifecycle state machine.
//!
//! ```text
//! ┌────────┐  open   ┌─────────┐  ready  ┌────────┐
//! │ Closed │ ──────► │ Opening │ ──────► │ Active │
//! └───┬────┘         └────┬────┘         └───┬────┘
//!     │                   │                  │ close
//!     │ destroy           │                  ▼
//!     ▼                   │             ┌─────────┐
//! ┌─────────┐             │             │ Closing │ ──► Closed
//! │ Destroy │             └──► Error ◄──┴─────────┘
//! └─────────┘      (reachable from any non-terminal state)
//! ```
//!
//! Every transition is announced as a STATE message whose `msgid` is the new
//! state, so observers (including the processor loop) learn about lifecycle
//! changes through the ordinary callback path.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Channel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum State {
    /// Closed; may transition to Opening or Destroy.
    #[default]
    Closed = 0,
    /// Open in progress; may transition to Active or Error.
    Opening = 1,
    /// Fully operational; may transition to Closing or Error.
    Active = 2,
    /// Close in progress; may transition to Closed or Error.
    Closing = 3,
    /// Broken; may transition to Closed.
    Error = 4,
    /// Terminal state before the object is destroyed.
    Destroy = 5,
}

impl State {
    /// Decodes a STATE message id.
    pub fn from_msgid(msgid: i32) -> Result<Self> {
        match msgid {
            0 => Ok(Self::Closed),
            1 => Ok(Self::Opening),
            2 => Ok(Self::Active),
            3 => Ok(Self::Closing),
            4 => Ok(Self::Error),
            5 => Ok(Self::Destroy),
            other => Err(Error::invalid(format!("unknown state id {other}"))),
        }
    }

    /// `true` for Closed and Destroy.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Destroy)
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Closed => "Closed",
            Self::Opening => "Opening",
            Self::Active => "Active",
            Self::Closing => "Closing",
            Self::Error => "Error",
            Self::Destroy => "Destroy",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msgid_round_trip() {
        for s in [
            State::Closed,
            State::Opening,
            State::Active,
            State::Closing,
            State::Error,
            State::Destroy,
        ] {
            assert_eq!(State::from_msgid(s as i32).unwrap(), s);
        }
        assert!(State::from_msgid(42).is_err());
    }

    #[test]
    fn display_names() {
        assert_eq!(State::Active.to_string(), "Active");
        assert_eq!(State::Destroy.to_string(), "Destroy");
    }
}
