//! Processor loop for trellis channels.
//!
//! The top layer of the workspace: a cooperative, readiness-driven
//! scheduler. Hand it the root channels of your graph; children announced
//! via CHANNEL messages (server connections, prefix internals) are adopted
//! automatically.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use trellis_channel::Context;
//! use trellis_loop::Loop;
//!
//! let ctx = Context::default();
//! let server = ctx
//!     .new_channel("tcp://./srv.sock;mode=server;name=srv")
//!     .unwrap();
//! server.open("").unwrap();
//!
//! let event_loop = Loop::new().unwrap();
//! event_loop.add(&server.handle()).unwrap();
//!
//! loop {
//!     if let Some(ready) = event_loop.poll(Duration::from_millis(100)).unwrap() {
//!         let _ = ready.process();
//!     }
//! }
//! ```

mod list;
mod processor;

pub use processor::Loop;
