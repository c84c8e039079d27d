//! Scheme handles.
//!
//! A scheme is an out-of-band message type catalog attached to a channel.
//! Loading and parsing the catalog body is the scheme compiler's job and out
//! of scope here; the runtime only needs a shareable handle it can cache by
//! URL and hand between channels.

use std::sync::Arc;

use crate::{Error, Result};

/// Immutable scheme catalog, shared by reference.
#[derive(Debug, PartialEq, Eq)]
pub struct Scheme {
    url: String,
    body: String,
}

/// Shared scheme handle.
pub type SchemeRef = Arc<Scheme>;

impl Scheme {
    /// Loads a scheme from a URL.
    ///
    /// `inline://<body>` carries the catalog body in the URL itself; any
    /// other URL is kept as an opaque reference for the scheme compiler.
    ///
    /// # Errors
    ///
    /// `INVALID` on an empty URL.
    pub fn load(url: &str) -> Result<SchemeRef> {
        if url.is_empty() {
            return Err(Error::invalid("empty scheme url"));
        }
        let body = url.strip_prefix("inline://").unwrap_or("").to_string();
        Ok(Arc::new(Self {
            url: url.to_string(),
            body,
        }))
    }

    /// The URL this scheme was loaded from.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The inline catalog body, empty for non-inline URLs.
    #[must_use]
    pub fn body(&self) -> &str {
        &self.body
    }
}
