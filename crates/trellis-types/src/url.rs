//! Channel URL parsing and property access.
//!
//! Syntax: `proto://host;key=value;key=value;…`. The protocol may contain
//! `+` to denote prefix stacking (`prefix+inner://…`). Reserved keys
//! understood by the core:
//!
//! | key | meaning |
//! |-----|---------|
//! | `name` | Channel identity in the context name index |
//! | `master` | Name of an existing channel passed as master to init |
//! | `tll.internal` | `yes`: channel is Custom and hidden from the index |
//! | `tll.proto`, `tll.host` | Reserved; not permitted in alias URLs |
//! | `dump`, `stat` | Instrumentation hints, stripped when cascading into a child |
//!
//! Properties keep insertion-independent ordering (sorted map) so a URL has
//! one canonical string form.

use std::collections::{btree_map, BTreeMap};

use crate::{Error, Result};

/// Parsed channel URL: protocol, host and a sorted property map.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Url {
    proto: String,
    host: String,
    props: BTreeMap<String, String>,
}

impl Url {
    /// Parses `proto://host;key=value;…`.
    ///
    /// # Errors
    ///
    /// `INVALID` when the `://` separator is missing, a property has no `=`,
    /// or a key is empty or duplicated.
    pub fn parse(s: &str) -> Result<Self> {
        let (proto, rest) = s
            .split_once("://")
            .ok_or_else(|| Error::invalid(format!("url '{s}': missing '://'")))?;
        if proto.is_empty() {
            return Err(Error::invalid(format!("url '{s}': empty protocol")));
        }
        let mut parts = rest.split(';');
        let host = parts.next().unwrap_or("").to_string();
        let mut props = BTreeMap::new();
        for part in parts {
            if part.is_empty() {
                continue;
            }
            let (k, v) = part
                .split_once('=')
                .ok_or_else(|| Error::invalid(format!("url '{s}': property '{part}' has no '='")))?;
            if k.is_empty() {
                return Err(Error::invalid(format!("url '{s}': empty property key")));
            }
            if props.insert(k.to_string(), v.to_string()).is_some() {
                return Err(Error::invalid(format!("url '{s}': duplicate key '{k}'")));
            }
        }
        Ok(Self {
            proto: proto.to_string(),
            host,
            props,
        })
    }

    /// The protocol part, possibly containing `+`.
    #[must_use]
    pub fn proto(&self) -> &str {
        &self.proto
    }

    /// Replaces the protocol.
    pub fn set_proto(&mut self, proto: impl Into<String>) {
        self.proto = proto.into();
    }

    /// The host part (may be empty).
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Replaces the host.
    pub fn set_host(&mut self, host: impl Into<String>) {
        self.host = host.into();
    }

    /// Property lookup.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.props.get(key).map(String::as_str)
    }

    /// `true` if the key is present.
    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.props.contains_key(key)
    }

    /// Sets a property, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.props.insert(key.into(), value.into());
    }

    /// Removes a property.
    pub fn unset(&mut self, key: &str) {
        self.props.remove(key);
    }

    /// Iterates properties in sorted key order.
    pub fn iter(&self) -> btree_map::Iter<'_, String, String> {
        self.props.iter()
    }

    /// The properties alone as `key=value;…`, the form `open` accepts.
    #[must_use]
    pub fn props_string(&self) -> String {
        self.props
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(";")
    }

    /// Boolean property: `yes`/`true`/`1` and `no`/`false`/`0`.
    ///
    /// # Errors
    ///
    /// `INVALID` on any other value.
    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key) {
            None => Ok(default),
            Some("yes") | Some("true") | Some("1") => Ok(true),
            Some("no") | Some("false") | Some("0") => Ok(false),
            Some(v) => Err(Error::invalid(format!(
                "invalid boolean value '{v}' for '{key}'"
            ))),
        }
    }

    /// Typed property via `FromStr`.
    ///
    /// # Errors
    ///
    /// `INVALID` when the value does not parse.
    pub fn get_typed<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => v
                .parse()
                .map_err(|_| Error::invalid(format!("invalid value '{v}' for '{key}'"))),
        }
    }
}

impl std::fmt::Display for Url {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.proto, self.host)?;
        for (k, v) in &self.props {
            write!(f, ";{k}={v}")?;
        }
        Ok(())
    }
}
