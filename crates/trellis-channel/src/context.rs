//! The channel context: registry, resolution and instantiation.
//!
//! A [`Context`] owns everything channels are made from:
//!
//! - a registry mapping protocol names to implementations or alias URL
//!   templates;
//! - the channel name index (weak — channel lifetime stays with the caller);
//! - a scheme cache with shared/exclusive locking;
//! - the table of dynamically loaded modules;
//! - config trees (live state per named channel, plus defaults);
//! - the stat list.
//!
//! Contexts are reference counted and cheap to clone. The default context is
//! created lazily and lives until process exit.
//!
//! # Protocol resolution
//!
//! A URL's protocol resolves to an impl directly, or through its
//! `prefix+` head, or through alias templates that merge their properties
//! into the URL and rewrite the protocol (composing `x+` with `y+` prefix
//! aliases). Aliases are acyclic by construction — registration requires the
//! target to resolve — but resolution still carries a generous hop bound so
//! a hand-built cycle fails instead of spinning.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use trellis_types::{
    Caps, Config, Error, MsgType, Result, Scheme, SchemeRef, Stat, StatRef, Url,
};

use crate::builtin;
use crate::channel::{Channel, ChannelRef, ChannelShared};
use crate::implement::{ChannelData, Impl, InitResult};
use crate::module::{self, LoadedModule};

/// Alias chains longer than this fail resolution.
const MAX_ALIAS_HOPS: usize = 64;

/// Registry entry: a concrete implementation or an alias URL template.
#[derive(Debug, Clone)]
enum RegistryEntry {
    Impl(&'static Impl),
    Alias(Url),
}

pub(crate) struct ContextInner {
    registry: RwLock<BTreeMap<String, RegistryEntry>>,
    channels: RwLock<BTreeMap<String, Weak<ChannelShared>>>,
    scheme_cache: RwLock<HashMap<String, SchemeRef>>,
    pub(crate) modules: Mutex<BTreeMap<std::path::PathBuf, LoadedModule>>,
    config: Mutex<BTreeMap<String, Config>>,
    config_defaults: Config,
    stats: Mutex<Vec<StatRef>>,
}

/// Reference-counted channel context.
#[derive(Clone)]
pub struct Context {
    pub(crate) inner: Arc<ContextInner>,
}

static DEFAULT: OnceLock<Context> = OnceLock::new();

impl Context {
    /// Creates a fresh context with the built-in protocols and the `mudp`
    /// alias registered.
    #[must_use]
    pub fn new(defaults: Config) -> Self {
        let ctx = Self {
            inner: Arc::new(ContextInner {
                registry: RwLock::new(BTreeMap::new()),
                channels: RwLock::new(BTreeMap::new()),
                scheme_cache: RwLock::new(HashMap::new()),
                modules: Mutex::new(BTreeMap::new()),
                config: Mutex::new(BTreeMap::new()),
                config_defaults: defaults,
                stats: Mutex::new(Vec::new()),
            }),
        };
        builtin::register_all(&ctx);
        if let Ok(url) = Url::parse("udp://;udp.multicast=yes") {
            let _ = ctx.alias_register("mudp", url);
        }
        ctx
    }

    /// The process-wide default context, created on first use and never
    /// freed.
    #[must_use]
    pub fn default_context() -> Self {
        DEFAULT.get_or_init(|| Self::new(Config::new())).clone()
    }

    /// `true` when both handles refer to the same context.
    #[must_use]
    pub fn same(a: &Context, b: &Context) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Default config values handed to implementations.
    #[must_use]
    pub fn config_defaults(&self) -> Config {
        self.inner.config_defaults.clone()
    }

    /// The live config of a named channel, mirrored by the context.
    #[must_use]
    pub fn config(&self, name: &str) -> Option<Config> {
        self.inner.config.lock().get(name).cloned()
    }

    // === Registry ===

    /// Registers an implementation under `name`, defaulting to its protocol
    /// name.
    ///
    /// # Errors
    ///
    /// `ALREADY_EXISTS` on a duplicate name.
    pub fn register(&self, impl_: &'static Impl, name: Option<&str>) -> Result<()> {
        let name = name.unwrap_or(impl_.name);
        debug!(impl_ = impl_.name, name, "register channel");
        let mut registry = self.inner.registry.write();
        if registry.contains_key(name) {
            return Err(Error::AlreadyExists(format!("protocol '{name}'")));
        }
        registry.insert(name.to_string(), RegistryEntry::Impl(impl_));
        Ok(())
    }

    /// Removes a registration, but only if the entry is an impl and points
    /// at this exact impl.
    ///
    /// # Errors
    ///
    /// `NOT_FOUND` for an unknown name, `INVALID` when the entry is an alias
    /// or a different impl.
    pub fn unregister(&self, impl_: &'static Impl, name: Option<&str>) -> Result<()> {
        let name = name.unwrap_or(impl_.name);
        let mut registry = self.inner.registry.write();
        let entry = registry
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("protocol '{name}'")))?;
        match entry {
            RegistryEntry::Alias(_) => Err(Error::invalid(format!(
                "'{name}' is an alias, not an impl"
            ))),
            RegistryEntry::Impl(registered) if !Impl::same(registered, impl_) => Err(
                Error::invalid(format!("'{name}' registered to a different impl")),
            ),
            RegistryEntry::Impl(_) => {
                registry.remove(name);
                Ok(())
            }
        }
    }

    /// Registers an alias URL template under `name`.
    ///
    /// The template must not carry the `name` or `tll.host` properties, and
    /// its protocol must resolve in the current registry. A host segment is
    /// allowed — an alias may point at a default target.
    ///
    /// # Errors
    ///
    /// `INVALID` on reserved properties, `NOT_FOUND` when the target
    /// protocol does not resolve, `ALREADY_EXISTS` on a duplicate name.
    pub fn alias_register(&self, name: &str, url: Url) -> Result<()> {
        if name.is_empty() {
            return Err(Error::invalid("empty alias name"));
        }
        for key in ["name", "tll.host"] {
            if url.get(key).is_some_and(|v| !v.is_empty()) {
                return Err(Error::invalid(format!(
                    "alias '{name}' has non-empty field '{key}'"
                )));
            }
        }
        let mut probe = url.clone();
        self.lookup(&mut probe)?;
        debug!(name, target = url.proto(), "register alias");
        let mut registry = self.inner.registry.write();
        if registry.contains_key(name) {
            return Err(Error::AlreadyExists(format!("alias '{name}'")));
        }
        registry.insert(name.to_string(), RegistryEntry::Alias(url));
        Ok(())
    }

    /// Removes an alias registration; refuses to touch impls.
    ///
    /// # Errors
    ///
    /// `NOT_FOUND` for an unknown name, `INVALID` when the entry is an impl
    /// or registered with a different protocol.
    pub fn alias_unregister(&self, name: &str, url: &Url) -> Result<()> {
        if name.is_empty() {
            return Err(Error::invalid("empty alias name"));
        }
        let mut registry = self.inner.registry.write();
        let entry = registry
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("alias '{name}'")))?;
        match entry {
            RegistryEntry::Impl(_) => Err(Error::invalid(format!(
                "'{name}' is an impl, not an alias"
            ))),
            RegistryEntry::Alias(stored) if stored.proto() != url.proto() => Err(Error::invalid(
                format!("alias '{name}' registered with protocol '{}'", stored.proto()),
            )),
            RegistryEntry::Alias(_) => {
                registry.remove(name);
                Ok(())
            }
        }
    }

    /// Direct impl lookup by registered name, ignoring aliases.
    #[must_use]
    pub fn impl_get(&self, name: &str) -> Option<&'static Impl> {
        match self.lookup_entry(name)? {
            RegistryEntry::Impl(i) => Some(i),
            RegistryEntry::Alias(_) => None,
        }
    }

    /// Registry hit for `proto`: exact name first, then its `prefix+` head.
    fn lookup_entry(&self, proto: &str) -> Option<RegistryEntry> {
        let registry = self.inner.registry.read();
        if let Some(entry) = registry.get(proto) {
            return Some(entry.clone());
        }
        let sep = proto.find('+')?;
        registry.get(&proto[..=sep]).cloned()
    }

    /// Resolves `url` to an implementation, following alias chains.
    ///
    /// Alias properties are merged into `url` (duplicates are an error,
    /// `tll.proto`/`tll.host` are skipped) and the protocol is rewritten —
    /// including `x+`/`y+` prefix composition — before resolution re-runs.
    /// On success `url.proto()` is the fully rewritten protocol.
    ///
    /// # Errors
    ///
    /// `NOT_FOUND` for an unknown protocol, `INVALID` on duplicate keys or
    /// an alias chain deeper than the hop bound.
    pub fn lookup(&self, url: &mut Url) -> Result<&'static Impl> {
        let mut proto = url.proto().to_string();
        for _ in 0..MAX_ALIAS_HOPS {
            let entry = self
                .lookup_entry(&proto)
                .ok_or_else(|| Error::NotFound(format!("protocol '{proto}'")))?;
            let alias = match entry {
                RegistryEntry::Impl(impl_) => {
                    url.set_proto(proto);
                    return Ok(impl_);
                }
                RegistryEntry::Alias(alias) => alias,
            };
            debug!(alias = alias.proto(), proto, "resolved alias");
            let aproto = alias.proto();
            let new_proto = match proto.find('+') {
                Some(sep) if aproto.ends_with('+') => {
                    format!("{aproto}{}", &proto[sep + 1..])
                }
                _ => aproto.to_string(),
            };
            for (key, value) in alias.iter() {
                if key == "tll.proto" || key == "tll.host" {
                    continue;
                }
                if url.has(key) {
                    return Err(Error::invalid(format!(
                        "duplicate field '{key}': both in alias '{aproto}' and in url"
                    )));
                }
                url.set(key.clone(), value.clone());
            }
            proto = new_proto;
        }
        Err(Error::invalid(format!(
            "alias chain deeper than {MAX_ALIAS_HOPS} hops resolving '{}'",
            url.proto()
        )))
    }

    // === Name index ===

    /// Finds an alive named channel.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<ChannelRef> {
        self.inner
            .channels
            .read()
            .get(name)
            .and_then(Weak::upgrade)
            .map(ChannelRef)
    }

    pub(crate) fn channel_unlink(&self, name: &str, chan: &ChannelRef) {
        let mut channels = self.inner.channels.write();
        if let Some(weak) = channels.get(name) {
            let matches = weak
                .upgrade()
                .map_or(true, |shared| Arc::ptr_eq(&shared, &chan.0));
            if matches {
                channels.remove(name);
            }
        }
        drop(channels);
        self.inner.config.lock().remove(name);
    }

    // === Instantiation ===

    /// Creates a channel from a URL string. See [`Context::new_channel_url`].
    pub fn new_channel(&self, url: &str) -> Result<Channel> {
        self.new_channel_url(Url::parse(url)?, None, None)
    }

    /// Creates a channel.
    ///
    /// The impl is resolved from the URL unless supplied. `tll.internal=yes`
    /// marks the channel `CUSTOM` and keeps it out of the name index. A
    /// `master=<name>` property resolves through the index when no explicit
    /// master is passed. The implementation may replace itself during init;
    /// a replacement already tried is a fatal initialization loop.
    ///
    /// # Errors
    ///
    /// Everything from resolution and init; `ALREADY_EXISTS` when the name
    /// is taken by an alive channel.
    pub fn new_channel_url(
        &self,
        url: Url,
        master: Option<&ChannelRef>,
        impl_: Option<&'static Impl>,
    ) -> Result<Channel> {
        let mut url = url;
        let impl_ = match impl_ {
            Some(impl_) => impl_,
            None => self.lookup(&mut url)?,
        };
        self.instantiate(url, master, impl_, None)
    }

    /// Creates a channel with pre-seeded implementation state. Used by
    /// server channels hatching already-connected children.
    pub fn new_channel_with(
        &self,
        url: Url,
        master: Option<&ChannelRef>,
        impl_: &'static Impl,
        data: Box<dyn ChannelData>,
    ) -> Result<Channel> {
        self.instantiate(url, master, impl_, Some(data))
    }

    fn instantiate(
        &self,
        url: Url,
        master: Option<&ChannelRef>,
        impl_: &'static Impl,
        data: Option<Box<dyn ChannelData>>,
    ) -> Result<Channel> {
        let internal = url.get_bool("tll.internal", false)?;

        let resolved_master: Option<ChannelRef> = match master {
            Some(m) => Some(m.clone()),
            None => match url.get("master") {
                Some(name) => Some(self.get(name).ok_or_else(|| {
                    Error::NotFound(format!("master '{name}'"))
                })?),
                None => None,
            },
        };

        let mut impl_cur = impl_;
        let mut data = data;
        let mut seen: Vec<*const Impl> = Vec::new();
        let chan = loop {
            let state = data.take().unwrap_or_else(|| (impl_cur.new_data)());
            let chan = ChannelRef::new(self.clone(), impl_cur, state);
            if let Some(name) = url.get("name") {
                chan.set_name(name);
            }
            debug!(impl_ = impl_cur.name, url = %url, "initialize channel");
            let result = {
                let mut guard = chan.0.data.lock();
                let state = guard.as_mut().expect("fresh channel has state");
                state.init(&chan, &url, resolved_master.as_ref(), self)
            };
            match result {
                Ok(InitResult::Ok) => break chan,
                Ok(InitResult::Replace(next)) => {
                    if Impl::same(next, impl_cur)
                        || seen.iter().any(|p| std::ptr::eq(*p, next))
                    {
                        return Err(Error::invalid(format!(
                            "loop in channel initialization at impl '{}'",
                            next.name
                        )));
                    }
                    info!(from = impl_cur.name, to = next.name, "reinitialize channel");
                    seen.push(impl_cur as *const Impl);
                    impl_cur = next;
                }
                Err(e) => return Err(e),
            }
        };

        if internal {
            chan.caps_add(Caps::CUSTOM);
        }
        chan.set_dump(url.get_bool("dump", false).unwrap_or(false));
        if chan.stat().is_none() && url.get_bool("stat", false)? {
            chan.stat_set(Stat::new());
        }

        let name = chan.name();
        chan.config().set("state", chan.state().to_string());
        chan.config().set("url", url.to_string());

        if !internal && !name.is_empty() {
            let mut channels = self.inner.channels.write();
            if channels
                .get(&name)
                .and_then(Weak::upgrade)
                .is_some()
            {
                return Err(Error::AlreadyExists(format!("channel '{name}'")));
            }
            channels.insert(name.clone(), Arc::downgrade(&chan.0));
            drop(channels);
            self.inner.config.lock().insert(name.clone(), chan.config());
        }

        if let Some(stat) = chan.stat() {
            if !name.is_empty() {
                stat.name_default(&name);
            }
            self.stat_attach(stat);
        }

        Ok(Channel::from_ref(chan))
    }

    // === Schemes ===

    /// Loads a scheme, optionally memoizing by URL.
    ///
    /// `channel://<name>` borrows the named channel's DATA scheme instead of
    /// loading. Cache reads take a shared lock; insertion is exclusive, and
    /// a losing second writer observes the winning entry.
    ///
    /// # Errors
    ///
    /// `NOT_FOUND` for an unknown channel or a channel without a scheme.
    pub fn scheme_load(&self, url: &str, cache: bool) -> Result<SchemeRef> {
        if let Some(name) = url.strip_prefix("channel://") {
            let chan = self
                .get(name)
                .ok_or_else(|| Error::NotFound(format!("channel '{name}'")))?;
            return chan
                .scheme(MsgType::Data)
                .ok_or_else(|| Error::NotFound(format!("channel '{name}' has no scheme")));
        }
        if !cache {
            return Scheme::load(url);
        }
        {
            let cache = self.inner.scheme_cache.read();
            if let Some(hit) = cache.get(url) {
                return Ok(hit.clone());
            }
        }
        let scheme = Scheme::load(url)?;
        let mut guard = self.inner.scheme_cache.write();
        Ok(guard
            .entry(url.to_string())
            .or_insert(scheme)
            .clone())
    }

    // === Modules ===

    /// Loads a shared-object module and registers the implementations it
    /// advertises. Loading the same file twice is a logged no-op.
    pub fn load(&self, path: &str, symbol: &str) -> Result<()> {
        module::load(self, path, symbol)
    }

    // === Stats ===

    pub(crate) fn stat_attach(&self, stat: StatRef) {
        info!(name = ?stat.name(), "register channel stat");
        self.inner.stats.lock().push(stat);
    }

    pub(crate) fn stat_unlink(&self, stat: &StatRef) {
        self.inner
            .stats
            .lock()
            .retain(|s| !Arc::ptr_eq(s, stat));
    }

    /// Snapshot of the registered stat blocks.
    #[must_use]
    pub fn stat_list(&self) -> Vec<StatRef> {
        self.inner.stats.lock().clone()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new(Config::new())
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("channels", &self.inner.channels.read().len())
            .field("protocols", &self.inner.registry.read().len())
            .finish()
    }
}
