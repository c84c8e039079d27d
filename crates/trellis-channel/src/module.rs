//! Dynamic module loading.
//!
//! A loadable module is a shared object exporting a [`ChannelModule`]
//! descriptor at a known symbol (conventionally `trellis_module`). The
//! descriptor is `repr(C)` and its impl list is a null-terminated pointer
//! array, so modules can be produced by any toolchain that can lay out four
//! words:
//!
//! ```ignore
//! static IMPLS: ImplArray<2> = ImplArray([&MY_PROTO_IMPL, std::ptr::null()]);
//!
//! #[no_mangle]
//! pub static trellis_module: ChannelModule = ChannelModule {
//!     flags: ModuleFlags::empty(),
//!     init: None,
//!     free: None,
//!     impls: IMPLS.as_ptr(),
//! };
//! ```
//!
//! `load` derives `lib<name>.so` from the path stem, opens it, optionally
//! reopens with global symbol visibility when the descriptor asks for it,
//! runs the init hook and registers every advertised implementation. The
//! same file loaded twice is recognized and silently ignored.

use std::path::{Path, PathBuf};

use bitflags::bitflags;
use libloading::Library;
use tracing::{debug, info};

use trellis_types::{Error, Result};

use crate::context::Context;
use crate::implement::Impl;

bitflags! {
    /// Module descriptor flags.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ModuleFlags: u32 {
        /// Reopen the module with global symbol visibility before init.
        const GLOBAL = 0x1;
    }
}

/// Module descriptor exported by a loadable shared object.
///
/// `impls` points at a null-terminated array of impl pointers, or is null
/// for a module with no implementations of its own.
#[repr(C)]
pub struct ChannelModule {
    /// Loader behavior flags.
    pub flags: ModuleFlags,
    /// Optional hook run once after loading, before registration.
    pub init: Option<fn(&Context) -> Result<()>>,
    /// Optional hook run when the owning context is dropped.
    pub free: Option<fn()>,
    /// Null-terminated implementation array; may be null.
    pub impls: *const *const Impl,
}

// descriptors are immutable statics; the pointers reference 'static data
unsafe impl Sync for ChannelModule {}

/// Null-terminated impl pointer array, shareable from a `static`.
#[repr(transparent)]
pub struct ImplArray<const N: usize>(pub [*const Impl; N]);

// the pointers reference 'static descriptors only
unsafe impl<const N: usize> Sync for ImplArray<N> {}

impl<const N: usize> ImplArray<N> {
    /// Pointer to the first element, for a descriptor's `impls` field.
    #[must_use]
    pub const fn as_ptr(&self) -> *const *const Impl {
        &self.0 as *const [*const Impl; N] as *const *const Impl
    }
}

pub(crate) struct LoadedModule {
    // keeps the shared object mapped for the life of the context
    _lib: Library,
    pub(crate) free: Option<fn()>,
}

impl Drop for LoadedModule {
    fn drop(&mut self) {
        if let Some(free) = self.free {
            free();
        }
    }
}

/// Turns `dir/name` into `dir/libname.so`.
fn module_path(path: &str) -> (String, PathBuf) {
    match path.rfind('/') {
        Some(sep) => {
            let name = &path[sep + 1..];
            (name.to_string(), PathBuf::from(format!("{}lib{}.so", &path[..=sep], name)))
        }
        None => (path.to_string(), PathBuf::from(format!("lib{path}.so"))),
    }
}

pub(crate) fn load(ctx: &Context, path: &str, symbol: &str) -> Result<()> {
    let (name, so_path) = module_path(path);
    debug!(module = name, path = %so_path.display(), "loading module");

    let canonical = so_path.canonicalize().unwrap_or_else(|_| so_path.clone());
    {
        let modules = ctx.inner.modules.lock();
        if modules.contains_key(&canonical) {
            info!(module = name, "module already loaded");
            return Ok(());
        }
    }

    // SAFETY: loading a shared object runs its constructors; modules are
    // trusted code supplied by the embedder.
    let lib = unsafe { Library::new(&so_path) }
        .map_err(|e| Error::invalid(format!("failed to load '{}': {e}", so_path.display())))?;

    // SAFETY: the symbol is a static descriptor baked into the module; its
    // fields are copied out before the library handle moves on.
    let (flags, init, free, impls) = unsafe {
        let symbol = lib
            .get::<*const ChannelModule>(symbol.as_bytes())
            .map_err(|_| Error::NoEntry(format!("symbol '{symbol}' in module '{name}'")))?;
        let descriptor: &ChannelModule = &**symbol;
        (
            descriptor.flags,
            descriptor.init,
            descriptor.free,
            descriptor.impls,
        )
    };

    if flags.contains(ModuleFlags::GLOBAL) {
        debug!(module = name, "reopening with global symbol visibility");
        reopen_global(&so_path)?;
    }

    if let Some(init) = init {
        init(ctx).map_err(|e| {
            Error::invalid(format!("module '{name}' init hook failed: {e}"))
        })?;
    }

    let mut registered = 0usize;
    if !impls.is_null() {
        let mut cursor = impls;
        // SAFETY: the descriptor promises a null-terminated array of
        // pointers to statics that live as long as the mapped module — and
        // the context keeps the module mapped for its own lifetime.
        unsafe {
            while !(*cursor).is_null() {
                ctx.register(&**cursor, None)?;
                registered += 1;
                cursor = cursor.add(1);
            }
        }
    }
    if registered == 0 && init.is_none() {
        info!(module = name, "no channels defined in module");
    }

    ctx.inner
        .modules
        .lock()
        .insert(canonical, LoadedModule { _lib: lib, free });
    Ok(())
}

#[cfg(unix)]
fn reopen_global(path: &Path) -> Result<()> {
    use libloading::os::unix::{Library as UnixLibrary, RTLD_GLOBAL, RTLD_NOW};
    // RTLD_NOLOAD is not exposed; reopening an already mapped object with
    // RTLD_GLOBAL only promotes its visibility.
    let lib = unsafe { UnixLibrary::open(Some(path), RTLD_GLOBAL | RTLD_NOW) }
        .map_err(|e| Error::invalid(format!("reopen with RTLD_GLOBAL failed: {e}")))?;
    std::mem::forget(lib);
    Ok(())
}

#[cfg(not(unix))]
fn reopen_global(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_path_mangling() {
        let (name, path) = module_path("plugins/custom");
        assert_eq!(name, "custom");
        assert_eq!(path, PathBuf::from("plugins/libcustom.so"));

        let (name, path) = module_path("custom");
        assert_eq!(name, "custom");
        assert_eq!(path, PathBuf::from("libcustom.so"));
    }

    #[test]
    fn load_missing_module_fails() {
        let ctx = Context::default();
        let err = ctx.load("./does-not-exist", "trellis_module").unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[test]
    fn impl_array_terminates() {
        static IMPLS: ImplArray<2> =
            ImplArray([&crate::builtin::NULL_IMPL as *const Impl, std::ptr::null()]);
        let ptr = IMPLS.as_ptr();
        // SAFETY: reading back the statically initialized array
        unsafe {
            assert!(!(*ptr).is_null());
            assert!((*ptr.add(1)).is_null());
        }
    }
}
