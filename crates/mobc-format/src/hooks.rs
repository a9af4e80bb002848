//! Process-wide load/save hooks.
//!
//! Hosts that dispatch on artifact kind look the hooks up instead of linking
//! against this crate's functions directly. Registration happens once; later
//! calls return the same table.

use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        OnceLock,
    },
};

use mobc_core::{BackingBuffer, Module};
use tracing::debug;

use crate::{api, settings::Settings, upgrader::UpgraderRegistry, ExtraFiles, Result};

/// Save `module` through a writer callback (`debug_info` keeps line tables).
pub type SaveHook = fn(&Module, &ExtraFiles, bool, &mut dyn FnMut(&[u8]) -> usize) -> Result<()>;

/// Build a module from an artifact buffer.
pub type LoadHook = fn(BackingBuffer, &mut ExtraFiles) -> Result<Module>;

/// Installed hook table.
#[derive(Clone, Copy)]
pub struct Hooks {
    /// Save entry point.
    pub save: SaveHook,
    /// Load entry point.
    pub load: LoadHook,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("save", &(self.save as *const ()))
            .field("load", &(self.load as *const ()))
            .finish()
    }
}

static HOOKS: OnceLock<Hooks> = OnceLock::new();
static INITIALISED: AtomicUsize = AtomicUsize::new(0);

fn save_through(module: &Module, extra: &ExtraFiles, debug_info: bool, writer: &mut dyn FnMut(&[u8]) -> usize) -> Result<()> {
    api::save_with_writer_fn(module, extra, debug_info, |bytes| writer(bytes))
}

/// Install the hooks (and warm the settings and the builtin upgraders).
/// Idempotent.
pub fn register_all() -> &'static Hooks {
    HOOKS.get_or_init(|| {
        INITIALISED.fetch_add(1, Ordering::SeqCst);
        let settings = Settings::global();
        let upgraders = UpgraderRegistry::builtin().len();
        debug!(?settings, upgraders, "load/save hooks registered");
        Hooks { save: save_through, load: api::load }
    })
}

/// Hooks, if [`register_all`] ran.
pub fn registered_hooks() -> Option<&'static Hooks> { HOOKS.get() }

/// How many times the registration body ran (0 or 1).
pub fn registration_count() -> usize { INITIALISED.load(Ordering::SeqCst) }
