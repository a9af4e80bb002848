//! Process settings and per-call options.
//!
//! Settings are resolved once (environment, or an explicit
//! [`Settings::install`] before first use) and read everywhere afterwards.

use std::sync::OnceLock;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::upgrader::UpgraderRegistry;

/// `MOBC_UPGRADERS=0` disables upgrading of old bytecode.
pub const ENV_UPGRADERS: &str = "MOBC_UPGRADERS";
/// `MOBC_DEBUG_INFO=1` keeps line tables on save.
pub const ENV_DEBUG_INFO: &str = "MOBC_DEBUG_INFO";
/// `MOBC_EMIT_SOURCE=0` omits the source bundle on save.
pub const ENV_EMIT_SOURCE: &str = "MOBC_EMIT_SOURCE";

/// Process-wide toggles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct Settings {
    /// Rewrite bytecode saved by older schema versions on load.
    pub upgraders_enabled: bool,
    /// Keep method line tables when saving.
    pub include_debug_info: bool,
    /// Embed the source bundle when saving.
    pub emit_source: bool,
}

impl Default for Settings {
    fn default() -> Self { Self { upgraders_enabled: true, include_debug_info: false, emit_source: true } }
}

static GLOBAL: OnceLock<Settings> = OnceLock::new();

impl Settings {
    /// Defaults overridden by the `MOBC_*` environment variables.
    pub fn from_env() -> Self { Self::from_lookup(|key| std::env::var(key).ok()) }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let flag = |key: &str, default: bool| match lookup(key) {
            None => default,
            Some(raw) => parse_flag(&raw).unwrap_or_else(|| {
                warn!(key, value = %raw, "ignoring unrecognised boolean setting");
                default
            }),
        };
        Self {
            upgraders_enabled: flag(ENV_UPGRADERS, d.upgraders_enabled),
            include_debug_info: flag(ENV_DEBUG_INFO, d.include_debug_info),
            emit_source: flag(ENV_EMIT_SOURCE, d.emit_source),
        }
    }

    /// Settings in effect for this process.
    pub fn global() -> &'static Self {
        GLOBAL.get_or_init(|| {
            let settings = Self::from_env();
            debug!(?settings, "settings resolved from environment");
            settings
        })
    }

    /// Pin the process settings. Fails (returning `self`) once they have been
    /// installed or read.
    pub fn install(self) -> Result<(), Self> { GLOBAL.set(self) }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

/// Options of one save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SaveOptions {
    /// Keep line tables.
    pub include_debug_info: bool,
    /// Embed the source bundle.
    pub emit_source: bool,
}

impl From<&Settings> for SaveOptions {
    fn from(s: &Settings) -> Self { Self { include_debug_info: s.include_debug_info, emit_source: s.emit_source } }
}

/// Defaults follow [`Settings::global`].
impl Default for SaveOptions {
    fn default() -> Self { Self::from(Settings::global()) }
}

/// Options of one load.
#[derive(Debug, Clone, Copy)]
pub struct LoadOptions<'r> {
    /// Upgrade bytecode saved by an older schema version.
    pub apply_upgraders: bool,
    /// Upgraders to apply.
    pub registry: &'r UpgraderRegistry,
}

/// Defaults follow [`Settings::global`] and use the builtin registry.
impl Default for LoadOptions<'static> {
    fn default() -> Self {
        Self { apply_upgraders: Settings::global().upgraders_enabled, registry: UpgraderRegistry::builtin() }
    }
}
