//! Error type of the artifact layer.

use mobc_core::CoreError;
use thiserror::Error;

/// Alias résultat du crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Every way a load or save can fail. Each error aborts the whole call.
#[derive(Debug, Error)]
pub enum Error {
    /// Upstream read/write failure (file, stream, writer callback).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed, truncated or unrecognised header/table.
    #[error("malformed artifact{}: {reason}", .offset.map(|o| format!(" at offset {o}")).unwrap_or_default())]
    Format {
        /// Absolute offset of the offending bytes, when known.
        offset: Option<u64>,
        /// Human readable reason.
        reason: String,
    },

    /// Schema version outside of what this runtime reads.
    #[error("unsupported schema version {found}: this runtime reads versions {oldest}..={current}")]
    UnsupportedVersion {
        /// Version stamped in the artifact.
        found: u32,
        /// Oldest readable version.
        oldest: u32,
        /// Version written by this runtime.
        current: u32,
    },

    /// A registered upgrader failed.
    #[error("upgrade of `{method}` failed at pc {pc} (`{operator}`): {reason}")]
    Upgrade {
        /// Method being upgraded.
        method: String,
        /// Instruction index.
        pc: usize,
        /// Operator the upgrader was matched on.
        operator: String,
        /// Why it failed.
        reason: String,
    },

    /// The module handed to `save` does not validate.
    #[error("invalid module: {0}")]
    Invalid(String),
}

impl Error {
    /// `Format` error at a known offset.
    pub fn format_at(offset: usize, reason: impl Into<String>) -> Self {
        Self::Format { offset: Some(offset as u64), reason: reason.into() }
    }

    /// `Format` error without location.
    pub fn format(reason: impl Into<String>) -> Self { Self::Format { offset: None, reason: reason.into() } }

    /// Save-side encoding failure: a length the 32-bit tables cannot hold.
    pub fn oversized(e: CoreError) -> Self { Self::Invalid(e.to_string()) }

    /// `UnsupportedVersion` for `found` against this runtime's range.
    pub const fn unsupported(found: u32) -> Self {
        Self::UnsupportedVersion {
            found,
            oldest: mobc_core::OLDEST_SCHEMA_VERSION,
            current: mobc_core::SCHEMA_VERSION,
        }
    }

    /// True for `Format`.
    pub const fn is_format(&self) -> bool { matches!(self, Self::Format { .. }) }
}

/// Low-level decoding errors surface as `Format`, keeping their offset.
impl From<CoreError> for Error {
    fn from(e: CoreError) -> Self { Self::Format { offset: e.offset(), reason: e.to_string() } }
}
