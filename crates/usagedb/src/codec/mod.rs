//! Snapshot codecs selected by on-disk schema version.
//!
//! Versions 1 through 3 use the line-oriented [`LegacyCodec`]; version 4 uses
//! the binary [`CompactCodec`]. Neither format stores the snapshot's begin
//! time: it travels next to the payload (in the file name, or in the backup
//! record prefix) and is handed back to [`StatsCodec::decode`].
//!
//! ```rust,ignore
//! use alopex_usagedb::codec::codec_for_version;
//!
//! let codec = codec_for_version(4)?;
//! let bytes = codec.encode(&stats)?;
//! let decoded = codec.decode(&bytes, stats.begin_time)?;
//! ```

use crate::error::{Result, UsageError};
use crate::stats::{IntervalStats, Timestamp};

pub mod compact;
pub mod legacy;

pub use compact::CompactCodec;
pub use legacy::LegacyCodec;

/// Oldest version whose files survive an upgrade. Older data is discarded.
pub const MIN_MIGRATABLE_VERSION: u32 = 2;

/// Newest version written by the legacy text codec.
pub const LAST_LEGACY_VERSION: u32 = 3;

/// Version written by the compact binary codec.
pub const COMPACT_VERSION: u32 = 4;

/// Default schema version for newly written files.
pub const DEFAULT_CURRENT_VERSION: u32 = COMPACT_VERSION;

/// Encodes and decodes one [`IntervalStats`] snapshot.
pub trait StatsCodec: Send + Sync {
    /// Short name used in log messages.
    fn name(&self) -> &'static str;

    /// Serializes `stats`. `last_time_saved` is not encoded.
    fn encode(&self, stats: &IntervalStats) -> Result<Vec<u8>>;

    /// Deserializes a snapshot whose window starts at `begin_time`.
    fn decode(&self, bytes: &[u8], begin_time: Timestamp) -> Result<IntervalStats>;
}

static LEGACY: LegacyCodec = LegacyCodec;
static COMPACT: CompactCodec = CompactCodec;

/// Returns the codec for an on-disk schema version.
///
/// # Errors
///
/// Returns `UsageError::UnsupportedVersion` for versions without a codec.
pub fn codec_for_version(version: u32) -> Result<&'static dyn StatsCodec> {
    match version {
        1..=LAST_LEGACY_VERSION => Ok(&LEGACY),
        COMPACT_VERSION => Ok(&COMPACT),
        other => Err(UsageError::UnsupportedVersion(other)),
    }
}

/// Codec for [`DEFAULT_CURRENT_VERSION`].
pub fn default_codec() -> &'static dyn StatsCodec {
    &COMPACT
}
