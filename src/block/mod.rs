//! Block identity and object-store layout
//!
//! A block is an immutable time-range slice of a tenant's series data,
//! addressed by a time-ordered 128-bit [`BlockId`]. Everything a block owns
//! lives under the `<block id>/` prefix in the object store:
//!
//! ```text
//! <BlockId>/meta.json             visible block descriptor
//! <BlockId>/meta.json.temp        staged upload descriptor
//! <BlockId>/index                 index file
//! <BlockId>/chunks/<000000..>     chunk segment files
//! <BlockId>/deletion-mark.json    optional deletion mark
//! ```

pub mod meta;

pub use self::meta::{BlockMeta, BlockSource, DeletionMark};

use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;
use uuid::{NoContext, Timestamp, Uuid};

/// Name of the visible block descriptor object.
pub const META_FILENAME: &str = "meta.json";
/// Name of the staged descriptor written by `begin` and promoted by `commit`.
pub const TEMP_META_FILENAME: &str = "meta.json.temp";
/// Name of the optional deletion mark object.
pub const DELETION_MARK_FILENAME: &str = "deletion-mark.json";
/// Name of the block index file.
pub const INDEX_FILENAME: &str = "index";
/// Directory holding six-digit chunk segment files.
pub const CHUNKS_DIR: &str = "chunks";

/// Time-ordered block identifier.
///
/// A UUIDv7: millisecond creation timestamp in the high bits, randomness in
/// the low bits. Lexicographic order is creation order, and a block's age is
/// derivable from the identifier alone, without consulting the object store.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct BlockId(Uuid);

impl BlockId {
    /// Generate a fresh identifier stamped with the current time.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Generate an identifier stamped with the given creation time.
    ///
    /// The low bits are still random, so two calls with the same timestamp
    /// produce distinct identifiers.
    pub fn with_creation_time(unix_millis: i64) -> Self {
        let millis = unix_millis.max(0) as u64;
        let ts = Timestamp::from_unix(
            NoContext,
            millis / 1000,
            ((millis % 1000) * 1_000_000) as u32,
        );
        Self(Uuid::new_v7(ts))
    }

    /// Parse an identifier from its canonical string form.
    ///
    /// Only time-ordered (v7) identifiers are accepted; anything else in the
    /// bucket root is not a block directory.
    pub fn parse(s: &str) -> Result<Self> {
        let uuid = Uuid::parse_str(s).map_err(|_| Error::InvalidBlockId(s.to_string()))?;
        if uuid.get_version_num() != 7 {
            return Err(Error::InvalidBlockId(s.to_string()));
        }
        Ok(Self(uuid))
    }

    /// Creation time embedded in the identifier, as unix milliseconds.
    pub fn creation_time_millis(&self) -> i64 {
        self.0
            .get_timestamp()
            .map(|ts| {
                let (secs, nanos) = ts.to_unix();
                secs as i64 * 1000 + nanos as i64 / 1_000_000
            })
            .unwrap_or(0)
    }
}

impl Default for BlockId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self.0)
    }
}

impl FromStr for BlockId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Parse a bucket-root entry name as a block directory.
///
/// Returns `None` for anything that is not a valid block identifier, so
/// unrelated objects sharing the tenant prefix are silently skipped.
pub fn is_block_dir(name: &str) -> Option<BlockId> {
    BlockId::parse(name.trim_end_matches('/')).ok()
}

/// Object path of a block's visible descriptor.
pub fn meta_path(id: &BlockId) -> String {
    format!("{id}/{META_FILENAME}")
}

/// Object path of a block's staged upload descriptor.
pub fn temp_meta_path(id: &BlockId) -> String {
    format!("{id}/{TEMP_META_FILENAME}")
}

/// Object path of a block's deletion mark.
pub fn deletion_mark_path(id: &BlockId) -> String {
    format!("{id}/{DELETION_MARK_FILENAME}")
}

/// Object path of a file inside a block directory.
pub fn block_file_path(id: &BlockId, rel: &str) -> String {
    format!("{id}/{rel}")
}
