//! Error types for blocksync

use std::fmt;
use std::sync::Arc;

/// Result type alias for blocksync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for blocksync
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Object store errors
    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
    /// Metadata error
    #[error("Metadata error: {0}")]
    Metadata(String),
    /// Invalid block ID
    #[error("Invalid block ID: {0}")]
    InvalidBlockId(String),
    /// The block's meta.json does not exist in the object store
    #[error("meta.json not found")]
    MetaNotFound,
    /// The block's meta.json exists but cannot be decoded
    #[error("meta.json corrupted: {0}")]
    MetaCorrupted(String),
    /// The block's meta.json carries a schema version this process does not understand
    #[error("unexpected meta.json version: {version}")]
    UnexpectedMetaVersion { version: i32 },
    /// Operation cancelled via the caller's shutdown token
    #[error("Operation cancelled")]
    Cancelled,
    /// A sync finished with per-block failures; the returned view is incomplete
    #[error("Incomplete view: {0}")]
    IncompleteView(MultiError),
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error means "the object does not exist".
    ///
    /// Implementations of the bucket interface translate backend-specific
    /// absence into this distinguished state; all other errors propagate.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::ObjectStore(object_store::Error::NotFound { .. }) | Error::MetaNotFound
        )
    }

    /// Recover an owned error from a single-flight shared result.
    pub(crate) fn from_shared(err: Arc<Error>) -> Error {
        Arc::try_unwrap(err).unwrap_or_else(|e| Error::Internal(e.to_string()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// An aggregate of independent errors collected during one operation.
///
/// Carries every error rather than only the first, so a sync that hit several
/// unrelated per-block failures reports all of them. Errors are reference
/// counted, which lets single-flight joiners share the same aggregate.
#[derive(Debug, Default, Clone)]
pub struct MultiError {
    errors: Vec<Arc<Error>>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: Error) {
        self.errors.push(Arc::new(err));
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Error> {
        self.errors.iter().map(|e| e.as_ref())
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors: ", self.errors.len())?;
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}
