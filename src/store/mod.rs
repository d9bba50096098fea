pub mod memory;

#[cfg(feature = "remote")]
pub mod http;
#[cfg(feature = "sled")]
pub mod sled_store;

use async_trait::async_trait;

use crate::document::{DocumentMeta, Revision};
use crate::error::StoreError;

pub use memory::MemoryStore;

#[cfg(feature = "remote")]
pub use http::{HttpObjectStore, HttpStoreConfig};
#[cfg(feature = "sled")]
pub use sled_store::SledStore;

/// Raw document bytes together with the revision they were read at.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub bytes: Vec<u8>,
    /// `None` when the backend does not expose a version token.
    pub revision: Option<Revision>,
}

/// Precondition attached to a whole-document write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteCondition {
    /// Unconditional replace.
    Any,
    /// Only create; fail if a document already exists.
    Absent,
    /// Only replace the document stored at this revision.
    Matches(Revision),
}

impl WriteCondition {
    /// The condition that protects a read-modify-write started from `read`.
    pub fn after_read(read: Option<&StoredDocument>) -> Self {
        match read {
            None => WriteCondition::Absent,
            Some(StoredDocument {
                revision: Some(rev),
                ..
            }) => WriteCondition::Matches(rev.clone()),
            Some(_) => WriteCondition::Any,
        }
    }
}

/// Whole-document storage. There are no partial updates: every write replaces
/// the entire object. Implementations must be thread-safe.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Read the full document. `Ok(None)` means it does not exist yet.
    async fn get_document(&self) -> Result<Option<StoredDocument>, StoreError>;

    /// Replace the full document. Returns the new revision when known.
    async fn put_document(
        &self,
        bytes: &[u8],
        content_type: &str,
        condition: WriteCondition,
    ) -> Result<Option<Revision>, StoreError>;

    /// Metadata about the stored document, if the backend tracks it.
    async fn get_meta(&self) -> Option<DocumentMeta> {
        None
    }

    /// Short backend name for logs and metrics.
    fn backend_name(&self) -> &'static str;
}

/// Check a write condition against the revision currently stored.
pub(crate) fn check_condition(
    condition: &WriteCondition,
    current: Option<&Revision>,
) -> Result<(), StoreError> {
    match (condition, current) {
        (WriteCondition::Any, _) => Ok(()),
        (WriteCondition::Absent, None) => Ok(()),
        (WriteCondition::Matches(expected), Some(current)) if expected == current => Ok(()),
        _ => Err(StoreError::Conflict),
    }
}
