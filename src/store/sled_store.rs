use async_trait::async_trait;

use super::memory::build_meta;
use super::{check_condition, DocumentStore, StoredDocument, WriteCondition};
use crate::document::{DocumentMeta, Revision};
use crate::error::StoreError;

const DOCUMENT_KEY: &str = "flags:document";
const META_KEY: &str = "flags:meta";

/// Persistent document storage backed by sled.
///
/// Conditional writes go through `compare_and_swap` on the document key, so a
/// write that lost a race with another writer is rejected rather than applied.
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn new(db: sled::Db) -> Self {
        Self { db }
    }

    /// Open a sled database at the given directory path.
    pub fn open(data_dir: &str) -> Result<Self, StoreError> {
        let db = sled::open(data_dir)
            .map_err(|e| StoreError::Unavailable(format!("failed to open sled db: {}", e)))?;
        Ok(Self::new(db))
    }
}

#[async_trait]
impl DocumentStore for SledStore {
    async fn get_document(&self) -> Result<Option<StoredDocument>, StoreError> {
        let value = self
            .db
            .get(DOCUMENT_KEY)
            .map_err(|e| StoreError::Unavailable(format!("failed to read document: {}", e)))?;
        Ok(value.map(|ivec| StoredDocument {
            revision: Some(Revision::of_content(&ivec)),
            bytes: ivec.to_vec(),
        }))
    }

    async fn put_document(
        &self,
        bytes: &[u8],
        _content_type: &str,
        condition: WriteCondition,
    ) -> Result<Option<Revision>, StoreError> {
        let current = self
            .db
            .get(DOCUMENT_KEY)
            .map_err(|e| StoreError::Unavailable(format!("failed to read document: {}", e)))?;
        let current_revision = current.as_ref().map(|ivec| Revision::of_content(ivec));
        check_condition(&condition, current_revision.as_ref())?;

        let swapped = match condition {
            WriteCondition::Any => {
                self.db
                    .insert(DOCUMENT_KEY, bytes)
                    .map_err(|e| StoreError::Unavailable(format!("failed to store document: {}", e)))?;
                true
            }
            _ => self
                .db
                .compare_and_swap(DOCUMENT_KEY, current.as_ref(), Some(bytes))
                .map_err(|e| StoreError::Unavailable(format!("failed to store document: {}", e)))?
                .is_ok(),
        };
        if !swapped {
            return Err(StoreError::Conflict);
        }

        let meta = build_meta(bytes);
        let meta_bytes = serde_json::to_vec(&meta)
            .map_err(|e| StoreError::Unavailable(format!("failed to serialize meta: {}", e)))?;
        self.db
            .insert(META_KEY, meta_bytes)
            .map_err(|e| StoreError::Unavailable(format!("failed to store meta: {}", e)))?;

        self.db
            .flush_async()
            .await
            .map_err(|e| StoreError::Unavailable(format!("failed to flush: {}", e)))?;

        Ok(Some(meta.revision))
    }

    async fn get_meta(&self) -> Option<DocumentMeta> {
        let ivec = self.db.get(META_KEY).ok()??;
        serde_json::from_slice(&ivec).ok()
    }

    fn backend_name(&self) -> &'static str {
        "sled"
    }
}
