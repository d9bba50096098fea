use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{check_condition, DocumentStore, StoredDocument, WriteCondition};
use crate::document::{DocumentMeta, FlagDocument, Revision};
use crate::error::StoreError;

/// In-memory document storage backed by a `RwLock`.
pub struct MemoryStore {
    data: RwLock<Option<(Vec<u8>, DocumentMeta)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(None),
        }
    }

    /// Start with `bytes` already stored.
    pub fn with_content(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        let meta = build_meta(&bytes);
        Self {
            data: RwLock::new(Some((bytes, meta))),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn build_meta(bytes: &[u8]) -> DocumentMeta {
    let flags_count = FlagDocument::from_slice(bytes)
        .map(|doc| doc.flags_count() as u64)
        .unwrap_or(0);
    DocumentMeta {
        revision: Revision::of_content(bytes),
        updated_at: chrono::Utc::now().to_rfc3339(),
        flags_count,
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get_document(&self) -> Result<Option<StoredDocument>, StoreError> {
        let data = self.data.read().await;
        Ok(data.as_ref().map(|(bytes, meta)| StoredDocument {
            bytes: bytes.clone(),
            revision: Some(meta.revision.clone()),
        }))
    }

    async fn put_document(
        &self,
        bytes: &[u8],
        _content_type: &str,
        condition: WriteCondition,
    ) -> Result<Option<Revision>, StoreError> {
        let mut data = self.data.write().await;
        check_condition(&condition, data.as_ref().map(|(_, meta)| &meta.revision))?;
        let meta = build_meta(bytes);
        let revision = meta.revision.clone();
        *data = Some((bytes.to_vec(), meta));
        Ok(Some(revision))
    }

    async fn get_meta(&self) -> Option<DocumentMeta> {
        let data = self.data.read().await;
        data.as_ref().map(|(_, meta)| meta.clone())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_empty_and_stores_whole_document() {
        let store = MemoryStore::new();
        assert_eq!(store.get_document().await.unwrap(), None);
        assert!(store.get_meta().await.is_none());

        let rev = store
            .put_document(br#"{"a": true}"#, "application/json", WriteCondition::Absent)
            .await
            .unwrap();

        let stored = store.get_document().await.unwrap().unwrap();
        assert_eq!(stored.bytes, br#"{"a": true}"#.to_vec());
        assert_eq!(stored.revision, rev);
        assert_eq!(store.get_meta().await.unwrap().flags_count, 1);
    }

    #[tokio::test]
    async fn rejects_stale_conditions() {
        let store = MemoryStore::with_content(br#"{"a": true}"#.to_vec());
        let first = store.get_document().await.unwrap().unwrap().revision.unwrap();

        assert_eq!(
            store
                .put_document(b"{}", "application/json", WriteCondition::Absent)
                .await,
            Err(StoreError::Conflict)
        );

        store
            .put_document(b"{}", "application/json", WriteCondition::Matches(first.clone()))
            .await
            .unwrap();

        assert_eq!(
            store
                .put_document(br#"{"b": false}"#, "application/json", WriteCondition::Matches(first))
                .await,
            Err(StoreError::Conflict)
        );
        assert_eq!(store.get_document().await.unwrap().unwrap().bytes, b"{}".to_vec());

        store
            .put_document(br#"{"b": false}"#, "application/json", WriteCondition::Any)
            .await
            .unwrap();
    }
}
