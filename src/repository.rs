use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::document::{require_key, FlagDocument, FlagListing, Revision, DOCUMENT_CONTENT_TYPE};
use crate::error::{FlagError, Result};
use crate::store::{DocumentStore, StoredDocument, WriteCondition};

/// Result of a multi-key delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteOutcome {
    pub deleted: Vec<String>,
    pub missing: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<Revision>,
}

/// Read-modify-write operations over the single flag document.
///
/// Every mutation loads the whole document, applies one logical change in
/// memory and stores the whole document back. Mutations issued through one
/// repository never overlap; writers in other processes are caught by passing
/// the revision that was read as the write condition.
pub struct FlagRepository {
    store: Arc<dyn DocumentStore>,
    write_lock: Mutex<()>,
}

struct Loaded {
    document: FlagDocument,
    stored: Option<StoredDocument>,
}

impl Loaded {
    fn revision(&self) -> Option<&Revision> {
        self.stored.as_ref().and_then(|s| s.revision.as_ref())
    }
}

impl FlagRepository {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Current flags, sorted, with the maintenance value split out.
    ///
    /// Never fails: an unreadable document is served as the default one.
    pub async fn list(&self) -> FlagListing {
        match self.store.get_document().await {
            Ok(Some(stored)) => match FlagDocument::from_slice(&stored.bytes) {
                Ok(document) => document.listing(stored.revision),
                Err(e) => {
                    warn!(error = %e, "stored flags are not a valid document, serving defaults");
                    FlagDocument::default().listing(None)
                }
            },
            Ok(None) => FlagDocument::default().listing(None),
            Err(e) => {
                warn!(
                    backend = self.store.backend_name(),
                    error = %e,
                    "reading flags failed, serving defaults"
                );
                FlagDocument::default().listing(None)
            }
        }
    }

    /// Verify the backing store answers reads.
    pub async fn check_storage(&self) -> Result<()> {
        self.store.get_document().await?;
        Ok(())
    }

    /// Set `key`, optionally renaming it from `old_key` in the same cycle.
    ///
    /// When renaming without an explicit value the old key's value carries
    /// over; otherwise a missing value means disabled.
    pub async fn upsert(
        &self,
        key: &str,
        enabled: Option<bool>,
        old_key: Option<&str>,
        expected: Option<&Revision>,
    ) -> Result<Option<Revision>> {
        let key = require_key(key)?;
        let old_key = old_key.map(str::trim).filter(|k| !k.is_empty());

        let (_, revision) = self
            .modify("upsert", expected, |doc| {
                let mut carried = None;
                if let Some(old) = old_key {
                    if old != key {
                        carried = doc.remove(old);
                        if carried.is_some() {
                            debug!(from = old, to = key, "renaming flag");
                        }
                    }
                }
                let value = enabled.or(carried).unwrap_or(false);
                doc.set(key, value);
                Ok(())
            })
            .await?;

        info!(key, ?old_key, "flag saved");
        Ok(revision)
    }

    /// Set every entry with a non-blank key in a single cycle.
    pub async fn batch_upsert<I, K>(&self, entries: I, expected: Option<&Revision>) -> Result<Option<Revision>>
    where
        I: IntoIterator<Item = (K, bool)>,
        K: AsRef<str>,
    {
        let entries: Vec<(String, bool)> = entries
            .into_iter()
            .filter_map(|(key, enabled)| {
                let key = key.as_ref().trim();
                (!key.is_empty()).then(|| (key.to_string(), enabled))
            })
            .collect();

        if entries.is_empty() {
            debug!("batch contained no usable keys, nothing to write");
            return Ok(self.list().await.revision);
        }

        let (_, revision) = self
            .modify("batch_upsert", expected, |doc| {
                for (key, enabled) in &entries {
                    doc.set(key, *enabled);
                }
                Ok(())
            })
            .await?;

        info!(count = entries.len(), "flag batch saved");
        Ok(revision)
    }

    pub async fn set_maintenance(
        &self,
        enabled: bool,
        expected: Option<&Revision>,
    ) -> Result<Option<Revision>> {
        let (_, revision) = self
            .modify("set_maintenance", expected, |doc| {
                doc.set_maintenance(enabled);
                Ok(())
            })
            .await?;

        info!(enabled, "maintenance mode updated");
        Ok(revision)
    }

    pub async fn delete(&self, key: &str, expected: Option<&Revision>) -> Result<Option<Revision>> {
        let key = require_key(key)?;

        let (_, revision) = self
            .modify("delete", expected, |doc| match doc.remove(key) {
                Some(_) => Ok(()),
                None => Err(FlagError::NotFound(key.to_string())),
            })
            .await?;

        info!(key, "flag deleted");
        Ok(revision)
    }

    /// Remove every listed key that exists, in one cycle.
    ///
    /// Fails with `NotFound` only when none of the keys were present.
    pub async fn delete_many<I, K>(&self, keys: I, expected: Option<&Revision>) -> Result<DeleteOutcome>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let keys: Vec<String> = keys
            .into_iter()
            .map(|k| k.as_ref().trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        if keys.is_empty() {
            return Err(FlagError::InvalidArgument("Key is required".to_string()));
        }

        let ((deleted, missing), revision) = self
            .modify("delete_many", expected, |doc| {
                let mut deleted = Vec::new();
                let mut missing = Vec::new();
                for key in &keys {
                    match doc.remove(key) {
                        Some(_) => deleted.push(key.clone()),
                        None => missing.push(key.clone()),
                    }
                }
                if deleted.is_empty() {
                    return Err(FlagError::NotFound(keys.join(", ")));
                }
                Ok((deleted, missing))
            })
            .await?;

        info!(deleted = deleted.len(), missing = missing.len(), "flags deleted");
        Ok(DeleteOutcome {
            deleted,
            missing,
            revision,
        })
    }

    /// One read-modify-write cycle. The write is skipped when an existing
    /// document comes out unchanged.
    async fn modify<T, F>(
        &self,
        op: &'static str,
        expected: Option<&Revision>,
        apply: F,
    ) -> Result<(T, Option<Revision>)>
    where
        F: FnOnce(&mut FlagDocument) -> Result<T>,
    {
        let _guard = self.write_lock.lock().await;

        let mut loaded = self.load_for_write().await?;
        if let Some(expected) = expected {
            if loaded.revision() != Some(expected) {
                warn!(op, %expected, current = ?loaded.revision(), "stale revision");
                return Err(FlagError::Conflict(format!(
                    "flags changed since revision {}",
                    expected
                )));
            }
        }

        let before = loaded.document.clone();
        let value = apply(&mut loaded.document)?;

        if loaded.stored.is_some() && loaded.document == before {
            debug!(op, "document unchanged, skipping write");
            let revision = loaded.revision().cloned();
            return Ok((value, revision));
        }

        let revision = self.store_document(op, &loaded).await?;
        Ok((value, revision))
    }

    async fn load_for_write(&self) -> Result<Loaded> {
        let stored = self.store.get_document().await.map_err(|e| {
            warn!(backend = self.store.backend_name(), error = %e, "reading flags for update failed");
            FlagError::from(e)
        })?;

        let document = match &stored {
            None => FlagDocument::default(),
            Some(s) => FlagDocument::from_slice(&s.bytes).map_err(|e| {
                FlagError::StorageUnavailable(format!("stored flags are not a valid document: {}", e))
            })?,
        };

        Ok(Loaded { document, stored })
    }

    async fn store_document(&self, op: &'static str, loaded: &Loaded) -> Result<Option<Revision>> {
        let bytes = loaded
            .document
            .to_vec_pretty()
            .map_err(|e| FlagError::StorageUnavailable(format!("failed to encode flags: {}", e)))?;
        let condition = WriteCondition::after_read(loaded.stored.as_ref());

        self.store
            .put_document(&bytes, DOCUMENT_CONTENT_TYPE, condition)
            .await
            .map_err(|e| {
                warn!(op, backend = self.store.backend_name(), error = %e, "writing flags failed");
                FlagError::from(e)
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::document::{FeatureFlag, MAINTENANCE_KEY};
    use crate::error::StoreError;
    use crate::store::MemoryStore;

    fn repo_with(content: &str) -> (FlagRepository, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::with_content(content.as_bytes().to_vec()));
        (FlagRepository::new(store.clone()), store)
    }

    fn flag(key: &str, enabled: bool) -> FeatureFlag {
        FeatureFlag {
            key: key.to_string(),
            enabled,
        }
    }

    async fn stored_document(store: &MemoryStore) -> FlagDocument {
        let stored = store.get_document().await.unwrap().unwrap();
        FlagDocument::from_slice(&stored.bytes).unwrap()
    }

    #[tokio::test]
    async fn upsert_then_list_on_empty_document() {
        let (repo, _) = repo_with("{}");

        repo.upsert("dark_mode", Some(true), None, None).await.unwrap();
        let listing = repo.list().await;
        assert_eq!(listing.flags, vec![flag("dark_mode", true)]);
        assert!(!listing.is_maintenance);

        repo.upsert("dark_mode", Some(false), Some("dark_mode"), None)
            .await
            .unwrap();
        let listing = repo.list().await;
        assert_eq!(listing.flags, vec![flag("dark_mode", false)]);
    }

    #[tokio::test]
    async fn missing_document_lists_defaults_and_is_created_on_write() {
        let store = Arc::new(MemoryStore::new());
        let repo = FlagRepository::new(store.clone());

        let listing = repo.list().await;
        assert!(listing.flags.is_empty());
        assert!(!listing.is_maintenance);
        assert_eq!(listing.revision, None);

        repo.upsert("beta", None, None, None).await.unwrap();
        let doc = stored_document(&store).await;
        assert_eq!(doc.get("beta"), Some(false));
        assert_eq!(doc.get(MAINTENANCE_KEY), Some(false));
    }

    #[tokio::test]
    async fn blank_keys_are_rejected() {
        let (repo, _) = repo_with("{}");
        assert!(matches!(
            repo.upsert("   ", Some(true), None, None).await,
            Err(FlagError::InvalidArgument(_))
        ));
        assert!(matches!(
            repo.delete(" ", None).await,
            Err(FlagError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn upsert_trims_keys() {
        let (repo, store) = repo_with("{}");
        repo.upsert("  beta ", Some(true), None, None).await.unwrap();
        assert_eq!(stored_document(&store).await.get("beta"), Some(true));
    }

    #[tokio::test]
    async fn rename_moves_value_in_a_single_write() {
        let (repo, store) = repo_with(r#"{"old_name": true, "other": false}"#);

        let revision = repo
            .upsert("new_name", None, Some("old_name"), None)
            .await
            .unwrap();

        let doc = stored_document(&store).await;
        assert_eq!(doc.get("old_name"), None);
        assert_eq!(doc.get("new_name"), Some(true));
        assert_eq!(doc.get("other"), Some(false));
        assert_eq!(repo.list().await.revision, revision);
    }

    #[tokio::test]
    async fn rename_of_absent_key_just_sets_new_key() {
        let (repo, store) = repo_with(r#"{"other": true}"#);
        repo.upsert("fresh", Some(true), Some("ghost"), None)
            .await
            .unwrap();
        let doc = stored_document(&store).await;
        assert_eq!(doc.get("fresh"), Some(true));
        assert_eq!(doc.get("other"), Some(true));
    }

    #[tokio::test]
    async fn batch_applies_all_entries_together() {
        let (repo, store) = repo_with(r#"{"a": false, "b": true}"#);
        repo.batch_upsert([("a", true), ("b", false), ("  ", true)], None)
            .await
            .unwrap();

        let listing = repo.list().await;
        assert_eq!(listing.flags, vec![flag("a", true), flag("b", false)]);
        assert_eq!(stored_document(&store).await.len(), 2);
    }

    #[tokio::test]
    async fn empty_batch_does_not_write() {
        let (repo, store) = repo_with(r#"{"a": false}"#);
        let before = store.get_document().await.unwrap();
        repo.batch_upsert(Vec::<(String, bool)>::new(), None)
            .await
            .unwrap();
        assert_eq!(store.get_document().await.unwrap(), before);
    }

    #[tokio::test]
    async fn maintenance_is_listed_separately() {
        let (repo, store) = repo_with(r#"{"beta": false}"#);
        repo.set_maintenance(true, None).await.unwrap();

        let listing = repo.list().await;
        assert!(listing.is_maintenance);
        assert_eq!(listing.flags, vec![flag("beta", false)]);
        assert_eq!(stored_document(&store).await.get(MAINTENANCE_KEY), Some(true));
    }

    #[tokio::test]
    async fn delete_removes_key_or_reports_not_found() {
        let (repo, _) = repo_with(r#"{"a": true, "b": false}"#);
        repo.delete("a", None).await.unwrap();
        assert_eq!(repo.list().await.flags, vec![flag("b", false)]);

        assert_eq!(
            repo.delete("a", None).await,
            Err(FlagError::NotFound("a".to_string()))
        );
    }

    #[tokio::test]
    async fn sequential_deletes_leave_other_keys_alone() {
        let (repo, _) = repo_with(r#"{"a": true, "b": false, "c": true, "keep": true}"#);
        for key in ["a", "b", "c"] {
            repo.delete(key, None).await.unwrap();
        }
        let listing = repo.list().await;
        assert_eq!(listing.flags, vec![flag("keep", true)]);
    }

    #[tokio::test]
    async fn delete_many_reports_missing_keys() {
        let (repo, _) = repo_with(r#"{"a": true, "b": false, "keep": true}"#);
        let outcome = repo.delete_many(["a", "ghost", "b"], None).await.unwrap();
        assert_eq!(outcome.deleted, vec!["a", "b"]);
        assert_eq!(outcome.missing, vec!["ghost"]);
        assert_eq!(repo.list().await.flags, vec![flag("keep", true)]);

        assert!(matches!(
            repo.delete_many(["ghost"], None).await,
            Err(FlagError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn stale_expected_revision_is_a_conflict() {
        let (repo, store) = repo_with(r#"{"a": true}"#);
        let stale = repo.list().await.revision.unwrap();
        repo.upsert("b", Some(true), None, Some(&stale)).await.unwrap();

        let err = repo.upsert("c", Some(true), None, Some(&stale)).await;
        assert!(matches!(err, Err(FlagError::Conflict(_))));
        assert_eq!(stored_document(&store).await.get("c"), None);
    }

    /// Store that fails every read.
    struct BrokenStore;

    #[async_trait]
    impl DocumentStore for BrokenStore {
        async fn get_document(&self) -> std::result::Result<Option<StoredDocument>, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn put_document(
            &self,
            _bytes: &[u8],
            _content_type: &str,
            _condition: WriteCondition,
        ) -> std::result::Result<Option<Revision>, StoreError> {
            panic!("must not write after a failed read");
        }

        fn backend_name(&self) -> &'static str {
            "broken"
        }
    }

    #[tokio::test]
    async fn read_failures_degrade_list_but_fail_mutations() {
        let repo = FlagRepository::new(Arc::new(BrokenStore));

        let listing = repo.list().await;
        assert!(listing.flags.is_empty());
        assert!(!listing.is_maintenance);

        assert!(matches!(
            repo.upsert("a", Some(true), None, None).await,
            Err(FlagError::StorageUnavailable(_))
        ));
        assert!(repo.check_storage().await.is_err());
    }

    #[tokio::test]
    async fn corrupt_document_is_not_overwritten() {
        let (repo, store) = repo_with("not json");
        assert!(repo.list().await.flags.is_empty());
        assert!(matches!(
            repo.set_maintenance(true, None).await,
            Err(FlagError::StorageUnavailable(_))
        ));
        assert_eq!(
            store.get_document().await.unwrap().unwrap().bytes,
            b"not json".to_vec()
        );
    }

    /// Simulates another process writing between our read and our write.
    struct RacingStore {
        inner: MemoryStore,
        raced: AtomicBool,
    }

    #[async_trait]
    impl DocumentStore for RacingStore {
        async fn get_document(&self) -> std::result::Result<Option<StoredDocument>, StoreError> {
            self.inner.get_document().await
        }

        async fn put_document(
            &self,
            bytes: &[u8],
            content_type: &str,
            condition: WriteCondition,
        ) -> std::result::Result<Option<Revision>, StoreError> {
            if !self.raced.swap(true, Ordering::SeqCst) {
                self.inner
                    .put_document(br#"{"theirs": true}"#, content_type, WriteCondition::Any)
                    .await?;
            }
            self.inner.put_document(bytes, content_type, condition).await
        }

        fn backend_name(&self) -> &'static str {
            "racing"
        }
    }

    #[tokio::test]
    async fn concurrent_writer_is_not_silently_overwritten() {
        let store = Arc::new(RacingStore {
            inner: MemoryStore::with_content(br#"{"mine": false}"#.to_vec()),
            raced: AtomicBool::new(false),
        });
        let repo = FlagRepository::new(store.clone());

        let result = repo.upsert("mine", Some(true), None, None).await;
        assert!(matches!(result, Err(FlagError::Conflict(_))));

        let listing = repo.list().await;
        assert_eq!(listing.flags, vec![flag("theirs", true)]);
    }
}
