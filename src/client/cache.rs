use std::collections::BTreeMap;
use std::sync::Mutex;

use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use super::FlagsApi;
use crate::document::{validate_key, FeatureFlag, FlagListing, Revision, MAINTENANCE_KEY};
use crate::error::{FlagError, Result};

/// Tag the flag listing is cached under.
pub const CACHE_KEY: &str = "feature-flags";

const NOTICE_CAPACITY: usize = 32;

/// What a presentation layer renders: the last known listing (kept while a
/// refetch is in flight or after one failed), the last error, and whether a
/// fetch is running.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheState {
    pub data: Option<FlagListing>,
    pub error: Option<FlagError>,
    pub is_loading: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Success,
    Error,
}

/// A transient notification about the outcome of an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

/// Cached, revalidatable copy of the flag listing.
///
/// Every write action first applies its change to the cached listing, then
/// sends the request. A successful write is followed by a refetch; a failed
/// write is rolled back by refetching the listing from the server.
pub struct FlagCache<A> {
    api: A,
    state: watch::Sender<CacheState>,
    notices: broadcast::Sender<Notice>,
    pending: Mutex<BTreeMap<String, bool>>,
    strict: bool,
}

impl<A: FlagsApi> FlagCache<A> {
    pub fn new(api: A) -> Self {
        let (state, _) = watch::channel(CacheState::default());
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            api,
            state,
            notices,
            pending: Mutex::new(BTreeMap::new()),
            strict: false,
        }
    }

    /// Send the cached revision with every write so that writes based on a
    /// stale listing are refused by the server.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn key(&self) -> &'static str {
        CACHE_KEY
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn snapshot(&self) -> CacheState {
        self.state.borrow().clone()
    }

    pub fn data(&self) -> Option<FlagListing> {
        self.state.borrow().data.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CacheState> {
        self.state.subscribe()
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    /// Revalidate: refetch the listing and replace the cached copy.
    pub async fn mutate(&self) -> Result<FlagListing> {
        self.state.send_modify(|s| s.is_loading = true);
        match self.api.fetch().await {
            Ok(listing) => {
                self.state.send_modify(|s| {
                    s.data = Some(listing.clone());
                    s.error = None;
                    s.is_loading = false;
                });
                Ok(listing)
            }
            Err(e) => {
                self.state.send_modify(|s| {
                    s.error = Some(e.clone());
                    s.is_loading = false;
                });
                Err(e)
            }
        }
    }

    /// Overwrite the cached listing locally; refetch afterwards when
    /// `revalidate` is set.
    pub async fn mutate_with<F>(&self, transform: F, revalidate: bool) -> Result<()>
    where
        F: FnOnce(&mut FlagListing),
    {
        self.state.send_modify(|s| {
            let data = s.data.get_or_insert_with(FlagListing::default);
            transform(data);
        });
        if revalidate {
            self.mutate().await?;
        }
        Ok(())
    }

    /// Flip an existing flag. Returns the new value.
    pub async fn toggle(&self, key: &str) -> Result<bool> {
        let listing = self.listing().await?;
        let current = listing
            .get(key)
            .ok_or_else(|| FlagError::NotFound(key.to_string()))?;
        self.set_enabled(key, !current).await?;
        Ok(!current)
    }

    pub async fn set_enabled(&self, key: &str, enabled: bool) -> Result<()> {
        let key = key.trim();
        if key == MAINTENANCE_KEY {
            return self.set_maintenance(enabled).await;
        }
        let listing = self.listing().await?;
        if !listing.contains(key) {
            return Err(FlagError::NotFound(key.to_string()));
        }

        let expected = self.expected();
        self.mutate_with(|l| l.set(key, enabled), false).await?;
        let result = self.api.upsert(key, enabled, None, expected.as_ref()).await;
        let state = if enabled { "enabled" } else { "disabled" };
        self.settle(result, format!("Flag {} {}", key, state)).await
    }

    pub async fn set_maintenance(&self, enabled: bool) -> Result<()> {
        self.load_for_strict().await?;
        let expected = self.expected();
        self.mutate_with(|l| l.is_maintenance = enabled, false).await?;
        let result = self.api.set_maintenance(enabled, expected.as_ref()).await;
        let state = if enabled { "enabled" } else { "disabled" };
        self.settle(result, format!("Maintenance mode {}", state)).await
    }

    /// Create a disabled flag. Duplicates are refused before any request.
    pub async fn create(&self, key: &str) -> Result<()> {
        let key = self.checked_key(key)?;
        let listing = self.listing().await?;
        if listing.contains(key) {
            let err = FlagError::Conflict(format!("A flag with key '{}' already exists", key));
            self.notify(NoticeLevel::Error, err.to_string());
            return Err(err);
        }

        let expected = self.expected();
        self.mutate_with(|l| l.set(key, false), false).await?;
        let result = self.api.upsert(key, false, None, expected.as_ref()).await;
        self.settle(result, format!("Flag {} created", key)).await
    }

    /// Rename and/or change a flag in a single request.
    pub async fn edit(&self, old_key: &str, new_key: &str, enabled: bool) -> Result<()> {
        let old_key = old_key.trim();
        let new_key = self.checked_key(new_key)?;
        let listing = self.listing().await?;
        if !listing.contains(old_key) {
            return Err(FlagError::NotFound(old_key.to_string()));
        }
        if new_key != old_key && listing.contains(new_key) {
            let err = FlagError::Conflict(format!("A flag with key '{}' already exists", new_key));
            self.notify(NoticeLevel::Error, err.to_string());
            return Err(err);
        }

        let expected = self.expected();
        self.mutate_with(
            |l| {
                l.remove(old_key);
                l.set(new_key, enabled);
            },
            false,
        )
        .await?;
        let result = self
            .api
            .upsert(new_key, enabled, Some(old_key), expected.as_ref())
            .await;
        self.settle(result, format!("Flag {} updated", new_key)).await
    }

    /// Rename keeping the current value.
    pub async fn rename(&self, old_key: &str, new_key: &str) -> Result<()> {
        let listing = self.listing().await?;
        let enabled = listing
            .get(old_key.trim())
            .ok_or_else(|| FlagError::NotFound(old_key.trim().to_string()))?;
        self.edit(old_key, new_key, enabled).await
    }

    /// Apply several values in one request.
    pub async fn save_batch(&self, changes: Vec<FeatureFlag>) -> Result<()> {
        let changes: Vec<FeatureFlag> = changes
            .into_iter()
            .map(|c| FeatureFlag {
                key: c.key.trim().to_string(),
                enabled: c.enabled,
            })
            .filter(|c| !c.key.is_empty())
            .collect();
        if changes.is_empty() {
            return Ok(());
        }

        self.load_for_strict().await?;
        let expected = self.expected();
        self.mutate_with(
            |l| {
                for change in &changes {
                    l.set(&change.key, change.enabled);
                }
            },
            false,
        )
        .await?;
        let result = self.api.save_batch(&changes, expected.as_ref()).await;
        self.settle(result, format!("{} changes saved", changes.len())).await
    }

    /// Record a change to send later with [`FlagCache::save_pending`].
    /// Staging a flag back to its cached value drops the change.
    pub fn stage(&self, key: &str, enabled: bool) {
        let key = key.trim();
        let cached = self.state.borrow().data.as_ref().and_then(|l| l.get(key));
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if cached == Some(enabled) {
            pending.remove(key);
        } else {
            pending.insert(key.to_string(), enabled);
        }
    }

    pub fn pending(&self) -> Vec<FeatureFlag> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(key, enabled)| FeatureFlag {
                key: key.clone(),
                enabled: *enabled,
            })
            .collect()
    }

    pub fn discard_pending(&self) {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Send every staged change as one batch. Staged changes are kept when
    /// the save fails.
    pub async fn save_pending(&self) -> Result<()> {
        let changes = self.pending();
        self.save_batch(changes).await?;
        self.discard_pending();
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let key = key.trim();
        self.load_for_strict().await?;
        let expected = self.expected();
        self.mutate_with(
            |l| {
                l.remove(key);
            },
            false,
        )
        .await?;
        let result = self.api.delete(key, expected.as_ref()).await;
        self.settle(result, format!("Flag {} deleted", key)).await
    }

    /// Delete keys one request at a time, awaiting each response before
    /// sending the next. Stops at the first failure and returns it; the
    /// listing is refetched either way.
    pub async fn delete_many(&self, keys: &[String]) -> Result<usize> {
        self.load_for_strict().await?;
        let mut deleted = 0;
        for key in keys {
            let key = key.trim();
            let expected = self.expected();
            self.mutate_with(
                |l| {
                    l.remove(key);
                },
                false,
            )
            .await?;

            if let Err(e) = self.api.delete(key, expected.as_ref()).await {
                let message = format!("Failed to delete some flags: {}", e);
                self.notify(NoticeLevel::Error, message);
                self.revalidate_quietly().await;
                return Err(e);
            }
            debug!(key, "flag deleted");
            deleted += 1;

            if self.strict {
                // Next request needs the revision this delete produced.
                self.revalidate_quietly().await;
            }
        }

        self.notify(NoticeLevel::Success, format!("{} flags deleted", deleted));
        self.revalidate_quietly().await;
        Ok(deleted)
    }

    async fn listing(&self) -> Result<FlagListing> {
        match self.data() {
            Some(listing) => Ok(listing),
            None => self.mutate().await,
        }
    }

    /// Strict writes send the cached revision, so an empty cache is filled
    /// before the first one.
    async fn load_for_strict(&self) -> Result<()> {
        if self.strict && self.data().is_none() {
            self.mutate().await?;
        }
        Ok(())
    }

    fn checked_key<'k>(&self, key: &'k str) -> Result<&'k str> {
        validate_key(key).map_err(|e| {
            self.notify(NoticeLevel::Error, e.to_string());
            e
        })
    }

    fn expected(&self) -> Option<Revision> {
        if !self.strict {
            return None;
        }
        self.state
            .borrow()
            .data
            .as_ref()
            .and_then(|l| l.revision.clone())
    }

    async fn settle(&self, result: Result<Option<Revision>>, success: String) -> Result<()> {
        match result {
            Ok(_) => {
                self.notify(NoticeLevel::Success, success);
                self.revalidate_quietly().await;
                Ok(())
            }
            Err(e) => {
                self.notify(NoticeLevel::Error, e.to_string());
                self.revalidate_quietly().await;
                Err(e)
            }
        }
    }

    async fn revalidate_quietly(&self) {
        if let Err(e) = self.mutate().await {
            warn!(error = %e, "revalidating flags failed");
        }
    }

    fn notify(&self, level: NoticeLevel, message: String) {
        // No subscribers is fine.
        let _ = self.notices.send(Notice { level, message });
    }
}
