//! Client side of the flags API: a revalidatable, optimistically updated
//! cache of the flag listing and the session that authenticates it.

pub mod cache;

#[cfg(feature = "remote")]
pub mod http;
#[cfg(feature = "remote")]
pub mod session;

use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::document::{FeatureFlag, FlagListing, Revision};
use crate::error::Result;

pub use cache::{CacheState, FlagCache, Notice, NoticeLevel, CACHE_KEY};

#[cfg(feature = "remote")]
pub use http::HttpFlagsApi;
#[cfg(feature = "remote")]
pub use session::SessionClient;

/// The operations the cache needs from the flags API.
#[async_trait]
pub trait FlagsApi: Send + Sync {
    async fn fetch(&self) -> Result<FlagListing>;

    async fn upsert(
        &self,
        key: &str,
        enabled: bool,
        old_key: Option<&str>,
        expected: Option<&Revision>,
    ) -> Result<Option<Revision>>;

    async fn save_batch(
        &self,
        changes: &[FeatureFlag],
        expected: Option<&Revision>,
    ) -> Result<Option<Revision>>;

    async fn set_maintenance(
        &self,
        enabled: bool,
        expected: Option<&Revision>,
    ) -> Result<Option<Revision>>;

    async fn delete(&self, key: &str, expected: Option<&Revision>) -> Result<Option<Revision>>;
}

/// Session token shared between the session client and API clients.
#[derive(Debug, Clone, Default)]
pub struct SharedToken(Arc<RwLock<Option<String>>>);

impl SharedToken {
    pub fn new(token: Option<String>) -> Self {
        Self(Arc::new(RwLock::new(token)))
    }

    pub fn get(&self) -> Option<String> {
        self.0.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set(&self, token: Option<String>) {
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = token;
    }
}
