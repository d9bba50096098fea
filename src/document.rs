use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use icu_collator::{Collator, CollatorOptions};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::FlagError;

/// Reserved document key holding the global maintenance toggle.
pub const MAINTENANCE_KEY: &str = "isMaintenance";

/// Content type the document is stored with.
pub const DOCUMENT_CONTENT_TYPE: &str = "application/json";

static KEY_PATTERN: OnceLock<Regex> = OnceLock::new();

fn key_pattern() -> &'static Regex {
    KEY_PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9_]+$").expect("valid key pattern"))
}

/// Validate a flag key against the `[a-z0-9_]+` pattern.
///
/// The server only insists on a non-blank key; this stricter check is applied
/// by clients before creating or renaming a flag.
pub fn validate_key(key: &str) -> Result<&str, FlagError> {
    let key = key.trim();
    if key.is_empty() {
        return Err(FlagError::InvalidArgument("Key is required".to_string()));
    }
    if !key_pattern().is_match(key) {
        return Err(FlagError::InvalidArgument(format!(
            "Invalid key '{}': use lowercase letters, digits and underscores",
            key
        )));
    }
    Ok(key)
}

/// Trim a key and reject it if nothing is left.
pub fn require_key(key: &str) -> Result<&str, FlagError> {
    let key = key.trim();
    if key.is_empty() {
        return Err(FlagError::InvalidArgument("Key is required".to_string()));
    }
    Ok(key)
}

/// Sort flags into display order: root-locale collation of the keys, so `_`
/// comes before digits and lowercase before uppercase on a case-only tie.
pub fn sort_flags(flags: &mut [FeatureFlag]) {
    match Collator::try_new(&Default::default(), CollatorOptions::new()) {
        Ok(collator) => flags.sort_by(|a, b| collator.compare(&a.key, &b.key)),
        Err(e) => {
            tracing::warn!(error = ?e, "collation data unavailable, sorting by code point");
            flags.sort_by(|a, b| a.key.cmp(&b.key));
        }
    }
}

/// Opaque token identifying one stored version of the document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Content-derived revision: SHA-1 hex digest of the stored bytes.
    pub fn of_content(bytes: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Render as an HTTP entity tag (quoted).
    pub fn to_etag(&self) -> String {
        if self.0.starts_with('"') || self.0.starts_with("W/") {
            self.0.clone()
        } else {
            format!("\"{}\"", self.0)
        }
    }

    /// Parse an entity tag as sent in `ETag` / `If-Match`.
    pub fn from_etag(etag: &str) -> Option<Self> {
        let etag = etag.trim();
        let etag = etag.strip_prefix("W/").unwrap_or(etag);
        let inner = etag.trim_matches('"');
        if inner.is_empty() || inner == "*" {
            return None;
        }
        Some(Self(inner.to_string()))
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Bookkeeping reported by stores that track it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub revision: Revision,
    pub updated_at: String,
    pub flags_count: u64,
}

/// The single JSON object holding every flag, maintenance key included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlagDocument {
    entries: BTreeMap<String, bool>,
}

impl Default for FlagDocument {
    /// What the read path falls back to when no document exists yet.
    fn default() -> Self {
        Self {
            entries: BTreeMap::from([(MAINTENANCE_KEY.to_string(), false)]),
        }
    }
}

impl FlagDocument {
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn from_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// Pretty-printed JSON with two-space indentation.
    pub fn to_vec_pretty(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(&self.entries)
    }

    pub fn get(&self, key: &str) -> Option<bool> {
        self.entries.get(key).copied()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn set(&mut self, key: &str, enabled: bool) {
        self.entries.insert(key.to_string(), enabled);
    }

    pub fn remove(&mut self, key: &str) -> Option<bool> {
        self.entries.remove(key)
    }

    pub fn maintenance(&self) -> bool {
        self.get(MAINTENANCE_KEY).unwrap_or(false)
    }

    pub fn set_maintenance(&mut self, enabled: bool) {
        self.set(MAINTENANCE_KEY, enabled);
    }

    /// Ordinary flags in display order, maintenance key excluded.
    pub fn flags(&self) -> Vec<FeatureFlag> {
        let mut flags: Vec<FeatureFlag> = self
            .entries
            .iter()
            .filter(|(key, _)| key.as_str() != MAINTENANCE_KEY)
            .map(|(key, enabled)| FeatureFlag {
                key: key.clone(),
                enabled: *enabled,
            })
            .collect();
        sort_flags(&mut flags);
        flags
    }

    pub fn flags_count(&self) -> usize {
        self.entries
            .keys()
            .filter(|key| key.as_str() != MAINTENANCE_KEY)
            .count()
    }

    pub fn listing(&self, revision: Option<Revision>) -> FlagListing {
        FlagListing {
            flags: self.flags(),
            is_maintenance: self.maintenance(),
            revision,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, bool)> for FlagDocument {
    fn from_iter<I: IntoIterator<Item = (K, bool)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// A single named toggle as shown to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlag {
    pub key: String,
    pub enabled: bool,
}

/// The `GET /flags` view of the document.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FlagListing {
    pub flags: Vec<FeatureFlag>,
    #[serde(rename = "isMaintenance", default)]
    pub is_maintenance: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<Revision>,
}

impl FlagListing {
    pub fn get(&self, key: &str) -> Option<bool> {
        if key == MAINTENANCE_KEY {
            return Some(self.is_maintenance);
        }
        self.flags.iter().find(|f| f.key == key).map(|f| f.enabled)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.flags.iter().any(|f| f.key == key)
    }

    /// Insert or overwrite a flag, keeping display order.
    pub fn set(&mut self, key: &str, enabled: bool) {
        if key == MAINTENANCE_KEY {
            self.is_maintenance = enabled;
            return;
        }
        match self.flags.iter_mut().find(|f| f.key == key) {
            Some(flag) => flag.enabled = enabled,
            None => {
                self.flags.push(FeatureFlag {
                    key: key.to_string(),
                    enabled,
                });
                sort_flags(&mut self.flags);
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<bool> {
        let idx = self.flags.iter().position(|f| f.key == key)?;
        Some(self.flags.remove(idx).enabled)
    }

    /// Case-insensitive substring match on keys; a blank query matches all.
    pub fn search(&self, query: &str) -> Vec<&FeatureFlag> {
        let needle = query.trim().to_lowercase();
        self.flags
            .iter()
            .filter(|f| needle.is_empty() || f.key.to_lowercase().contains(&needle))
            .collect()
    }
}
