//! Feature flags kept in one JSON document (`{"flag_key": bool, ...}` plus the
//! reserved `isMaintenance` key) in a whole-object store.
//!
//! * [`store`] reads and replaces the document on a backend.
//! * [`repository`] runs every change as one read-modify-write cycle.
//! * [`api`] holds the request and response bodies of the HTTP routes.
//! * [`client`] keeps an optimistically updated cache of the listing.

pub mod api;
pub mod client;
pub mod document;
pub mod error;
pub mod repository;
pub mod store;

pub use document::{FeatureFlag, FlagDocument, FlagListing, Revision, MAINTENANCE_KEY};
pub use error::{FlagError, Result, StoreError};
pub use repository::{DeleteOutcome, FlagRepository};
pub use store::{DocumentStore, MemoryStore, StoredDocument, WriteCondition};
