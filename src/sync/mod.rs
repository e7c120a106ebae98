//! Sync module - the three-tier cache machinery
//!
//! - `observable` / `weak_map`: in-memory cells handed to observers
//! - `single_flight`: at-most-one-in-flight task guards
//! - `validity`: freshness policies for cached values
//! - `store` / `json_store`: local storage behind serialized transactions
//! - `remote`: remote source of truth
//! - `entity_cache`: the engine tying the tiers together
//! - `library`: saved-library membership with optimistic changes

mod context;
mod entity_cache;
mod json_store;
mod library;
mod observable;
mod remote;
mod single_flight;
mod store;
mod validity;
mod weak_map;

pub use context::SyncContext;
pub use entity_cache::{EntityCache, StateCell};
pub use json_store::{DocumentStore, EntityDocument, JsonFileStore};
pub use library::{
    LibraryCell, SavedCell, SavedDocument, SavedFlag, SavedRemote, SavedStateEngine, SavedStore,
};
pub use observable::Observable;
pub use remote::RemoteSource;
pub use single_flight::{KeyClaim, KeyedFlight, SingleFlight};
pub use store::{Database, LocalStore, MemoryStore, Stored};
pub use validity::{AlwaysValid, CacheValidity, NeverValid, Ttl, ValidityPolicy, ttl_validity};
pub use weak_map::{Cell, WeakObservableMap};
