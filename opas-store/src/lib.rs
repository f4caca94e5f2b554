//! # opas-store
//!
//! Durable keyed archive for the opaque cache blob the fetch script mutates.
//!
//! Each `save` copies the live blob into the store under a per-run key and
//! records it in a JSON manifest. `restore` tries the exact key first and
//! falls back to the most recent entry sharing the fallback prefix, so a key
//! miss degrades to a warm-up from the newest prior generation instead of a
//! cold fetch.
//!
//! The store is advisory by contract: a missing directory, an unreadable
//! manifest, or a vanished blob file all restore as [`Restored::Cold`] and
//! never fail the caller.

pub mod error;
pub mod store;

pub use error::StoreError;
pub use store::{list_at, prune_at, restore_at, save_at, CacheEntry, Restored};
