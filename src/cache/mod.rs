//! Caching subsystem.
//!
//! - [`CacheManager`]: the front-end callers use. Maps `(category,
//!   identifier)` to namespaced keys, applies category TTLs, maintains the
//!   tag index and turns every backend failure into a miss or `false`.
//!
//! - [`KeyValueBackend`]: the store contract. [`MemoryBackend`] keeps data
//!   in-process on moka; [`RedisBackend`] (feature `redis`) talks to a
//!   Redis server over one multiplexed connection.
//!
//! Keys look like `litreview:v1:search_results:<identifier>` and tag sets
//! like `litreview:v1:tag:arxiv`; the prefix is configurable.

pub mod backend;
pub mod category;
pub mod entry;
pub mod key;
pub mod manager;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_store;

pub use backend::{BackendStats, KeyValueBackend};
pub(crate) use backend::UnavailableBackend;
pub use category::{CacheCategory, TtlTable};
pub use entry::CacheEntry;
pub use key::CacheIdentifier;
pub use manager::{
    CacheHealth, CacheManager, CacheManagerStats, CacheState, DEFAULT_KEY_PREFIX,
    DEFAULT_OPERATION_TIMEOUT, HealthStatus,
};
pub use memory::{DEFAULT_MEMORY_CAPACITY, MemoryBackend};
#[cfg(feature = "redis")]
pub use redis_store::RedisBackend;
