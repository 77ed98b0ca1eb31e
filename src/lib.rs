//! Resolver-side DNS record cache.
//!
//! Parsed answers (A, AAAA, CNAME, SRV, NAPTR and negative results) are
//! packed into fixed-size pages, indexed by `(owner, type)` and expired by
//! TTL. [`daemon::Daemon`] puts a lock and deferred callback delivery in
//! front of the cache, [`registry::Registry`] shares one daemon per device.

pub mod arena;
pub mod cache;
pub mod cells;
pub mod clock;
pub mod codec;
pub mod config;
pub mod daemon;
pub mod dump;
pub mod error;
pub mod hash;
pub mod hosts;
pub mod record;
pub mod registry;
mod watcher;

pub use cache::{Cache, CacheSession, MAX_CNAME_CHAIN};
pub use config::{CacheParams, RrcacheConfig, load_config};
pub use daemon::{Daemon, DaemonStats, FindOutcome, FindRequest, RecordCallback};
pub use error::{CacheError, CacheResult};
pub use record::{CachedType, DnsData, DnsPayload, DnsStatus};
pub use registry::{ClientHandle, DeviceId, LookupResult, Registry};
