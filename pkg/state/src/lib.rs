//! Shared key/value store access for the lease coordinator.
//!
//! Nothing outside this crate touches a raw store client: heartbeats go
//! through [`membership::Membership`] and leases through
//! [`leases::LeaseStore`], both on top of the [`store::KvStore`] contract.

pub mod events;
pub mod keys;
pub mod leases;
pub mod membership;
pub mod memory;
pub mod redis_store;
pub mod slate;
pub mod store;

pub use events::LeaseEventLog;
pub use keys::KeySpace;
pub use leases::LeaseStore;
pub use membership::{LiveSet, Membership};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use slate::SlateStore;
pub use store::{Entry, KvStore, StoreError};
