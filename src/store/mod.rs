//! Counter stores.
//!
//! All counting state lives behind the [`CounterStore`] trait. The Redis
//! store is shared across service instances; the memory store is for a
//! single process and for tests.

mod backend;
mod memory;
mod redis_store;

pub use backend::{CounterHit, CounterStore};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
