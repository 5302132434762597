//! fleet-state: persisted state for fleet partitioning.
//!
//! Backed by [redb](https://docs.rs/redb), holds the server and agent
//! directories, every agent's failover list, and the partition event audit
//! trail.
//!
//! # Architecture
//!
//! The partitioning core never sees redb. It consumes four traits from
//! [`directory`]: `ServerDirectory`, `AgentDirectory`, `FailoverListStore`
//! and `EventLog`. `StateStore` implements all of them.
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{agent_id}:{rank}`, `{event_id}:{agent}`) enable prefix
//! scans for related records.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across threads and async tasks.

pub mod directory;
pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use directory::{AgentDirectory, EventLog, FailoverListStore, ServerDirectory};
pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
