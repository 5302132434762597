//! fleet-health: server liveness for the partitioned fleet.
//!
//! Servers heartbeat into the server directory. A server that stays
//! silent longer than the stale interval is forced DOWN, which drops it
//! from every failover list on the next repartition.
//!
//! # Architecture
//!
//! ```text
//! PartitionSweeper (tokio task, one per running server)
//!   ├── every sweep tick
//!   │   ├── CloudManager::heartbeat(self)
//!   │   ├── StaleServerReaper::mark_stale_servers_down()
//!   │   │     ├── bulk NORMAL -> DOWN (cutoff = now - stale interval)
//!   │   │     ├── SERVER_DOWN audit per demoted server
//!   │   │     └── PartitionCoordinator::process_requested_events() once
//!   │   └── purge events past retention
//!   └── every rebalance tick (optional): PERIODIC request
//! ```

pub mod reaper;
pub mod sweeper;

pub use reaper::{ReapReport, STALE_INTERVAL, StaleServerReaper};
pub use sweeper::{PartitionSweeper, SweepSettings};
