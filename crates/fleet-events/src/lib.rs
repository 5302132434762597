//! fleet-events: partition event coordination.
//!
//! Everything that may change which servers an agent fails over to flows
//! through here:
//!
//! - **`coordinator`**: `PartitionCoordinator`, the single entry point
//!   for repartitioning (single-agent, fleet-wide, deferred, audit)
//! - **`cloud`**: `CloudManager`, server and agent administration that
//!   raises the partition events its changes imply
//!
//! # Architecture
//!
//! ```text
//! CloudManager
//!   ├── ServerDirectory / AgentDirectory (mutate)
//!   └── PartitionCoordinator
//!         ├── FailoverListGenerator (pure, in memory)
//!         ├── FailoverListStore (persist under lock)
//!         └── EventLog (IMMEDIATE / REQUESTED / AUDIT / COMPLETED)
//! ```

pub mod cloud;
pub mod coordinator;
pub mod error;

pub use cloud::{AgentRegistration, CloudManager, ServerRegistration, ServerStatus};
pub use coordinator::{FailoverAssignments, PartitionCoordinator, RequestedSweep};
pub use error::{PartitionError, PartitionResult};
