//! fleet-partition: failover list assignment.
//!
//! Assigns every agent a ranked list of cloud servers (primary, secondary,
//! ...) while keeping each rank level balanced across servers. This crate
//! is pure in-memory computation: it does not read or write the state
//! store. The coordinator in `fleet-events` feeds it and persists the
//! result.
//!
//! # Components
//!
//! - **`bucket`**: per-level server accumulators and per-agent rank lists
//! - **`selector`**: picks one bucket for one agent (primary stickiness,
//!   affinity, load)
//! - **`rebalancer`**: moves agents off overloaded buckets after each level
//! - **`generator`**: runs one selector + rebalancer pass per rank level
//! - **`load`**: pluggable agent load scoring
//!
//! # Algorithm
//!
//! ```text
//! for rank in 0..servers:
//!     rotate server order by one
//!     fresh buckets (seeded from a load snapshot if given)
//!     for agent in agents:
//!         bucket = select_best_bucket(unused by agent, affinity, primary@rank0)
//!         bucket.load += agent_load / compute_power
//!     while (max - min) / max >= 0.10 and a legal move exists:
//!         move heaviest movable agent from a heavy bucket to the lightest
//! ```

pub mod bucket;
pub mod generator;
pub mod load;
pub mod rebalancer;
pub mod selector;

pub use bucket::{AgentAssignment, LoadSnapshot, ServerBucket};
pub use generator::{BucketSummary, FailoverListGenerator, Generation, LevelOutcome};
pub use load::{AgentLoad, UniformLoad};
pub use rebalancer::{ACCEPTABLE_DISPARITY, AgentMove, load_disparity, next_move, rebalance};
pub use selector::select_best_bucket;
