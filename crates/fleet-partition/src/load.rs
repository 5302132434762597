//! Agent load scoring.
//!
//! The generator never decides what an agent "weighs"; it asks an
//! [`AgentLoad`] implementation. [`UniformLoad`] gives every agent the same
//! weight, which makes assigned load equal to agent count.

use fleet_state::AgentInfo;

/// Scores how much load an agent puts on the server it connects to.
pub trait AgentLoad: Send + Sync {
    fn load(&self, agent: &AgentInfo) -> f64;
}

/// Every agent weighs 1.0.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformLoad;

impl AgentLoad for UniformLoad {
    fn load(&self, _agent: &AgentInfo) -> f64 {
        1.0
    }
}

impl<F> AgentLoad for F
where
    F: Fn(&AgentInfo) -> f64 + Send + Sync,
{
    fn load(&self, agent: &AgentInfo) -> f64 {
        self(agent)
    }
}
