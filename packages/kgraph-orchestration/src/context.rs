use uuid::Uuid;

/// Explicit context threaded through every stage call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub batch_id: Uuid,
    /// Who triggered the work (operator id, "runtime", "embedding-monitor")
    pub actor: String,
}

impl RunContext {
    pub fn new(batch_id: Uuid, actor: impl Into<String>) -> Self {
        Self {
            batch_id,
            actor: actor.into(),
        }
    }

    /// Same batch, different actor
    pub fn with_actor(&self, actor: impl Into<String>) -> Self {
        Self::new(self.batch_id, actor)
    }
}

impl std::fmt::Display for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.actor, self.batch_id)
    }
}
