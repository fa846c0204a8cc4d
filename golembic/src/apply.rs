/// Configurable fields for the "up" family of manager operations.
#[derive(Debug, Clone, Default)]
pub struct ApplyConfig {
    /// Verify the stored history against the registered sequence before
    /// computing the pending migrations.
    pub verify_history: bool,
    /// The target revision; required by
    /// [`Manager::up_to`](crate::Manager::up_to), ignored elsewhere.
    pub revision: Option<String>,
}

impl ApplyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_verify_history(mut self, verify_history: bool) -> Self {
        self.verify_history = verify_history;
        self
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }
}
