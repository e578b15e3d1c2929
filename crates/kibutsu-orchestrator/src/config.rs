/// Default cap on concurrent instance creations within one service
pub const DEFAULT_CREATE_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub create_concurrency: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            create_concurrency: DEFAULT_CREATE_CONCURRENCY,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_create_concurrency(mut self, limit: usize) -> Self {
        self.create_concurrency = limit.max(1);
        self
    }
}
