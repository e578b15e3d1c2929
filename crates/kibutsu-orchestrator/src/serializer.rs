//! Per-project mutual exclusion for mutating operations.
//!
//! A project is either idle or busy with exactly one operation. Contention is rejected
//! immediately with `ProjectBusy`; nothing queues. Different projects never block each other.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kibutsu_common::{ComposeError, OperationKind, Result};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct OperationSerializer {
    busy: Arc<DashMap<String, OperationKind>>,
}

impl OperationSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `project` busy with `operation`, or reports the operation already holding it.
    pub fn try_acquire(&self, project: &str, operation: OperationKind) -> Result<ProjectLease> {
        match self.busy.entry(project.to_string()) {
            Entry::Occupied(held) => {
                let current = *held.get();
                warn!(%project, requested = %operation, %current, "Rejecting operation on busy project");
                Err(ComposeError::ProjectBusy {
                    project: project.to_string(),
                    operation: current,
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(operation);
                debug!(%project, %operation, "Project lock acquired");
                Ok(ProjectLease {
                    busy: Arc::clone(&self.busy),
                    project: project.to_string(),
                    operation,
                })
            }
        }
    }

    /// The operation currently holding `project`, if any.
    pub fn current(&self, project: &str) -> Option<OperationKind> {
        self.busy.get(project).map(|held| *held)
    }

    pub fn is_busy(&self, project: &str) -> bool {
        self.busy.contains_key(project)
    }
}

/// Releases the project when dropped, including on early return or panic.
#[derive(Debug)]
pub struct ProjectLease {
    busy: Arc<DashMap<String, OperationKind>>,
    project: String,
    operation: OperationKind,
}

impl ProjectLease {
    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn operation(&self) -> OperationKind {
        self.operation
    }
}

impl Drop for ProjectLease {
    fn drop(&mut self) {
        self.busy.remove(&self.project);
        debug!(project = %self.project, operation = %self.operation, "Project lock released");
    }
}
