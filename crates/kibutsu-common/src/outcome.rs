use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{ChangeAction, ComposeError, ResourceKind, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Up,
    Down,
    Scale,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Up => f.write_str("up"),
            OperationKind::Down => f.write_str("down"),
            OperationKind::Scale => f.write_str("scale"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApplyStatus {
    Applied,
    PartiallyApplied,
    Failed,
}

impl fmt::Display for ApplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyStatus::Applied => f.write_str("applied"),
            ApplyStatus::PartiallyApplied => f.write_str("partially-applied"),
            ApplyStatus::Failed => f.write_str("failed"),
        }
    }
}

/// Per-service tally for `Up` and `Scale`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceOutcome {
    pub service: String,
    pub status: ApplyStatus,
    pub desired: u32,
    /// Instances at the desired spec and running when the operation finished.
    pub running: usize,
    pub created: usize,
    pub started: usize,
    pub recreated: usize,
    pub removed: usize,
    pub errors: Vec<String>,
}

impl ServiceOutcome {
    pub fn new(service: impl Into<String>, desired: u32) -> Self {
        Self {
            service: service.into(),
            status: ApplyStatus::Applied,
            desired,
            running: 0,
            created: 0,
            started: 0,
            recreated: 0,
            removed: 0,
            errors: Vec::new(),
        }
    }

    /// Settles `status` from the recorded errors and how many instances reached the desired state.
    pub fn finish(mut self, running: usize) -> Self {
        self.running = running;
        self.status = if self.errors.is_empty() {
            ApplyStatus::Applied
        } else if running > 0 || self.made_progress() {
            ApplyStatus::PartiallyApplied
        } else {
            ApplyStatus::Failed
        };
        self
    }

    fn made_progress(&self) -> bool {
        self.created + self.started + self.recreated + self.removed > 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceChange {
    pub kind: ResourceKind,
    pub name: String,
    pub action: ChangeAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceFailure {
    pub kind: ResourceKind,
    pub name: String,
    pub message: String,
}

/// What a mutating operation did; failures of sub-operations live here, not in `Err`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub project: String,
    pub operation: OperationKind,
    pub status: ApplyStatus,
    pub services: Vec<ServiceOutcome>,
    pub changes: Vec<ResourceChange>,
    pub failures: Vec<ResourceFailure>,
    pub warnings: Vec<String>,
}

impl OperationResult {
    pub fn new(project: impl Into<String>, operation: OperationKind) -> Self {
        Self {
            project: project.into(),
            operation,
            status: ApplyStatus::Applied,
            services: Vec::new(),
            changes: Vec::new(),
            failures: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn record_change(&mut self, kind: ResourceKind, name: impl Into<String>, action: ChangeAction) {
        self.changes.push(ResourceChange {
            kind,
            name: name.into(),
            action,
        });
    }

    pub fn record_failure(&mut self, kind: ResourceKind, name: impl Into<String>, message: impl Into<String>) {
        self.failures.push(ResourceFailure {
            kind,
            name: name.into(),
            message: message.into(),
        });
    }

    /// Derives the aggregate status once every sub-operation has been recorded.
    pub fn finish(mut self) -> Self {
        let service_statuses: Vec<ApplyStatus> = self.services.iter().map(|s| s.status).collect();
        self.status = if self.failures.is_empty()
            && service_statuses.iter().all(|s| *s == ApplyStatus::Applied)
        {
            ApplyStatus::Applied
        } else if !self.changes.is_empty()
            || service_statuses.iter().any(|s| *s != ApplyStatus::Failed)
        {
            ApplyStatus::PartiallyApplied
        } else {
            ApplyStatus::Failed
        };
        self
    }

    pub fn is_applied(&self) -> bool {
        self.status == ApplyStatus::Applied
    }

    /// `Ok` when fully applied, otherwise the whole result wrapped in `PartialFailure`.
    pub fn into_result(self) -> Result<Self> {
        if self.is_applied() {
            Ok(self)
        } else {
            Err(ComposeError::PartialFailure(Box::new(self)))
        }
    }

    /// Distinct (kind, action) pairs touched, in a stable order.
    pub fn touched_categories(&self) -> Vec<(ResourceKind, ChangeAction)> {
        let mut pairs: Vec<_> = self.changes.iter().map(|c| (c.kind, c.action)).collect();
        pairs.sort();
        pairs.dedup();
        pairs
    }
}
