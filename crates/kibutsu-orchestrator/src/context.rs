use std::future::Future;
use std::time::Duration;

use kibutsu_common::{ComposeError, Result};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Request-scoped context every mutating operation runs under.
///
/// Engine calls race the cancellation token and the deadline; whichever fires first
/// aborts the call with `Cancelled` or `DeadlineExceeded`.
#[derive(Debug, Clone)]
pub struct OperationContext {
    request_id: String,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationContext {
    pub fn new() -> Self {
        Self::with_request_id(Uuid::new_v4().to_string())
    }

    pub fn with_request_id(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Ties this context to an externally owned token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Fails if the context is already cancelled or past its deadline.
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ComposeError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(ComposeError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Runs `fut` unless the context ends first.
    pub async fn run<T, E, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: Into<ComposeError>,
    {
        self.check()?;
        let deadline = self.deadline;
        let expired = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ComposeError::Cancelled),
            _ = expired => Err(ComposeError::DeadlineExceeded),
            res = fut => res.map_err(Into::into),
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub fn done(&self) -> impl Future<Output = ()> + Send + 'static {
        let token = self.cancel.clone();
        let deadline = self.deadline;
        async move {
            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => token.cancelled().await,
            }
        }
    }
}

/// True for errors that mean the caller's context ended.
pub fn is_context_error(err: &ComposeError) -> bool {
    matches!(err, ComposeError::Cancelled | ComposeError::DeadlineExceeded)
}
