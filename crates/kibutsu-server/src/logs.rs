use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

use kibutsu_orchestrator::LogsOptions;

use crate::error::ApiError;
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    pub service: Option<String>,
    /// Lines of history per instance, or `all`.
    pub tail: Option<String>,
    pub follow: Option<bool>,
}

impl LogsQuery {
    pub fn options(&self) -> Result<LogsOptions, ApiError> {
        let mut options = LogsOptions::default();
        if let Some(follow) = self.follow {
            options.follow = follow;
        }
        match self.tail.as_deref().map(str::trim) {
            None => {}
            Some("all") => options.tail = None,
            Some(n) => {
                let lines = n
                    .parse()
                    .map_err(|_| ApiError::BadRequest(format!("tail must be a number or 'all', got {n:?}")))?;
                options.tail = Some(lines);
            }
        }
        Ok(options)
    }
}

/// Server-sent events of the project's interleaved log lines, one JSON `LogLine` per event.
///
/// The stream holds no deadline; it ends when the client disconnects or the server shuts
/// down, either of which cancels the context and closes every engine stream behind it.
pub async fn logs_handler(
    State(state): State<AppState>,
    Path(project): Path<String>,
    Query(query): Query<LogsQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let options = query.options()?;
    let ctx = state.context(&headers);
    let guard = ctx.token().clone().drop_guard();
    let mut lines = state
        .orchestrator
        .logs(&ctx, &project, query.service.as_deref(), options)
        .await?;

    let stream = async_stream::stream! {
        let _guard = guard;
        while let Some(line) = lines.next().await {
            match Event::default().json_data(&line) {
                Ok(event) => yield Ok::<_, Infallible>(event),
                Err(e) => warn!("Failed to encode log line: {}", e),
            }
        }
        debug!("Log stream finished");
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_options() {
        let query = LogsQuery {
            tail: Some("all".into()),
            follow: Some(false),
            ..Default::default()
        };
        let options = query.options().unwrap();
        assert_eq!(options.tail, None);
        assert!(!options.follow);

        let query = LogsQuery {
            tail: Some("25".into()),
            ..Default::default()
        };
        assert_eq!(query.options().unwrap().tail, Some(25));
        assert_eq!(LogsQuery::default().options().unwrap(), LogsOptions::default());

        let query = LogsQuery {
            tail: Some("lots".into()),
            ..Default::default()
        };
        assert!(matches!(query.options(), Err(ApiError::BadRequest(_))));
    }
}
