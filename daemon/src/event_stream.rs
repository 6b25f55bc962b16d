//! Server-sent progress streaming for `GET /tasks/{task_id}/stream`.
//!
//! One JSON object per `data:` line, a `: keepalive` comment every 15
//! seconds, and the stream closes after the terminal event. Subscribers
//! always receive the current snapshot first; a subscriber that lags the
//! ring buffer is resynchronized with the latest coalesced snapshot.

use crate::errors::{DaemonError, DaemonResult};
use crate::handlers::AppState;
use bytes::Bytes;
use hyper::{Body, Response};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;
use triage_core::types::ProgressEvent;
use uuid::Uuid;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Render one event as an SSE frame.
fn sse_frame(event: &ProgressEvent) -> Bytes {
    let json = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Bytes::from(format!("data: {}\n\n", json))
}

fn sse_keepalive() -> Bytes {
    Bytes::from_static(b": keepalive\n\n")
}

/// Build the streaming response for a task.
pub async fn stream_task_progress(
    state: Arc<AppState>,
    task_id: Uuid,
) -> DaemonResult<Response<Body>> {
    // Live topic, or a single terminal snapshot from the store for late
    // subscribers.
    let subscription = state.progress.subscribe(task_id);
    let fallback = if subscription.is_none() {
        let task = state
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| DaemonError::NotFound(format!("task {}", task_id)))?;
        Some(ProgressEvent::from_task(&task))
    } else {
        None
    };

    let stream = async_stream::stream! {
        match subscription {
            None => {
                // Task already settled (or never started a topic): emit the
                // snapshot and close.
                if let Some(event) = fallback {
                    yield Ok::<_, Infallible>(sse_frame(&event));
                }
            }
            Some(mut subscription) => {
                let snapshot = subscription.snapshot.clone();
                yield Ok(sse_frame(&snapshot));
                if snapshot.is_terminal() {
                    return;
                }

                let mut keepalive = tokio::time::interval_at(
                    tokio::time::Instant::now() + KEEPALIVE_INTERVAL,
                    KEEPALIVE_INTERVAL,
                );
                loop {
                    tokio::select! {
                        _ = keepalive.tick() => {
                            yield Ok(sse_keepalive());
                        }
                        received = subscription.receiver.recv() => match received {
                            Ok(event) => {
                                let terminal = event.is_terminal();
                                yield Ok(sse_frame(&event));
                                if terminal {
                                    break;
                                }
                            }
                            Err(RecvError::Lagged(missed)) => {
                                debug!(task_id = %task_id, missed, "SSE subscriber lagged; coalescing");
                                if let Some(latest) = state.progress.latest(task_id) {
                                    let terminal = latest.is_terminal();
                                    yield Ok(sse_frame(&latest));
                                    if terminal {
                                        break;
                                    }
                                }
                            }
                            Err(RecvError::Closed) => {
                                // Topic dropped on terminal publish; surface
                                // the final state from the store.
                                if let Ok(Some(task)) = state.store.get_task(task_id).await {
                                    yield Ok(sse_frame(&ProgressEvent::from_task(&task)));
                                }
                                break;
                            }
                        }
                    }
                }
            }
        }
    };

    Response::builder()
        .status(200)
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        .body(Body::wrap_stream(stream))
        .map_err(|e| DaemonError::ServerError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use triage_core::types::TaskState;

    #[test]
    fn test_sse_frame_format() {
        let event = ProgressEvent {
            task_id: Uuid::new_v4(),
            state: TaskState::Analyzing,
            progress_percent: 60,
            message: "running agent".to_string(),
            updated_at: Utc::now(),
        };
        let frame = sse_frame(&event);
        let text = String::from_utf8(frame.to_vec()).unwrap();
        assert!(text.starts_with("data: {"));
        assert!(text.ends_with("\n\n"));
        assert!(text.contains("\"analyzing\""));
    }

    #[test]
    fn test_keepalive_is_comment() {
        let text = String::from_utf8(sse_keepalive().to_vec()).unwrap();
        assert!(text.starts_with(':'));
    }
}
