//! Webhook endpoints for the tracker and the repository host.
//!
//! Both verify an HMAC-SHA256 signature when `WEBHOOK_SECRET` is set, then
//! either queue a run or record the reported status on an existing one.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Json,
};
use serde_json::Value;

use super::routes::{ApiError, AppState};
use super::types::WebhookOutcome;
use crate::tracker::webhook::{parse_github, parse_linear, verify_signature};

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn authenticate(state: &AppState, body: &[u8], signature: Option<&str>) -> Result<Value, ApiError> {
    if !verify_signature(state.config.webhook_secret.as_deref(), body, signature) {
        tracing::warn!("Rejected webhook with a missing or invalid signature");
        return Err((StatusCode::UNAUTHORIZED, "invalid signature".to_string()));
    }
    serde_json::from_slice(body).map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid JSON: {}", e)))
}

fn ignored(reason: impl Into<String>) -> (StatusCode, Json<WebhookOutcome>) {
    (
        StatusCode::OK,
        Json(WebhookOutcome::Ignored {
            reason: reason.into(),
        }),
    )
}

/// Linear issue events.
///
/// An issue already linked to a run only updates that run's external
/// status; otherwise a triggering issue starts a new run.
pub(super) async fn linear(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookOutcome>), ApiError> {
    let payload = authenticate(&state, &body, header(&headers, "linear-signature"))?;
    let Some(event) = parse_linear(&payload) else {
        return Ok(ignored("not an issue create/update event"));
    };
    let tracker_event = event.to_tracker_event();

    let linked = state
        .store
        .find_by_tracker_issue(&tracker_event.issue_id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e))?;
    if let Some(link) = linked {
        let run_id = link.run_id;
        if let Some(task_id) = link.task_id {
            // issues filed for a run's own tasks never start another run
            tracing::debug!("Tracker event for task {} of run {}", task_id, run_id);
            return Ok((StatusCode::OK, Json(WebhookOutcome::Correlated { run_id })));
        }
        let Some(status) = tracker_event.status.as_deref() else {
            return Ok(ignored("no status in event"));
        };
        state
            .store
            .set_external_status(run_id, status)
            .await
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e))?;
        tracing::debug!("Run {} reported as '{}' by the tracker", run_id, status);
        return Ok((StatusCode::OK, Json(WebhookOutcome::Correlated { run_id })));
    }

    let Some(route) = event.route() else {
        return Ok(ignored("issue is not marked for automation"));
    };
    let run = state.queue.submit(event.to_request()).await?;
    tracing::info!(
        "Tracker issue {} started run {} ({:?})",
        event.identifier.as_deref().unwrap_or(&event.issue_id),
        run.id,
        route
    );
    Ok((StatusCode::ACCEPTED, Json(WebhookOutcome::Started { run_id: run.id })))
}

/// GitHub issue and review comments addressed to the bot.
pub(super) async fn github(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookOutcome>), ApiError> {
    let payload = authenticate(&state, &body, header(&headers, "x-hub-signature-256"))?;
    let event = header(&headers, "x-github-event").unwrap_or_default();

    let Some(request) = parse_github(event, &payload) else {
        return Ok(ignored(format!("no trigger in '{}' event", event)));
    };
    let run = state.queue.submit(request).await?;
    tracing::info!("GitHub {} event started run {}", event, run.id);
    Ok((StatusCode::ACCEPTED, Json(WebhookOutcome::Started { run_id: run.id })))
}

#[cfg(test)]
mod tests {
    use super::super::routes::tests::{body_json, test_app};
    use axum::body::Body;
    use axum::http::Request;
    use hmac::{Hmac, Mac};
    use serde_json::json;
    use sha2::Sha256;
    use tower::ServiceExt;

    use super::*;
    use crate::agents::Role;
    use crate::run::{Run, RunRequest, RunStore};
    use crate::task::Task;

    fn sign(secret: &str, body: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body.as_bytes());
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn issue(id: &str, title: &str, state: &str) -> String {
        json!({
            "type": "Issue",
            "action": "update",
            "data": {"id": id, "title": title, "state": {"name": state}}
        })
        .to_string()
    }

    fn linear_request(body: String, signature: Option<String>) -> Request<Body> {
        let mut builder = Request::post("/webhook/linear").header("content-type", "application/json");
        if let Some(signature) = signature {
            builder = builder.header("linear-signature", signature);
        }
        builder.body(Body::from(body)).unwrap()
    }

    #[tokio::test]
    async fn test_bad_signature_is_rejected() {
        let mut t = test_app(Some("s3cret"));
        let body = issue("iss-1", "[AI] Add dark mode", "Todo");

        let response = t
            .app
            .oneshot(linear_request(body, Some(sign("wrong", "x"))))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(t.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_triggering_issue_starts_linked_run() {
        let mut t = test_app(Some("s3cret"));
        let body = issue("iss-1", "[AI] Add dark mode", "Todo");
        let signature = sign("s3cret", &body);

        let response = t
            .app
            .oneshot(linear_request(body, Some(signature)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(response).await["result"], "started");
        let queued = t.rx.recv().await.unwrap();
        assert_eq!(queued.request.tracker_issue.as_deref(), Some("iss-1"));
        assert_eq!(queued.request.requirement, "Add dark mode");
    }

    #[tokio::test]
    async fn test_status_is_correlated_onto_existing_run() {
        let mut t = test_app(None);
        let run = Run::new(RunRequest::new("Add dark mode").with_tracker_issue("iss-1"));
        t.store.save(run.clone()).await.unwrap();

        let response = t
            .app
            .oneshot(linear_request(issue("iss-1", "[AI] Add dark mode", "In Review"), None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["result"], "correlated");
        assert_eq!(body["runId"], run.id.to_string());
        let stored = t.store.get(run.id).await.unwrap().unwrap();
        assert_eq!(stored.external_status.as_deref(), Some("In Review"));
        assert!(t.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_task_issue_event_does_not_start_another_run() {
        let mut t = test_app(None);
        let mut run = Run::new(RunRequest::new("Image upload").with_tracker_issue("iss-1"));
        let mut task = Task::new(run.id, 1, Role::Backend, "upload endpoint").unwrap();
        task.set_tracker_issue("iss-2");
        run.tasks.push(task);
        t.store.save(run.clone()).await.unwrap();

        // the title carries a role tag, so on its own it would start a run
        let body = issue("iss-2", "[backend] upload endpoint", "In Progress");
        let response = t.app.oneshot(linear_request(body, None)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["result"], "correlated");
        assert_eq!(body["runId"], run.id.to_string());
        assert!(t.rx.try_recv().is_err());
        let stored = t.store.get(run.id).await.unwrap().unwrap();
        assert_eq!(stored.external_status, None);
    }

    #[tokio::test]
    async fn test_role_tagged_issue_starts_single_role_run() {
        let mut t = test_app(None);
        let body = issue("iss-9", "[database] add a tags table", "Todo");

        let response = t.app.oneshot(linear_request(body, None)).await.unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let queued = t.rx.recv().await.unwrap();
        assert_eq!(queued.request.role, Some(Role::Database));
        assert_eq!(queued.request.requirement, "add a tags table");
    }

    #[tokio::test]
    async fn test_github_comment_without_trigger_is_ignored() {
        let mut t = test_app(None);
        let body = json!({
            "action": "created",
            "comment": {"body": "looks fine", "user": {"type": "User"}},
            "issue": {"title": "Image upload"}
        });

        let response = t
            .app
            .oneshot(
                Request::post("/webhook/github")
                    .header("x-github-event", "issue_comment")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["result"], "ignored");
        assert!(t.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_github_mention_starts_run() {
        let mut t = test_app(None);
        let body = json!({
            "action": "created",
            "comment": {"body": "/ai add a file size limit", "user": {"type": "User"}},
            "issue": {"title": "Image upload"},
            "repository": {"full_name": "acme/app"}
        });

        let response = t
            .app
            .oneshot(
                Request::post("/webhook/github")
                    .header("x-github-event", "issue_comment")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let queued = t.rx.recv().await.unwrap();
        assert_eq!(queued.request.repository.as_deref(), Some("acme/app"));
    }
}
