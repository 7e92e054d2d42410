//! HTTP surface and post-commit webhook delivery.

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use costgov::config::{Config, StoreKind};
use costgov::notification::webhook::sign_payload;
use costgov::notification::{Notifier, WebhookNotifier};
use costgov::{api, AppState};

const ADMIN_KEY: &str = "test-admin-key";

fn test_config() -> Config {
    Config {
        port: 0,
        database_url: String::new(),
        store: StoreKind::Memory,
        admin_key: Some(ADMIN_KEY.into()),
        env: "test".into(),
        sweep_interval_secs: 60,
        sweep_batch_size: 100,
        slack_webhook_url: None,
        webhook_urls: Vec::new(),
        webhook_secret: None,
        escalation_timeout_hours: 72,
    }
}

async fn app() -> (Router, common::Harness) {
    let h = common::harness().await;
    let state = Arc::new(AppState {
        engine: h.engine.clone(),
        config: test_config(),
    });
    (api::app(state), h)
}

fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-admin-key", ADMIN_KEY)
        .header("content-type", "application/json");
    match body {
        Some(b) => builder.body(Body::from(b.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn cost_body(h: &common::Harness, amount: i64) -> Value {
    json!({
        "category": "logistics",
        "amount": amount.to_string(),
        "reference_type": "logistics_cost",
        "reference_id": Uuid::new_v4(),
        "requested_by": h.requester,
    })
}

mod auth {
    use super::*;

    #[tokio::test]
    async fn test_health_needs_no_key() {
        let (app, _h) = app().await;
        let resp = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readiness_checks_store() {
        let (app, _h) = app().await;
        let resp = app
            .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_management_api_rejects_missing_or_wrong_key() {
        let (app, _h) = app().await;

        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/api/v1/policies").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/policies")
                    .header("x-admin-key", "wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}

mod flows {
    use super::*;

    #[tokio::test]
    async fn test_evaluate_then_reject_then_late_vote() {
        let (app, h) = app().await;

        let (status, body) = send(&app, request("POST", "/api/v1/evaluate", Some(cost_body(&h, 72_000)))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], "blocked");
        assert_eq!(body["workflow_type"], "fc_gm_dual");
        assert_eq!(body["overage_amount"], "22000");
        let workflow_id = body["workflow_id"].as_str().unwrap().to_string();
        let violation_id = body["violation_id"].as_str().unwrap().to_string();

        let (status, pending) = send(&app, request("GET", "/api/v1/workflows/pending?role=fc", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(pending.as_array().unwrap().len(), 1);

        let uri = format!("/api/v1/workflows/{}/decisions", workflow_id);
        let (status, body) = send(
            &app,
            request("POST", &uri, Some(json!({ "approver_id": h.fc, "decision": "reject", "comment": "no PO" }))),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["violation_status"], "rejected");
        assert!(body["deduction_id"].is_string());

        let (status, body) = send(
            &app,
            request("POST", &uri, Some(json!({ "approver_id": h.gm, "decision": "approve" }))),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "workflow_not_pending");
        assert_eq!(body["error"]["resolved_as"], "rejected");

        let (status, deductions) = send(&app, request("GET", "/api/v1/deductions?status=pending", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(deductions.as_array().unwrap().len(), 1);
        assert_eq!(deductions[0]["amount"], "22000");

        let (status, chain) = send(&app, request("GET", &format!("/api/v1/violations/{}/audit", violation_id), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(chain[0]["action"], "violation_registered");
    }

    #[tokio::test]
    async fn test_escalation_endpoint_opens_ceo_review() {
        let (app, h) = app().await;
        let b = h.block(72_000).await;
        h.decide(b.workflow_id, h.gm, costgov::models::workflow::Decision::Reject)
            .await
            .unwrap();

        let uri = format!("/api/v1/violations/{}/escalations", b.violation_id);
        let (status, body) = send(
            &app,
            request(
                "POST",
                &uri,
                Some(json!({ "justification": "customs hold", "requested_by": h.requester })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["status"], "pending_approval");
        assert_eq!(body["approval_required"], json!(["ceo"]));

        // A second escalation while the first is pending is refused.
        let (status, body) = send(
            &app,
            request(
                "POST",
                &uri,
                Some(json!({ "justification": "again", "requested_by": h.requester })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "invalid_escalation_state");
    }

    #[tokio::test]
    async fn test_payroll_transitions() {
        let (app, h) = app().await;
        let b = h.block(72_000).await;
        let id = h
            .decide(b.workflow_id, h.fc, costgov::models::workflow::Decision::Reject)
            .await
            .unwrap()
            .deduction_id
            .unwrap();

        let (status, body) = send(
            &app,
            request("POST", &format!("/api/v1/deductions/{}/failed", id), Some(json!({ "reason": "bank reject" }))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "failed");

        let (status, body) = send(&app, request("POST", &format!("/api/v1/deductions/{}/retry", id), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "pending");

        let (status, body) = send(&app, request("POST", &format!("/api/v1/deductions/{}/processed", id), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "processed");

        let (status, body) = send(&app, request("POST", &format!("/api/v1/deductions/{}/cancel", id), None)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "invalid_deduction_transition");
    }
}

mod errors {
    use super::*;

    #[tokio::test]
    async fn test_bad_decision_value_is_validation_error() {
        let (app, h) = app().await;
        let b = h.block(72_000).await;
        let (status, body) = send(
            &app,
            request(
                "POST",
                &format!("/api/v1/workflows/{}/decisions", b.workflow_id),
                Some(json!({ "approver_id": h.fc, "decision": "maybe" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "validation_failed");
    }

    #[tokio::test]
    async fn test_unknown_category_is_unprocessable() {
        let (app, h) = app().await;
        let mut body = cost_body(&h, 10_000);
        body["category"] = json!("marketing");
        let (status, body) = send(&app, request("POST", "/api/v1/evaluate", Some(body))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["code"], "policy_not_found");
    }

    #[tokio::test]
    async fn test_sub_cent_amount_is_validation_error() {
        let (app, h) = app().await;
        let mut body = cost_body(&h, 0);
        body["amount"] = json!("50000.004");
        let (status, body) = send(&app, request("POST", "/api/v1/evaluate", Some(body))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "validation_failed");

        let (_, violations) = send(&app, request("GET", "/api/v1/violations", None)).await;
        assert_eq!(violations.as_array().map(Vec::len), Some(0));
    }

    #[tokio::test]
    async fn test_missing_violation_is_not_found() {
        let (app, _h) = app().await;
        let (status, body) = send(&app, request("GET", &format!("/api/v1/violations/{}", Uuid::new_v4()), None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["type"], "not_found_error");
    }

    #[tokio::test]
    async fn test_invalid_tier_is_rejected() {
        let (app, h) = app().await;
        let (status, _) = send(
            &app,
            request(
                "PUT",
                "/api/v1/tiers",
                Some(json!({ "workflow_type": "fc_only", "required_approvers": ["fc"], "timeout_hours": 0 })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            request(
                "PUT",
                "/api/v1/tiers",
                Some(json!({ "workflow_type": "fc_only", "required_approvers": ["fc"], "timeout_hours": i64::MAX / 2 })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // The rejected window never reached the policy book.
        let (status, body) = send(&app, request("POST", "/api/v1/evaluate", Some(cost_body(&h, 51_000)))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], "blocked");
    }
}

mod webhooks {
    use super::*;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn wait_for(server: &MockServer, count: usize) -> Vec<wiremock::Request> {
        for _ in 0..50 {
            let received = server.received_requests().await.unwrap_or_default();
            if received.len() >= count {
                return received;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        server.received_requests().await.unwrap_or_default()
    }

    #[tokio::test]
    async fn test_signed_events_follow_each_commit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks"))
            .and(header_exists("x-costgov-signature"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let notifier = Notifier::new(
            vec![format!("{}/hooks", server.uri())],
            Some("s3cret".into()),
            None,
        )
        .with_webhook(WebhookNotifier::without_retries());
        let h = common::harness_with(notifier).await;

        let b = h.block(72_000).await;
        let received = wait_for(&server, 1).await;
        assert_eq!(received.len(), 1);
        let first = &received[0];
        let event = first
            .headers
            .get("x-costgov-event")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert_eq!(event, "violation_blocked");
        let signature = first
            .headers
            .get("x-costgov-signature")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert_eq!(Some(signature), sign_payload("s3cret", &first.body));

        h.decide(b.workflow_id, h.fc, costgov::models::workflow::Decision::Reject)
            .await
            .unwrap();
        let received = wait_for(&server, 3).await;
        let mut events: Vec<String> = received
            .iter()
            .filter_map(|r| r.headers.get("x-costgov-event").and_then(|v| v.to_str().ok()).map(String::from))
            .collect();
        events.sort();
        assert_eq!(events, vec!["deduction_issued", "violation_blocked", "workflow_resolved"]);
    }
}
