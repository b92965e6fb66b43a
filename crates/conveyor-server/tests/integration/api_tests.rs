use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;
use uuid::Uuid;

use conveyor_core::artifact::Artifact;
use conveyor_core::execution::{Execution, ExecutionState};
use conveyor_core::store::{Expect, MetadataStore, collections, to_body};
use conveyor_core::testutil::{make_test_job, seed_job};

use crate::integration::common::{ADMIN_KEY, ANALYST_KEY, DEV_KEY, setup_test_app, setup_with_governor};

fn submit_body(url: &str) -> serde_json::Value {
    serde_json::json!({
        "kind": "scrape",
        "parameters": { "url": url },
    })
}

async fn json_of(response: axum::response::Response) -> serde_json::Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn healthz_returns_200() {
    let app = setup_test_app();

    let response = app
        .router
        .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_of(response).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["metadata_store"], "ok");
}

#[tokio::test]
async fn unauthenticated_request_gets_error_envelope() {
    let app = setup_test_app();

    let response = app
        .router
        .oneshot(Request::get("/v1/jobs").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let json = json_of(response).await;
    assert_eq!(json["error"], "unauthenticated");
    assert!(json["trace_id"].as_str().is_some_and(|t| !t.is_empty()));
}

#[tokio::test]
async fn wrong_api_key_returns_401() {
    let app = setup_test_app();

    let response = app
        .router
        .oneshot(
            Request::get("/v1/jobs")
                .header("authorization", "Bearer wrong-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn submit_and_get_job() {
    let app = setup_test_app();

    let response = app
        .router
        .clone()
        .oneshot(
            Request::post("/v1/jobs")
                .header("authorization", format!("Bearer {DEV_KEY}"))
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::to_vec(&submit_body("https://example.test/a")).unwrap(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let json = json_of(response).await;
    assert_eq!(json["state"], "pending_dispatch");
    assert_eq!(json["kind"], "scrape");
    assert_eq!(json["tenant_id"], "tenant-a");
    let job_id = json["id"].as_str().unwrap().to_string();

    let response = app
        .router
        .oneshot(
            Request::get(format!("/v1/jobs/{job_id}"))
                .header("authorization", format!("Bearer {DEV_KEY}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_of(response).await;
    assert_eq!(json["id"], job_id.as_str());
    assert_eq!(json["parameters"]["url"], "https://example.test/a");
}

#[tokio::test]
async fn identical_submissions_return_the_same_job() {
    let app = setup_test_app();

    let mut ids = Vec::new();
    for _ in 0..2 {
        let response = app
            .router
            .clone()
            .oneshot(
                Request::post("/v1/jobs")
                    .header("authorization", format!("Bearer {DEV_KEY}"))
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::to_vec(&submit_body("https://example.test/same")).unwrap(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        ids.push(json_of(response).await["id"].as_str().unwrap().to_string());
    }
    assert_eq!(ids[0], ids[1]);
}

#[tokio::test]
async fn invalid_parameters_return_400() {
    let app = setup_test_app();

    let response = app
        .router
        .oneshot(
            Request::post("/v1/jobs")
                .header("authorization", format!("Bearer {DEV_KEY}"))
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::to_vec(&submit_body("not a url")).unwrap(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let json = json_of(response).await;
    assert_eq!(json["error"], "invalid_request");
}

#[tokio::test]
async fn analyst_may_read_but_not_submit() {
    let app = setup_test_app();

    let response = app
        .router
        .clone()
        .oneshot(
            Request::post("/v1/jobs")
                .header("authorization", format!("Bearer {ANALYST_KEY}"))
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::to_vec(&submit_body("https://example.test/a")).unwrap(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .router
        .oneshot(
            Request::get("/v1/jobs")
                .header("authorization", format!("Bearer {ANALYST_KEY}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn cancel_job_then_conflict_on_second_cancel() {
    let app = setup_test_app();
    let job = seed_job(&app.store, make_test_job("tenant-a")).await;

    let response = app
        .router
        .clone()
        .oneshot(
            Request::delete(format!("/v1/jobs/{}", job.id))
                .header("authorization", format!("Bearer {DEV_KEY}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .router
        .oneshot(
            Request::delete(format!("/v1/jobs/{}", job.id))
                .header("authorization", format!("Bearer {DEV_KEY}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn other_tenants_jobs_are_invisible() {
    let app = setup_test_app();
    let job = seed_job(&app.store, make_test_job("tenant-b")).await;

    let response = app
        .router
        .oneshot(
            Request::get(format!("/v1/jobs/{}", job.id))
                .header("authorization", format!("Bearer {DEV_KEY}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn missing_job_returns_404() {
    let app = setup_test_app();

    let response = app
        .router
        .oneshot(
            Request::get(format!("/v1/jobs/{}", Uuid::now_v7()))
                .header("authorization", format!("Bearer {DEV_KEY}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn artifact_metadata_and_body_roundtrip() {
    let app = setup_test_app();
    let job = seed_job(&app.store, make_test_job("tenant-a")).await;

    let execution = Execution {
        id: Uuid::now_v7(),
        job_id: job.id,
        attempt_number: 1,
        state: ExecutionState::Succeeded,
        created_at: job.created_at,
        updated_at: job.created_at,
        dispatched_at: None,
        started_at: None,
        finished_at: None,
        worker_id: None,
        outcome: None,
        error_kind: None,
        error_detail: None,
        produced_artifacts: vec![],
    };
    app.store
        .put(
            collections::EXECUTIONS,
            &execution.id.to_string(),
            to_body(&execution).unwrap(),
            Expect::Absent,
        )
        .await
        .unwrap();

    let payload = b"<html>body bytes</html>";
    let uri = app.blobs.put_direct("tenant-a/scrape/a", payload).await;
    let artifact = Artifact {
        id: Uuid::now_v7(),
        execution_id: execution.id,
        storage_uri: uri,
        content_type: "text/html".into(),
        size_bytes: payload.len() as u64,
        sha256: "de".repeat(32),
        metadata: Default::default(),
        created_at: job.created_at,
    };
    app.store
        .put(
            collections::ARTIFACTS,
            &artifact.id.to_string(),
            to_body(&artifact).unwrap(),
            Expect::Absent,
        )
        .await
        .unwrap();

    let response = app
        .router
        .clone()
        .oneshot(
            Request::get(format!("/v1/artifacts/{}", artifact.id))
                .header("authorization", format!("Bearer {DEV_KEY}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_of(response).await;
    assert_eq!(json["content_type"], "text/html");
    assert_eq!(json["size_bytes"], payload.len());

    let response = app
        .router
        .oneshot(
            Request::get(format!("/v1/artifacts/{}/body", artifact.id))
                .header("authorization", format!("Bearer {DEV_KEY}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/html"
    );
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], payload);
}

#[tokio::test]
async fn dlq_operations_require_admin() {
    let app = setup_test_app();

    let redrive = serde_json::json!({"kind": "scrape", "ids": [Uuid::now_v7()]});
    let response = app
        .router
        .clone()
        .oneshot(
            Request::post("/v1/admin/dlq/redrive")
                .header("authorization", format!("Bearer {DEV_KEY}"))
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&redrive).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .router
        .oneshot(
            Request::post("/v1/admin/dlq/redrive")
                .header("authorization", format!("Bearer {ADMIN_KEY}"))
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&redrive).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_of(response).await;
    assert_eq!(json["redriven"], 0);
}

#[tokio::test]
async fn status_reports_queue_depths() {
    let app = setup_test_app();

    let response = app
        .router
        .oneshot(Request::get("/v1/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_of(response).await;
    assert!(json["queues"]["scrape"]["pending"].is_number());
    assert!(json["queues"]["ocr"]["pending"].is_number());
    assert!(json["uptime_secs"].is_number());
}

#[tokio::test]
async fn quota_exhaustion_returns_429_with_retry_after() {
    let app = setup_with_governor(conveyor_core::governor::GovernorConfig {
        capacity: 2.0,
        refill_per_sec: 0.1,
        ..conveyor_core::governor::GovernorConfig::default()
    });

    for _ in 0..2 {
        let response = app
            .router
            .clone()
            .oneshot(
                Request::get("/v1/jobs")
                    .header("authorization", format!("Bearer {DEV_KEY}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app
        .router
        .oneshot(
            Request::get("/v1/jobs")
                .header("authorization", format!("Bearer {DEV_KEY}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = response
        .headers()
        .get("retry-after")
        .expect("Retry-After header")
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1);

    let json = json_of(response).await;
    assert_eq!(json["error"], "rate_limited");
}
