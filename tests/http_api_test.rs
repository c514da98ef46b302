// http_api_test.rs
// End-to-end exercises of the HTTP surface through the router:
// upload/download round trip, byte ranges, conditional requests,
// soft delete, mode refusal and the size boundary.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use sha2::{Digest, Sha256};
use storage_element::config::{AuthMode, Config, LogFormat, ReplicaMode};
use storage_element::election::ElectionState;
use storage_element::http_server::{build_router, AppState};
use storage_element::mode::StorageMode;
use tempfile::TempDir;
use tower::util::ServiceExt;

const BOUNDARY: &str = "se-test-boundary";

fn test_config(dir: &TempDir, mode: StorageMode) -> Config {
    Config {
        port: 8010,
        storage_id: "se-api-test".into(),
        data_dir: dir.path().join("data"),
        wal_dir: dir.path().join("wal"),
        mode,
        max_file_size: 2048,
        max_capacity: 1024 * 1024,
        gc_interval: Duration::from_secs(300),
        reconcile_interval: Duration::from_secs(3600),
        replica_mode: ReplicaMode::Standalone,
        index_refresh_interval: Duration::from_secs(30),
        election_retry_interval: Duration::from_secs(5),
        shutdown_timeout: Duration::from_secs(5),
        tls_cert: None,
        tls_key: None,
        jwks_url: None,
        ca_cert: None,
        log_level: "info".into(),
        log_format: LogFormat::Text,
        http_timeout: Duration::from_secs(60),
        client_timeout: Duration::from_secs(30),
        jwt_leeway: Duration::from_secs(30),
        auth_mode: AuthMode::Open,
        advertise_addr: "127.0.0.1:8010".into(),
        proxy_tls_verify: true,
    }
}

async fn app_with_mode(mode: StorageMode) -> (axum::Router, Arc<AppState>, TempDir) {
    let dir = TempDir::new().unwrap();
    let config = Arc::new(test_config(&dir, mode));
    let state = AppState::initialize(config, ElectionState::standalone())
        .await
        .unwrap();
    (build_router(state.clone()), state, dir)
}

fn multipart_body(filename: &str, payload: &[u8], extra_fields: &[(&str, &str)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in extra_fields {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(payload);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn upload_request(filename: &str, payload: &[u8], extra_fields: &[(&str, &str)]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/v1/files/upload")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(multipart_body(filename, payload, extra_fields)))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn upload(router: &axum::Router, filename: &str, payload: &[u8]) -> serde_json::Value {
    let response = router
        .clone()
        .oneshot(upload_request(filename, payload, &[]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    json_body(response).await
}

#[tokio::test]
async fn upload_then_download_round_trip() {
    let (router, _state, _dir) = app_with_mode(StorageMode::Edit).await;
    let payload: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();

    let meta = upload(&router, "u.bin", &payload).await;
    let file_id = meta["file_id"].as_str().unwrap().to_string();

    let expected_checksum = hex::encode(Sha256::digest(&payload));
    assert_eq!(meta["checksum"].as_str().unwrap(), expected_checksum);
    assert_eq!(meta["size"].as_u64().unwrap(), 1024);
    assert_eq!(meta["status"], "active");
    assert_eq!(meta["original_filename"], "u.bin");

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/files/{file_id}/download"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap(),
        "application/octet-stream"
    );
    assert_eq!(
        response
            .headers()
            .get("etag")
            .unwrap()
            .to_str()
            .unwrap(),
        format!("\"{expected_checksum}\"")
    );

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(bytes.as_ref(), payload.as_slice());
}

#[tokio::test]
async fn range_request_returns_partial_content() {
    let (router, _state, _dir) = app_with_mode(StorageMode::Edit).await;
    let payload: Vec<u8> = (0..=255u8).cycle().take(1024).collect();
    let meta = upload(&router, "ranged.bin", &payload).await;
    let file_id = meta["file_id"].as_str().unwrap().to_string();

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/files/{file_id}/download"))
                .header("range", "bytes=0-99")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response
            .headers()
            .get("content-range")
            .unwrap()
            .to_str()
            .unwrap(),
        "bytes 0-99/1024"
    );

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(bytes.len(), 100);
    assert_eq!(bytes.as_ref(), &payload[..100]);
}

#[tokio::test]
async fn range_past_end_is_clamped() {
    let (router, _state, _dir) = app_with_mode(StorageMode::Edit).await;
    let meta = upload(&router, "short.bin", b"17 bytes exactly!").await;
    let file_id = meta["file_id"].as_str().unwrap().to_string();

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/files/{file_id}/download"))
                .header("range", "bytes=0-99")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response
            .headers()
            .get("content-range")
            .unwrap()
            .to_str()
            .unwrap(),
        "bytes 0-16/17"
    );
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(bytes.len(), 17);
}

#[tokio::test]
async fn unsatisfiable_range_is_416() {
    let (router, _state, _dir) = app_with_mode(StorageMode::Edit).await;
    let meta = upload(&router, "tiny.bin", b"abc").await;
    let file_id = meta["file_id"].as_str().unwrap().to_string();

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/files/{file_id}/download"))
                .header("range", "bytes=100-200")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
}

#[tokio::test]
async fn if_none_match_returns_not_modified() {
    let (router, _state, _dir) = app_with_mode(StorageMode::Edit).await;
    let meta = upload(&router, "cached.bin", b"cache me").await;
    let file_id = meta["file_id"].as_str().unwrap().to_string();
    let etag = format!("\"{}\"", meta["checksum"].as_str().unwrap());

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/files/{file_id}/download"))
                .header("if-none-match", &etag)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
}

#[tokio::test]
async fn soft_delete_keeps_metadata_readable() {
    let (router, _state, _dir) = app_with_mode(StorageMode::Edit).await;
    let meta = upload(&router, "doomed.bin", b"delete me").await;
    let file_id = meta["file_id"].as_str().unwrap().to_string();

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/v1/files/{file_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    // Deleting twice is fine.
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/v1/files/{file_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/files/{file_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "deleted");

    // A deleted object no longer downloads.
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/files/{file_id}/download"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn upload_is_refused_in_ro_mode() {
    let (router, _state, _dir) = app_with_mode(StorageMode::Ro).await;
    let response = router
        .clone()
        .oneshot(upload_request("nope.bin", b"data", &[]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = json_body(response).await;
    assert_eq!(body["code"], "MODE_NOT_ALLOWED");
}

#[tokio::test]
async fn max_file_size_boundary() {
    let (router, _state, _dir) = app_with_mode(StorageMode::Rw).await;

    // Exactly at the limit succeeds.
    let exact = vec![0u8; 2048];
    let response = router
        .clone()
        .oneshot(upload_request("exact.bin", &exact, &[]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    // One byte more is FILE_TOO_LARGE.
    let over = vec![0u8; 2049];
    let response = router
        .clone()
        .oneshot(upload_request("over.bin", &over, &[]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let body = json_body(response).await;
    assert_eq!(body["code"], "FILE_TOO_LARGE");
}

#[tokio::test]
async fn upload_with_retention_fields_in_edit_mode() {
    let (router, _state, _dir) = app_with_mode(StorageMode::Edit).await;
    let response = router
        .clone()
        .oneshot(upload_request(
            "tmp.bin",
            b"temporary payload",
            &[
                ("retention_policy", "temporary"),
                ("ttl_days", "7"),
                ("tags", "reports, q3"),
                ("description", "expiring upload"),
            ],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let meta = json_body(response).await;
    assert_eq!(meta["retention_policy"], "temporary");
    assert_eq!(meta["ttl_days"].as_u64().unwrap(), 7);
    assert!(meta["expires_at"].as_str().is_some());
    assert_eq!(meta["tags"], serde_json::json!(["q3", "reports"]));
    assert_eq!(meta["description"], "expiring upload");
}

#[tokio::test]
async fn patch_then_list_reflects_changes() {
    let (router, _state, _dir) = app_with_mode(StorageMode::Rw).await;
    let meta = upload(&router, "patch.bin", b"patchable").await;
    let file_id = meta["file_id"].as_str().unwrap().to_string();

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("PATCH")
                .uri(format!("/api/v1/files/{file_id}"))
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::json!({
                        "description": "patched",
                        "tags": ["alpha"]
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["description"], "patched");

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/files?status=active&tag=alpha")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["total"].as_u64().unwrap(), 1);
    assert_eq!(body["files"][0]["file_id"].as_str().unwrap(), file_id);
}

#[tokio::test]
async fn unknown_file_is_404_with_error_body() {
    let (router, _state, _dir) = app_with_mode(StorageMode::Rw).await;
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/files/00000000-0000-4000-8000-000000000000")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = json_body(response).await;
    assert_eq!(body["code"], "NOT_FOUND");
    assert!(body["message"].as_str().unwrap().contains("not found"));
}

#[tokio::test]
async fn mode_transition_endpoint_enforces_guard() {
    let (router, _state, _dir) = app_with_mode(StorageMode::Rw).await;

    // rw -> ro is legal.
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/mode/transition")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"target_mode":"ro"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // ro -> rw without confirmation is refused.
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/mode/transition")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"target_mode":"rw"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = json_body(response).await;
    assert_eq!(body["code"], "CONFIRMATION_REQUIRED");

    // With the flag it works, and the history shows both transitions.
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/mode/transition")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"target_mode":"rw","confirm":true}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/mode")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["mode"], "rw");
    assert_eq!(body["history"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn storage_info_and_probes() {
    let (router, _state, _dir) = app_with_mode(StorageMode::Rw).await;
    upload(&router, "info.bin", b"12345").await;

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/storage/info")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["storage_id"], "se-api-test");
    assert_eq!(body["files_active"].as_u64().unwrap(), 1);
    assert_eq!(body["active_bytes"].as_u64().unwrap(), 5);
    assert_eq!(body["is_leader"], true);
    assert_eq!(body["role"], "standalone");

    for probe in ["/health/live", "/health/ready"] {
        let response = router
            .clone()
            .oneshot(Request::builder().uri(probe).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "{probe}");
    }

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let text = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(text.to_vec()).unwrap();
    assert!(text.contains("se_uploads_ok_total 1"));
}

#[tokio::test]
async fn reconcile_endpoint_returns_report() {
    let (router, _state, _dir) = app_with_mode(StorageMode::Rw).await;
    upload(&router, "sound.bin", b"healthy").await;

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/maintenance/reconcile")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["scanned"].as_u64().unwrap(), 1);
    assert_eq!(body["orphan_data_files"].as_u64().unwrap(), 0);

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/maintenance/reconcile/last")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
