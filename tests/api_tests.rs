use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use std::sync::Arc;
use tower::util::ServiceExt;

use melodia::db::open_pool;
use melodia::generation::{MockGenerator, ProviderTaskStatus};
use melodia::lyricist::MockLyricsWriter;
use melodia::mailer::MockMailer;
use melodia::payments::{sign_body, PaymentStore, RazorpayClient, PRICE_PAISE};
use melodia::requests::RequestStore;
use melodia::server::{create_router, AppState};
use melodia::songs::SongStore;
use melodia::status::VariantUpdate;
use melodia::users::UserStore;

const AUTH_SECRET: &str = "test-auth-secret";
const WEBHOOK_SECRET: &str = "test-webhook-secret";

struct TestApp {
    app: Router,
    state: AppState,
    mailer: Arc<MockMailer>,
}

async fn test_app(scripted: Vec<ProviderTaskStatus>) -> (tempfile::TempDir, TestApp) {
    let dir = tempfile::tempdir().unwrap();
    let pool = open_pool(dir.path().join("test.db")).await.unwrap();

    let users = UserStore::new(pool.clone()).await.unwrap();
    let requests = RequestStore::new(pool.clone()).await.unwrap();
    let songs = SongStore::new(pool.clone()).await.unwrap();
    let payment_store = PaymentStore::new(pool).await.unwrap();

    let mailer = Arc::new(MockMailer::new());
    let payments = RazorpayClient::new(
        "rzp_test_key".to_string(),
        "rzp_test_secret".to_string(),
        WEBHOOK_SECRET.to_string(),
    )
    .unwrap();

    let state = AppState {
        users,
        requests,
        songs,
        payment_store,
        generator: Arc::new(MockGenerator::new(scripted)),
        lyricist: Arc::new(MockLyricsWriter),
        mailer: mailer.clone(),
        payments: Arc::new(payments),
        auth_secret: AUTH_SECRET.to_string(),
    };

    let app = create_router(state.clone());
    (dir, TestApp { app, state, mailer })
}

async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    headers: &[(&str, &str)],
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }

    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };

    (status, value)
}

/// Run the full OTP flow and return a bearer token.
async fn sign_in(t: &TestApp, email: &str) -> String {
    let (status, _) = send(
        &t.app,
        "POST",
        "/auth/otp/request",
        &[],
        Some(serde_json::json!({ "email": email })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let sent = t.mailer.sent().await;
    let mail = sent.last().expect("sign-in code was emailed");
    let code_regex = regex::Regex::new(r"\d{6}").unwrap();
    let code = code_regex.find(&mail.html).unwrap().as_str().to_string();

    let (status, body) = send(
        &t.app,
        "POST",
        "/auth/otp/verify",
        &[],
        Some(serde_json::json!({ "email": email, "code": code })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body["token"].as_str().unwrap().to_string()
}

async fn anonymous_session(t: &TestApp) -> String {
    let (status, body) = send(&t.app, "POST", "/auth/anonymous", &[], None).await;
    assert_eq!(status, StatusCode::OK);
    body["id"].as_str().unwrap().to_string()
}

async fn create_request(t: &TestApp, headers: &[(&str, &str)]) -> String {
    let (status, body) = send(
        &t.app,
        "POST",
        "/requests",
        headers,
        Some(serde_json::json!({
            "recipient_name": "Maya",
            "occasion": "birthday",
            "languages": ["English"],
            "mood": "joyful",
            "story": "She just ran her first marathon"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body["id"].as_str().unwrap().to_string()
}

/// Draft, approve, pay, and start generation; returns (request_id, song_id).
async fn generate_song(t: &TestApp, headers: &[(&str, &str)]) -> (String, String) {
    let request_id = create_request(t, headers).await;

    let (status, draft) = send(
        &t.app,
        "POST",
        &format!("/requests/{}/lyrics", request_id),
        headers,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &t.app,
        "POST",
        &format!("/requests/{}/approve", request_id),
        headers,
        Some(serde_json::json!({ "draft_id": draft["id"] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    t.state.requests.mark_paid(&request_id).await.unwrap();

    let (status, song) = send(
        &t.app,
        "POST",
        &format!("/requests/{}/generate", request_id),
        headers,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    (request_id, song["id"].as_str().unwrap().to_string())
}

#[tokio::test]
async fn otp_sign_in_flow() {
    let (_dir, t) = test_app(Vec::new()).await;
    let token = sign_in(&t, "maya@example.com").await;

    let auth = format!("Bearer {}", token);
    let (status, body) = send(&t.app, "GET", "/auth/me", &[("authorization", &auth)], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["email"], "maya@example.com");
}

#[tokio::test]
async fn otp_rejects_bad_input() {
    let (_dir, t) = test_app(Vec::new()).await;

    let (status, _) = send(
        &t.app,
        "POST",
        "/auth/otp/request",
        &[],
        Some(serde_json::json!({ "email": "not-an-email" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &t.app,
        "POST",
        "/auth/otp/verify",
        &[],
        Some(serde_json::json!({ "email": "maya@example.com", "code": "000000" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn sign_in_code_is_single_use() {
    let (_dir, t) = test_app(Vec::new()).await;
    sign_in(&t, "maya@example.com").await;

    let sent = t.mailer.sent().await;
    let code_regex = regex::Regex::new(r"\d{6}").unwrap();
    let code = code_regex.find(&sent[0].html).unwrap().as_str();

    let (status, _) = send(
        &t.app,
        "POST",
        "/auth/otp/verify",
        &[],
        Some(serde_json::json!({ "email": "maya@example.com", "code": code })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn request_lifecycle_with_drafts() {
    let (_dir, t) = test_app(Vec::new()).await;
    let anon = anonymous_session(&t).await;
    let headers: &[(&str, &str)] = &[("x-anonymous-id", &anon)];

    let request_id = create_request(&t, headers).await;

    // LLM draft, then a user edit on top of it.
    let (status, draft) = send(
        &t.app,
        "POST",
        &format!("/requests/{}/lyrics", request_id),
        headers,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(draft["version"], 1);
    assert_eq!(draft["source"], "llm");

    let (status, edited) = send(
        &t.app,
        "PUT",
        &format!("/lyrics/{}", draft["id"].as_str().unwrap()),
        headers,
        Some(serde_json::json!({ "content": "[Verse]\nMy own words now" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(edited["version"], 2);
    assert_eq!(edited["source"], "user");

    let (status, request) = send(
        &t.app,
        "POST",
        &format!("/requests/{}/approve", request_id),
        headers,
        Some(serde_json::json!({ "draft_id": edited["id"] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(request["status"], "lyrics_ready");
    assert_eq!(request["approved_draft_id"], edited["id"]);

    let (status, drafts) = send(
        &t.app,
        "GET",
        &format!("/requests/{}/lyrics", request_id),
        headers,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(drafts.as_array().unwrap().len(), 2);

    // Substring search over the request fields.
    let (status, found) = send(&t.app, "GET", "/requests?q=marathon", headers, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(found.as_array().unwrap().len(), 1);

    let (status, found) = send(&t.app, "GET", "/requests?q=wedding", headers, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(found.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn ownership_is_enforced() {
    let (_dir, t) = test_app(Vec::new()).await;
    let owner = anonymous_session(&t).await;
    let stranger = anonymous_session(&t).await;

    let request_id = create_request(&t, &[("x-anonymous-id", &owner)]).await;

    let (status, _) = send(
        &t.app,
        "GET",
        &format!("/requests/{}", request_id),
        &[("x-anonymous-id", &stranger)],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(
        &t.app,
        "GET",
        &format!("/requests/{}", request_id),
        &[],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &t.app,
        "GET",
        "/requests/no-such-request",
        &[("x-anonymous-id", &owner)],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn generation_requires_approved_lyrics_and_payment() {
    let (_dir, t) = test_app(Vec::new()).await;
    let anon = anonymous_session(&t).await;
    let headers: &[(&str, &str)] = &[("x-anonymous-id", &anon)];

    let request_id = create_request(&t, headers).await;
    let generate_uri = format!("/requests/{}/generate", request_id);

    // No approved lyrics yet.
    let (status, _) = send(&t.app, "POST", &generate_uri, headers, None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, draft) = send(
        &t.app,
        "POST",
        &format!("/requests/{}/lyrics", request_id),
        headers,
        None,
    )
    .await;
    send(
        &t.app,
        "POST",
        &format!("/requests/{}/approve", request_id),
        headers,
        Some(serde_json::json!({ "draft_id": draft["id"] })),
    )
    .await;

    // Approved but unpaid.
    let (status, _) = send(&t.app, "POST", &generate_uri, headers, None).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);

    t.state.requests.mark_paid(&request_id).await.unwrap();

    let (status, song) = send(&t.app, "POST", &generate_uri, headers, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(song["status"], "PENDING");
    assert_eq!(song["task_id"], "mock-task-1");

    let (status, request) = send(
        &t.app,
        "GET",
        &format!("/requests/{}", request_id),
        headers,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(request["status"], "generating");
}

#[tokio::test]
async fn webhook_reconciles_first_then_complete() {
    let (_dir, t) = test_app(Vec::new()).await;
    let anon = anonymous_session(&t).await;
    let headers: &[(&str, &str)] = &[("x-anonymous-id", &anon)];
    let (request_id, song_id) = generate_song(&t, headers).await;

    let first = serde_json::json!({
        "code": 200,
        "msg": "ok",
        "data": {
            "task_id": "mock-task-1",
            "callbackType": "first",
            "data": [
                { "id": "v1", "stream_audio_url": "https://cdn.example.com/a.m3u8" },
                { "id": "v2" }
            ]
        }
    });
    let (status, body) = send(&t.app, "POST", "/webhooks/generation", &[], Some(first)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (_, song) = send(&t.app, "GET", &format!("/songs/{}", song_id), headers, None).await;
    assert_eq!(song["status"], "STREAM_AVAILABLE");
    assert_eq!(song["stream_url"], "https://cdn.example.com/a.m3u8");

    let complete = serde_json::json!({
        "code": 200,
        "msg": "ok",
        "data": {
            "task_id": "mock-task-1",
            "callbackType": "complete",
            "data": [
                {
                    "id": "v1",
                    "stream_audio_url": "https://cdn.example.com/a.m3u8",
                    "audio_url": "https://cdn.example.com/a.mp3",
                    "duration": 181.6
                },
                {
                    "id": "v2",
                    "audio_url": "https://cdn.example.com/b.mp3",
                    "duration": 180.2
                }
            ]
        }
    });
    let (status, _) = send(
        &t.app,
        "POST",
        "/webhooks/generation",
        &[],
        Some(complete.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, song) = send(&t.app, "GET", &format!("/songs/{}", song_id), headers, None).await;
    assert_eq!(song["status"], "COMPLETE");
    assert_eq!(song["audio_url"], "https://cdn.example.com/a.mp3");
    assert_eq!(song["duration_secs"], 182);
    assert_eq!(song["variants"].as_array().unwrap().len(), 2);

    let (_, request) = send(
        &t.app,
        "GET",
        &format!("/requests/{}", request_id),
        headers,
        None,
    )
    .await;
    assert_eq!(request["status"], "delivered");

    // A replayed delivery converges on the same state.
    let (status, body) = send(&t.app, "POST", "/webhooks/generation", &[], Some(complete)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (_, song) = send(&t.app, "GET", &format!("/songs/{}", song_id), headers, None).await;
    assert_eq!(song["status"], "COMPLETE");
    assert_eq!(song["variants"].as_array().unwrap().len(), 2);

    // A late error callback cannot demote a delivered song.
    let error = serde_json::json!({
        "code": 200,
        "data": { "task_id": "mock-task-1", "callbackType": "error", "data": [] }
    });
    let (status, _) = send(&t.app, "POST", "/webhooks/generation", &[], Some(error)).await;
    assert_eq!(status, StatusCode::OK);

    let (_, song) = send(&t.app, "GET", &format!("/songs/{}", song_id), headers, None).await;
    assert_eq!(song["status"], "COMPLETE");
}

#[tokio::test]
async fn webhook_soft_acks_unrecognized_deliveries() {
    let (_dir, t) = test_app(Vec::new()).await;

    // Unknown task id.
    let (status, body) = send(
        &t.app,
        "POST",
        "/webhooks/generation",
        &[],
        Some(serde_json::json!({
            "code": 200,
            "data": { "task_id": "never-heard-of-it", "callbackType": "first", "data": [] }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    // Missing data payload.
    let (status, body) = send(
        &t.app,
        "POST",
        "/webhooks/generation",
        &[],
        Some(serde_json::json!({ "code": 200, "msg": "ok" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    // Malformed requestId is the one hard failure.
    let (status, _) = send(
        &t.app,
        "POST",
        "/webhooks/generation?requestId=not-a-uuid",
        &[],
        Some(serde_json::json!({ "code": 200 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn error_webhook_fails_the_song() {
    let (_dir, t) = test_app(Vec::new()).await;
    let anon = anonymous_session(&t).await;
    let headers: &[(&str, &str)] = &[("x-anonymous-id", &anon)];
    let (_request_id, song_id) = generate_song(&t, headers).await;

    let (status, _) = send(
        &t.app,
        "POST",
        "/webhooks/generation",
        &[],
        Some(serde_json::json!({
            "code": 200,
            "msg": "content rejected",
            "data": { "task_id": "mock-task-1", "callbackType": "error", "data": [] }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, song) = send(&t.app, "GET", &format!("/songs/{}", song_id), headers, None).await;
    assert_eq!(song["status"], "FAILED");
    assert_eq!(song["error"], "content rejected");
}

#[tokio::test]
async fn poll_path_reconciles_like_the_webhook() {
    let scripted = vec![
        ProviderTaskStatus {
            state: "processing".to_string(),
            variants: vec![VariantUpdate {
                id: Some("v1".to_string()),
                stream_url: Some("https://cdn.example.com/a.m3u8".to_string()),
                ..Default::default()
            }],
            error: None,
        },
        ProviderTaskStatus {
            state: "completed".to_string(),
            variants: vec![VariantUpdate {
                id: Some("v1".to_string()),
                stream_url: Some("https://cdn.example.com/a.m3u8".to_string()),
                download_url: Some("https://cdn.example.com/a.mp3".to_string()),
                duration: Some(179.4),
                ..Default::default()
            }],
            error: None,
        },
    ];

    let (_dir, t) = test_app(scripted).await;
    let anon = anonymous_session(&t).await;
    let headers: &[(&str, &str)] = &[("x-anonymous-id", &anon)];
    let (_request_id, song_id) = generate_song(&t, headers).await;

    let poll_uri = format!("/api/song/status/{}", song_id);

    let (status, body) = send(&t.app, "POST", &poll_uri, headers, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["status"]["status"], "STREAM_AVAILABLE");
    assert_eq!(body["status"]["isReady"], true);
    assert_eq!(body["status"]["songUrl"], "https://cdn.example.com/a.m3u8");

    let (status, body) = send(&t.app, "POST", &poll_uri, headers, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"]["status"], "COMPLETE");
    assert_eq!(body["status"]["songUrl"], "https://cdn.example.com/a.mp3");
    assert_eq!(body["status"]["duration"], 179);

    // Already complete: answered from the store, still converged.
    let (status, body) = send(&t.app, "POST", &poll_uri, headers, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"]["status"], "COMPLETE");
}

#[tokio::test]
async fn poll_reports_provider_hiccups_softly() {
    // No scripted statuses: every fetch errors.
    let (_dir, t) = test_app(Vec::new()).await;
    let anon = anonymous_session(&t).await;
    let headers: &[(&str, &str)] = &[("x-anonymous-id", &anon)];
    let (_request_id, song_id) = generate_song(&t, headers).await;

    let (status, body) = send(
        &t.app,
        "POST",
        &format!("/api/song/status/{}", song_id),
        headers,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    assert_eq!(body["status"]["status"], "PENDING");
    assert_eq!(body["status"]["isReady"], false);
    assert!(body["status"]["error"].is_string());
}

#[tokio::test]
async fn payment_webhook_marks_the_request_paid() {
    let (_dir, t) = test_app(Vec::new()).await;
    let anon = anonymous_session(&t).await;
    let headers: &[(&str, &str)] = &[("x-anonymous-id", &anon)];

    let request_id = create_request(&t, headers).await;
    t.state
        .payment_store
        .create(&request_id, "order_test_1", PRICE_PAISE, "INR")
        .await
        .unwrap();

    let body = serde_json::json!({
        "event": "payment.captured",
        "payload": {
            "payment": { "entity": { "id": "pay_test_1", "order_id": "order_test_1" } }
        }
    })
    .to_string();
    let signature = sign_body(WEBHOOK_SECRET, body.as_bytes()).unwrap();

    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/payment")
        .header("content-type", "application/json")
        .header("x-razorpay-signature", &signature)
        .body(Body::from(body.clone()))
        .unwrap();
    let response = t.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let (_, request_body) = send(
        &t.app,
        "GET",
        &format!("/requests/{}", request_id),
        headers,
        None,
    )
    .await;
    assert_eq!(request_body["paid"], true);

    // An identical retry is absorbed by the idempotency key.
    let replay = Request::builder()
        .method("POST")
        .uri("/webhooks/payment")
        .header("content-type", "application/json")
        .header("x-razorpay-signature", &signature)
        .body(Body::from(body.clone()))
        .unwrap();
    let response = t.app.clone().oneshot(replay).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // A bad signature is rejected outright.
    let forged = Request::builder()
        .method("POST")
        .uri("/webhooks/payment")
        .header("content-type", "application/json")
        .header("x-razorpay-signature", "0000")
        .body(Body::from(body))
        .unwrap();
    let response = t.app.clone().oneshot(forged).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn playback_returns_timed_lyric_lines() {
    let (_dir, t) = test_app(Vec::new()).await;
    let anon = anonymous_session(&t).await;
    let headers: &[(&str, &str)] = &[("x-anonymous-id", &anon)];
    let (_request_id, song_id) = generate_song(&t, headers).await;

    // Not playable until a URL exists.
    let (status, _) = send(
        &t.app,
        "GET",
        &format!("/songs/{}/play", song_id),
        headers,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let complete = serde_json::json!({
        "code": 200,
        "data": {
            "task_id": "mock-task-1",
            "callbackType": "complete",
            "data": [{
                "id": "v1",
                "stream_audio_url": "https://cdn.example.com/a.m3u8",
                "audio_url": "https://cdn.example.com/a.mp3",
                "duration": 120.0
            }]
        }
    });
    send(&t.app, "POST", "/webhooks/generation", &[], Some(complete)).await;

    let (status, body) = send(
        &t.app,
        "GET",
        &format!("/songs/{}/play", song_id),
        headers,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["song_url"], "https://cdn.example.com/a.mp3");
    assert_eq!(body["duration_secs"], 120);

    let lines = body["lines"].as_array().unwrap();
    assert!(!lines.is_empty());
    assert_eq!(lines[0]["start_ms"], 0);
    assert_eq!(
        lines.last().unwrap()["end_ms"].as_u64().unwrap(),
        120_000
    );
}
