use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use flate2::{write::GzEncoder, Compression};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use activity_stream_service::api::{create_router, AppState};
use activity_stream_service::broadcaster::ActivityHub;
use activity_stream_service::membership::MembershipStore;
use activity_stream_service::memory::{InMemoryDatabase, InMemoryMembershipStore};
use activity_stream_service::signature::{
    sign, SignatureVerifier, NONCE_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER,
};

const SECRET: &str = "qn-secret";
const WATCHED: &str = "0x1111111111111111111111111111111111111111";
const OTHER: &str = "0x2222222222222222222222222222222222222222";

struct Harness {
    app: Router,
    db: Arc<InMemoryDatabase>,
    list: Arc<InMemoryMembershipStore>,
    hub: Arc<ActivityHub>,
    shutdown: CancellationToken,
}

async fn harness() -> Harness {
    let db = Arc::new(InMemoryDatabase::new());
    let list = Arc::new(InMemoryMembershipStore::new());
    list.add("monitored:evm", WATCHED).await.unwrap();

    let shutdown = CancellationToken::new();
    let state = AppState::new(
        SignatureVerifier::new(vec!["old-secret".to_string(), SECRET.to_string()], 300),
        list.clone(),
        db.clone(),
        db.clone(),
        "ethereum-mainnet",
        Duration::from_secs(30),
        shutdown.clone(),
    );
    let hub = state.hub.clone();

    Harness {
        app: create_router(state),
        db,
        list,
        hub,
        shutdown,
    }
}

fn block_payload(tx_hash: &str) -> String {
    json!({
        "data": [{
            "block": {
                "number": "0x1312d00",
                "timestamp": "0x6553f100",
                "transactions": [{
                    "hash": tx_hash,
                    "from": WATCHED.to_uppercase().replace("0X", "0x"),
                    "to": OTHER,
                    "value": "0xde0b6b3a7640000"
                }]
            },
            "receipts": [{
                "transactionHash": tx_hash,
                "status": "0x1",
                "logs": []
            }]
        }]
    })
    .to_string()
}

fn now() -> String {
    chrono::Utc::now().timestamp().to_string()
}

fn signed_request(body: Vec<u8>, text: &str, timestamp: &str, gzip: bool) -> Request<Body> {
    let mut builder = Request::post("/api/webhooks/stream")
        .header(header::CONTENT_TYPE, "application/json")
        .header(NONCE_HEADER, "nonce-1")
        .header(TIMESTAMP_HEADER, timestamp)
        .header(SIGNATURE_HEADER, sign(SECRET, "nonce-1", timestamp, text));
    if gzip {
        builder = builder.header(header::CONTENT_ENCODING, "gzip");
    }
    builder.body(Body::from(body)).unwrap()
}

fn webhook(text: &str) -> Request<Body> {
    signed_request(text.as_bytes().to_vec(), text, &now(), false)
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> Result<(StatusCode, Value)> {
    let response = app.clone().oneshot(request).await?;
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)?
    };
    Ok((status, body))
}

#[tokio::test]
async fn test_ping_without_headers() -> Result<()> {
    let h = harness().await;
    let request = Request::post("/api/webhooks/stream").body(Body::from("{}"))?;

    let (status, body) = send(&h.app, request).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "success": true, "ping": true }));
    assert_eq!(h.db.event_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_signed_delivery_end_to_end() -> Result<()> {
    let h = harness().await;
    let text = block_payload("0xabc1");

    let (status, body) = send(&h.app, webhook(&text)).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "success": true, "processed": 1, "skipped": 0 }));

    // redelivery of the same block is a no-op
    let (_, body) = send(&h.app, webhook(&text)).await?;
    assert_eq!(body, json!({ "success": true, "processed": 0, "skipped": 1 }));
    assert_eq!(h.db.event_count(), 1);

    let (status, body) = send(
        &h.app,
        get(&format!("/api/activity?address={}", WATCHED.to_uppercase().replace("0X", "0x"))),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    let event = &body["events"][0];
    assert_eq!(event["eventId"], "0xabc1:native");
    assert_eq!(event["eventType"], "nativeTransfer");
    assert_eq!(event["amount"], "1000000000000000000");
    assert_eq!(event["direction"], "out");
    assert_eq!(event["counterparty"], OTHER);
    assert_eq!(event["status"], "success");
    assert_eq!(event["blockNumber"], 20_000_000);

    let (_, health) = send(&h.app, get("/api/health")).await?;
    assert!(health["lastWebhook"].is_string());
    Ok(())
}

#[tokio::test]
async fn test_gzip_delivery_signed_over_decompressed_text() -> Result<()> {
    let h = harness().await;
    let text = block_payload("0xabc2");
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes())?;
    let compressed = encoder.finish()?;

    let (status, body) = send(&h.app, signed_request(compressed, &text, &now(), true)).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["processed"], 1);
    Ok(())
}

#[tokio::test]
async fn test_bad_signature_rejected() -> Result<()> {
    let h = harness().await;
    let text = block_payload("0xabc3");
    let ts = now();
    let request = Request::post("/api/webhooks/stream")
        .header(NONCE_HEADER, "nonce-1")
        .header(TIMESTAMP_HEADER, ts.as_str())
        .header(SIGNATURE_HEADER, sign("wrong-secret", "nonce-1", &ts, &text))
        .body(Body::from(text))?;

    let (status, body) = send(&h.app, request).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);
    assert_eq!(h.db.event_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_stale_timestamp_rejected() -> Result<()> {
    let h = harness().await;
    let text = block_payload("0xabc4");
    let stale = (chrono::Utc::now().timestamp() - 301).to_string();

    let (status, body) = send(&h.app, signed_request(text.clone().into_bytes(), &text, &stale, false)).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);
    Ok(())
}

#[tokio::test]
async fn test_partial_headers_rejected() -> Result<()> {
    let h = harness().await;
    let request = Request::post("/api/webhooks/stream")
        .header(NONCE_HEADER, "nonce-1")
        .body(Body::from("{}"))?;

    let (status, _) = send(&h.app, request).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    Ok(())
}

fn gzip_garbage(timestamp: &str, signature: Option<&str>) -> Request<Body> {
    let mut builder = Request::post("/api/webhooks/stream")
        .header(header::CONTENT_ENCODING, "gzip")
        .header(NONCE_HEADER, "nonce-1")
        .header(TIMESTAMP_HEADER, timestamp);
    if let Some(signature) = signature {
        builder = builder.header(SIGNATURE_HEADER, signature);
    }
    builder.body(Body::from("not gzip at all")).unwrap()
}

#[tokio::test]
async fn test_stale_gzip_delivery_rejected_before_decoding() -> Result<()> {
    let h = harness().await;

    let (status, body) = send(&h.app, gzip_garbage("1", Some("00"))).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);
    Ok(())
}

#[tokio::test]
async fn test_unsigned_gzip_delivery_rejected_before_decoding() -> Result<()> {
    let h = harness().await;

    let (status, body) = send(&h.app, gzip_garbage(&now(), None)).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);
    Ok(())
}

#[tokio::test]
async fn test_malformed_payload_is_server_error() -> Result<()> {
    let h = harness().await;
    let (status, body) = send(&h.app, webhook("{not json")).await?;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["success"], false);
    Ok(())
}

#[tokio::test]
async fn test_membership_outage_is_bad_gateway() -> Result<()> {
    let h = harness().await;
    h.list.set_unavailable(true);

    let (status, _) = send(&h.app, webhook(&block_payload("0xabc5"))).await?;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(h.db.event_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_health_degraded_still_ok_status() -> Result<()> {
    let h = harness().await;

    let (status, body) = send(&h.app, get("/api/health")).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["db"], true);
    assert!(body["lastWebhook"].is_null());

    h.db.set_unavailable(true);
    let (status, body) = send(&h.app, get("/api/health")).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["db"], false);
    Ok(())
}

#[tokio::test]
async fn test_user_lifecycle() -> Result<()> {
    let h = harness().await;
    let address = "0x3333333333333333333333333333333333333333";

    let (status, body) = send(
        &h.app,
        json_request("POST", "/api/users", json!({ "walletAddress": address, "name": "ops" })),
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["user"]["walletAddress"], address);
    assert_eq!(body["user"]["chainType"], "EVM");
    assert!(h.list.is_member("monitored:evm", address));

    let (status, body) = send(
        &h.app,
        json_request("POST", "/api/users", json!({ "walletAddress": address })),
    )
    .await?;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);

    let (_, body) = send(&h.app, get("/api/users?chainType=evm")).await?;
    assert_eq!(body["count"], 1);

    let delete = Request::delete(format!("/api/users/{}?chainType=EVM", address)).body(Body::empty())?;
    let (status, body) = send(&h.app, delete).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["removed"], address);

    let again = Request::delete(format!("/api/users/{}", address)).body(Body::empty())?;
    let (status, _) = send(&h.app, again).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn test_invalid_address_and_chain_are_bad_requests() -> Result<()> {
    let h = harness().await;

    let (status, _) = send(
        &h.app,
        json_request("POST", "/api/users", json!({ "walletAddress": "0xAAA1" })),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &h.app,
        json_request(
            "POST",
            "/api/users",
            json!({ "walletAddress": OTHER, "chainType": "BTC" }),
        ),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn test_bulk_add_reports_skipped_and_failed() -> Result<()> {
    let h = harness().await;
    let address = "0x4444444444444444444444444444444444444444";

    let (status, body) = send(
        &h.app,
        json_request(
            "POST",
            "/api/users/bulk",
            json!({ "addresses": [address, address, "bad"] }),
        ),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["added"], 1);
    assert_eq!(body["skipped"], json!([address]));
    assert_eq!(body["failed"], json!(["bad"]));
    Ok(())
}

#[tokio::test]
async fn test_bulk_add_rolls_back_on_relational_failure() -> Result<()> {
    let h = harness().await;
    h.db.set_fail_user_writes(true);
    let addresses = [
        "0x5555555555555555555555555555555555555551",
        "0x5555555555555555555555555555555555555552",
        "0x5555555555555555555555555555555555555553",
    ];

    let (status, body) = send(
        &h.app,
        json_request("POST", "/api/users/bulk", json!({ "addresses": addresses })),
    )
    .await?;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);
    assert_eq!(body["failed"], json!(addresses));
    assert_eq!(body["skipped"], json!([]));
    assert_eq!(body["rolledBack"], json!(addresses));
    for address in addresses {
        assert!(!h.list.is_member("monitored:evm", address));
    }
    // only the pre-seeded watched address remains
    assert_eq!(h.list.len("monitored:evm"), 1);
    Ok(())
}

#[tokio::test]
async fn test_sse_stream_delivers_connected_then_activity() -> Result<()> {
    let h = harness().await;
    let response = h.app.clone().oneshot(get("/api/activity/stream")).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );

    let mut frames = response.into_body().into_data_stream();
    let first = frames.next().await.expect("connected frame")?;
    assert!(String::from_utf8_lossy(&first).contains(r#"data: {"type":"connected"}"#));

    for _ in 0..100 {
        if h.hub.subscriber_count() == 1 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(h.hub.subscriber_count(), 1);

    let (status, _) = send(&h.app, webhook(&block_payload("0xabc6"))).await?;
    assert_eq!(status, StatusCode::OK);

    let frame = frames.next().await.expect("activity frame")?;
    let frame = String::from_utf8_lossy(&frame).to_string();
    assert!(frame.contains(r#""type":"activity""#));
    assert!(frame.contains(r#""eventId":"0xabc6:native""#));

    h.shutdown.cancel();
    assert!(frames.next().await.is_none());
    Ok(())
}
