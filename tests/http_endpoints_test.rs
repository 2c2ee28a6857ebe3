//! HTTP surface tests driving the router with `tower::ServiceExt::oneshot`.

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode},
    response::Response,
};
use secrecy::SecretString;
use serde_json::{Value, json};
use tollgate::billing::{
    BillingConfig, CheckoutProvider, CheckoutSession, Coupon, CreateCheckoutSessionRequest,
    InMemoryStore, PortalProvider, PortalSession, PriceIds, SIGNATURE_HEADER, sign_payload,
};
use tollgate::{AppContext, EntitlementRoutes, Result, SubjectId};
use tower::ServiceExt;

const SECRET: &str = "whsec_http";

struct StubProvider;

#[async_trait]
impl CheckoutProvider for StubProvider {
    async fn create_checkout_session(
        &self,
        request: CreateCheckoutSessionRequest,
    ) -> Result<CheckoutSession> {
        Ok(CheckoutSession {
            session_id: format!("cs_{}", request.subject_id),
            url: format!("https://pay.example.com/c/{}", request.price_id),
        })
    }
}

#[async_trait]
impl PortalProvider for StubProvider {
    async fn create_portal_session(
        &self,
        customer_id: &str,
        _return_url: &str,
    ) -> Result<PortalSession> {
        Ok(PortalSession {
            url: format!("https://pay.example.com/p/{}", customer_id),
        })
    }
}

fn billing() -> BillingConfig {
    BillingConfig {
        webhook_secret: Some(SecretString::from(SECRET)),
        prices: PriceIds {
            pro_monthly: Some("price_pro_m".to_string()),
            ..PriceIds::default()
        },
        ..BillingConfig::default()
    }
}

fn app(store: &InMemoryStore) -> Router {
    let context = AppContext::builder()
        .with_store(store.clone())
        .with_billing_config(billing())
        .with_payment_provider(StubProvider)
        .build()
        .unwrap();
    EntitlementRoutes::router(context)
}

fn post_json(uri: &str, subject: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(subject) = subject {
        builder = builder.extension(SubjectId::new(subject));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn webhook(body: Vec<u8>) -> Request<Body> {
    let header = sign_payload(SECRET, &body, chrono::Utc::now().timestamp()).unwrap();
    Request::builder()
        .method("POST")
        .uri("/webhooks/payments")
        .header(SIGNATURE_HEADER, header)
        .body(Body::from(body))
        .unwrap()
}

async fn json_body(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn checkout_completed() -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": "evt_http_1",
        "type": "checkout.session.completed",
        "created": chrono::Utc::now().timestamp() - 60,
        "data": { "object": {
            "client_reference_id": "user_1",
            "customer": "cus_1",
            "subscription": "sub_1",
            "metadata": { "tier": "pro", "interval": "month" }
        }}
    }))
    .unwrap()
}

#[tokio::test]
async fn test_usage_check_requires_subject() {
    let store = InMemoryStore::new();
    let response = app(&store)
        .oneshot(post_json(
            "/usage/check",
            None,
            json!({ "feature": "comparisons_daily" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_usage_check_allows_then_denies() {
    let store = InMemoryStore::new();
    let app = app(&store);

    let response = app
        .clone()
        .oneshot(post_json(
            "/usage/check",
            Some("user_1"),
            json!({ "feature": "exports_monthly" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        json_body(response).await,
        json!({ "allowed": true, "remaining": 0 })
    );

    let response = app
        .oneshot(post_json(
            "/usage/check",
            Some("user_1"),
            json!({ "feature": "exports_monthly" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = json_body(response).await;
    assert_eq!(body["remaining"], 0);
    assert!(body["error"].as_str().unwrap().contains("free plan limit of 1 exports"));
}

#[tokio::test]
async fn test_usage_check_rejects_unknown_feature() {
    let store = InMemoryStore::new();
    let response = app(&store)
        .oneshot(post_json(
            "/usage/check",
            Some("user_1"),
            json!({ "feature": "warp_drive" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_webhook_then_entitlements_show_paid_tier() {
    let store = InMemoryStore::new();
    let app = app(&store);

    let response = app.clone().oneshot(webhook(checkout_completed())).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        json_body(response).await,
        json!({ "received": true, "outcome": "applied" })
    );

    let request = Request::builder()
        .uri("/billing/entitlements")
        .extension(SubjectId::new("user_1"))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["tier"], "pro");
    assert_eq!(body["status"], "active");
    assert_eq!(body["features"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_webhook_without_signature_is_rejected() {
    let store = InMemoryStore::new();
    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/payments")
        .body(Body::from(checkout_completed()))
        .unwrap();

    let response = app(&store).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(store.subscription_count(), 0);
}

#[tokio::test]
async fn test_checkout_returns_session_url() {
    let store = InMemoryStore::new();
    let response = app(&store)
        .oneshot(post_json(
            "/billing/checkout",
            None,
            json!({
                "subjectId": "user_1",
                "email": "user@example.com",
                "tier": "pro",
                "interval": "month"
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        json_body(response).await,
        json!({ "sessionId": "cs_user_1", "url": "https://pay.example.com/c/price_pro_m" })
    );
}

#[tokio::test]
async fn test_checkout_rejects_free_tier_and_bad_email() {
    let store = InMemoryStore::new();
    let app = app(&store);

    let response = app
        .clone()
        .oneshot(post_json(
            "/billing/checkout",
            None,
            json!({ "subjectId": "u", "email": "u@example.com", "tier": "free", "interval": "month" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(post_json(
            "/billing/checkout",
            None,
            json!({ "subjectId": "u", "email": "nope", "tier": "pro", "interval": "month" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_checkout_without_price_is_unavailable() {
    let store = InMemoryStore::new();
    let response = app(&store)
        .oneshot(post_json(
            "/billing/checkout",
            None,
            json!({ "subjectId": "u", "email": "u@example.com", "tier": "business", "interval": "year" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_checkout_coupon_validation() {
    let store = InMemoryStore::new();
    store.insert_coupon(Coupon {
        code: "OLD".to_string(),
        provider_coupon_id: "co_old".to_string(),
        active: true,
        valid_until: Some(chrono::Utc::now().timestamp() - 10),
    });
    let app = app(&store);

    let request = |code: &str| {
        post_json(
            "/billing/checkout",
            None,
            json!({
                "subjectId": "u",
                "email": "u@example.com",
                "tier": "pro",
                "interval": "month",
                "couponCode": code
            }),
        )
    };

    let response = app.clone().oneshot(request("MISSING")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app.oneshot(request("OLD")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_portal_requires_subscription() {
    let store = InMemoryStore::new();
    let app = app(&store);

    let response = app
        .clone()
        .oneshot(post_json("/billing/portal", None, json!({ "subjectId": "user_1" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    app.clone().oneshot(webhook(checkout_completed())).await.unwrap();

    let response = app
        .oneshot(post_json("/billing/portal", None, json!({ "subjectId": "user_1" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        json_body(response).await,
        json!({ "url": "https://pay.example.com/p/cus_1" })
    );
}

#[tokio::test]
async fn test_portal_rejects_foreign_return_url() {
    let store = InMemoryStore::new();
    let response = app(&store)
        .oneshot(post_json(
            "/billing/portal",
            None,
            json!({ "subjectId": "user_1", "returnUrl": "ftp://evil.example.com" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
