//! Request handlers for the entitlement endpoints.

use crate::app::AppContext;
use crate::billing::{
    CheckoutRequest, CheckoutSession, EntitlementSummary, PortalRequest, PortalSession,
    SIGNATURE_HEADER, WebhookAck,
};
use crate::error::{Result, TollgateError};
use crate::http::subject::AuthenticatedSubject;
use crate::validation::ValidatedJson;
use axum::{Json, body::Bytes, extract::State, http::HeaderMap};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// `POST /webhooks/payments`
///
/// Takes the raw body so the signature is checked over the exact bytes sent.
pub async fn payment_webhook(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    let ack = ctx.reconciler.ingest(&body, signature).await?;
    Ok(Json(ack))
}

/// `POST /billing/checkout`
pub async fn create_checkout(
    State(ctx): State<AppContext>,
    ValidatedJson(request): ValidatedJson<CheckoutRequest>,
) -> Result<Json<CheckoutSession>> {
    let session = ctx.checkout.create_checkout_session(request).await?;
    Ok(Json(session))
}

/// `POST /billing/portal`
pub async fn create_portal(
    State(ctx): State<AppContext>,
    ValidatedJson(request): ValidatedJson<PortalRequest>,
) -> Result<Json<PortalSession>> {
    let session = ctx.portal.create_portal_session(request).await?;
    Ok(Json(session))
}

#[derive(Debug, Deserialize, Validate)]
pub struct UsageCheckRequest {
    #[validate(length(min = 1, max = 64, message = "feature is required"))]
    pub feature: String,
}

#[derive(Debug, Serialize)]
pub struct UsageCheckResponse {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u64>,
}

/// `POST /usage/check`
///
/// Records one use when allowed. A denial is a 403 carrying `remaining`.
pub async fn check_usage(
    State(ctx): State<AppContext>,
    AuthenticatedSubject(subject): AuthenticatedSubject,
    ValidatedJson(request): ValidatedJson<UsageCheckRequest>,
) -> Result<Json<UsageCheckResponse>> {
    let decision = ctx
        .gate
        .check_and_record_usage(&subject, &request.feature)
        .await?;

    if !decision.allowed {
        return Err(TollgateError::entitlement_denied(
            decision
                .message
                .unwrap_or_else(|| "Usage limit reached".to_string()),
            decision.remaining,
        ));
    }

    Ok(Json(UsageCheckResponse {
        allowed: true,
        remaining: decision.remaining,
    }))
}

/// `GET /billing/entitlements`
pub async fn entitlements(
    State(ctx): State<AppContext>,
    AuthenticatedSubject(subject): AuthenticatedSubject,
) -> Result<Json<EntitlementSummary>> {
    let summary = ctx.gate.usage_summary(&subject).await?;
    Ok(Json(summary))
}
