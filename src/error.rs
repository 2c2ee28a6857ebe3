use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// The main error type for Tollgate services
#[derive(Debug, thiserror::Error)]
pub enum TollgateError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Quota or tier check refused the action.
    #[error("Entitlement denied: {message}")]
    EntitlementDenied {
        message: String,
        remaining: Option<u64>,
    },

    /// Webhook payload failed signature verification, or no secret is configured.
    #[error("Invalid signature: {0}")]
    SignatureInvalid(String),

    #[error("Too many requests: {message}")]
    TooManyRequests { message: String, retry_after: u64 },

    /// A required integration (payment provider, webhook secret) is not configured.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The backing store could not be reached. Entitlement checks treat this as a denial.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Payment provider error: {0}")]
    ProviderFailure(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// JSON body returned for every failed request.
#[derive(Serialize)]
pub struct ErrorResponse {
    error: String,
    error_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    remaining: Option<u64>,
}

impl TollgateError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn entitlement_denied(msg: impl Into<String>, remaining: Option<u64>) -> Self {
        Self::EntitlementDenied {
            message: msg.into(),
            remaining,
        }
    }

    pub fn signature_invalid(msg: impl Into<String>) -> Self {
        Self::SignatureInvalid(msg.into())
    }

    pub fn too_many_requests(msg: impl Into<String>, retry_after: u64) -> Self {
        Self::TooManyRequests {
            message: msg.into(),
            retry_after,
        }
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Self::ServiceUnavailable(msg.into())
    }

    pub fn store_unavailable(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    pub fn provider_failure(msg: impl Into<String>) -> Self {
        Self::ProviderFailure(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether a client may reasonably retry the same request later.
    ///
    /// Validation and authentication failures never are.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TooManyRequests { .. } | Self::StoreUnavailable(_) | Self::ProviderFailure(_)
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) | Self::SignatureInvalid(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::EntitlementDenied { .. } => StatusCode::FORBIDDEN,
            Self::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::StoreUnavailable(_)
            | Self::ProviderFailure(_)
            | Self::Internal(_)
            | Self::Anyhow(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a message suitable for client responses.
    ///
    /// Client errors carry their own message. Server errors are reduced to a
    /// generic message, except provider failures, whose message is meant for the caller.
    fn safe_message(&self) -> String {
        match self {
            Self::NotFound(msg) => format!("Not found: {}", msg),
            Self::BadRequest(msg) => format!("Bad request: {}", msg),
            Self::Unauthorized(msg) => format!("Unauthorized: {}", msg),
            Self::EntitlementDenied { message, .. } => message.clone(),
            Self::SignatureInvalid(msg) => format!("Invalid signature: {}", msg),
            Self::TooManyRequests { message, .. } => message.clone(),
            Self::ProviderFailure(msg) => format!("Payment provider error: {}", msg),

            Self::ServiceUnavailable(_) => "Service unavailable".to_string(),
            Self::StoreUnavailable(_) | Self::Internal(_) | Self::Anyhow(_) => {
                "Internal server error".to_string()
            }
        }
    }
}

impl IntoResponse for TollgateError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_id = uuid::Uuid::new_v4().to_string();

        if status.is_server_error() {
            tracing::error!(
                status = status.as_u16(),
                error_id = %error_id,
                error = %self,
                "Request failed"
            );
        } else {
            tracing::debug!(
                status = status.as_u16(),
                error_id = %error_id,
                error = %self,
                "Request rejected"
            );
        }

        let (retry_after, remaining) = match &self {
            Self::TooManyRequests { retry_after, .. } => (Some(*retry_after), None),
            Self::EntitlementDenied { remaining, .. } => (None, *remaining),
            _ => (None, None),
        };

        let body = Json(ErrorResponse {
            error: self.safe_message(),
            error_id,
            retry_after,
            remaining,
        });

        let mut response = (status, body).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Result type alias for Tollgate operations and handlers
pub type Result<T> = std::result::Result<T, TollgateError>;

impl From<serde_json::Error> for TollgateError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            TollgateError::BadRequest(format!("JSON error: {}", err))
        } else {
            TollgateError::Internal(format!("JSON serialization error: {}", err))
        }
    }
}

impl From<validator::ValidationErrors> for TollgateError {
    fn from(err: validator::ValidationErrors) -> Self {
        let field_errors: Vec<String> = err
            .field_errors()
            .iter()
            .map(|(field, errors)| {
                let messages: Vec<&str> = errors
                    .iter()
                    .map(|e| {
                        e.message
                            .as_ref()
                            .map(|m| m.as_ref())
                            .unwrap_or_else(|| e.code.as_ref())
                    })
                    .collect();
                format!("{}: {}", field, messages.join(", "))
            })
            .collect();

        TollgateError::BadRequest(format!("Validation failed: {}", field_errors.join("; ")))
    }
}

#[cfg(feature = "database")]
impl From<sea_orm::DbErr> for TollgateError {
    fn from(err: sea_orm::DbErr) -> Self {
        match &err {
            sea_orm::DbErr::RecordNotFound(msg) => TollgateError::NotFound(if msg.is_empty() {
                "Record not found".to_string()
            } else {
                msg.clone()
            }),
            sea_orm::DbErr::Conn(inner) => {
                TollgateError::StoreUnavailable(format!("Connection error: {}", inner))
            }
            sea_orm::DbErr::Query(inner) => {
                TollgateError::StoreUnavailable(format!("Query error: {}", inner))
            }
            sea_orm::DbErr::Exec(inner) => {
                TollgateError::StoreUnavailable(format!("Execution error: {}", inner))
            }
            _ => TollgateError::StoreUnavailable(format!("Database error: {}", err)),
        }
    }
}
