use crate::error::{Result, TollgateError};
use axum::{Json, extract::Request};
use serde::Deserialize;
use validator::Validate;

/// JSON body extractor that runs `validator` rules before the handler sees it.
///
/// Malformed JSON and rule violations are both rejected with 400.
pub struct ValidatedJson<T>(pub T);

impl<T, S> axum::extract::FromRequest<S> for ValidatedJson<T>
where
    T: for<'de> Deserialize<'de> + Validate + Send,
    S: Send + Sync,
{
    type Rejection = TollgateError;

    async fn from_request(req: Request, state: &S) -> std::result::Result<Self, Self::Rejection> {
        let json: Json<T> = Json::from_request(req, state)
            .await
            .map_err(|e| TollgateError::bad_request(format!("Invalid JSON: {}", e.body_text())))?;

        validate_json(json)
    }
}

/// Validate an already-extracted `Json<T>`.
pub fn validate_json<T: Validate>(json: Json<T>) -> Result<ValidatedJson<T>> {
    json.0.validate()?;
    Ok(ValidatedJson(json.0))
}
