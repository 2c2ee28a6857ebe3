use crate::error::TollgateError;
use axum::{extract::FromRequestParts, http::request::Parts};

/// Identity of the caller, inserted as a request extension by the host
/// application's authentication middleware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectId(pub String);

impl SubjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

/// Extractor for the authenticated subject.
///
/// Rejects with 401 when no [`SubjectId`] extension is present.
///
/// ```rust,ignore
/// async fn handler(AuthenticatedSubject(subject): AuthenticatedSubject) -> String {
///     subject
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedSubject(pub String);

impl<S> FromRequestParts<S> for AuthenticatedSubject
where
    S: Send + Sync,
{
    type Rejection = TollgateError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<SubjectId>()
            .filter(|subject| !subject.0.is_empty())
            .map(|subject| AuthenticatedSubject(subject.0.clone()))
            .ok_or_else(|| TollgateError::unauthorized("Authentication required"))
    }
}
