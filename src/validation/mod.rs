//! Request validation using the `validator` crate.
//!
//! # Example
//!
//! ```rust,no_run
//! use tollgate::validation::ValidatedJson;
//! use validator::Validate;
//! use serde::Deserialize;
//!
//! #[derive(Deserialize, Validate)]
//! struct CouponRequest {
//!     #[validate(length(min = 1, max = 64))]
//!     code: String,
//! }
//!
//! async fn redeem(
//!     ValidatedJson(req): ValidatedJson<CouponRequest>
//! ) -> tollgate::Result<axum::Json<serde_json::Value>> {
//!     Ok(axum::Json(serde_json::json!({"code": req.code})))
//! }
//! ```

mod extractor;

pub use extractor::{ValidatedJson, validate_json};
pub use validator;
