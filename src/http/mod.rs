//! HTTP surface: route modules, handlers and the authenticated-subject extractor.

pub mod handlers;
pub mod routes;
pub mod subject;

pub use routes::{EntitlementRoutes, RouteModule};
pub use subject::{AuthenticatedSubject, SubjectId};
