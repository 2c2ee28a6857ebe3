//! Trait seams for pluggable backends.

pub mod cache;

pub use cache::{Cache, CacheExt};
