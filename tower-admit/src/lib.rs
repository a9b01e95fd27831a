//! # Tower Admit
//!
//! `tower-admit` connects the [`admit_limit`] admission-control library to
//! the [Tower](https://github.com/tower-rs/tower) ecosystem.
//!
//! The middleware is a thin caller: it extracts a [`admit_limit::CallerContext`]
//! and endpoint name from each request, asks the shared
//! [`admit_limit::RateLimiter`] for a decision, and either forwards the
//! request or fails with [`AdmitError::RateLimited`] carrying the retry
//! timing. Quota math, storage, and failure policy all live in the library;
//! nothing here inspects HTTP beyond what the extractor closure chooses to.
//!
//! ## Feature Flags
//!
//! - `axum`: Enables `IntoResponse` for [`AdmitError`], allowing automatic
//!   conversion to HTTP status codes (429, 500) with a `Retry-After` header.

mod error;
mod layer;
mod service;

#[cfg(test)]
mod tests;

pub use error::AdmitError;
pub use layer::AdmitLayer;
pub use service::AdmitService;
