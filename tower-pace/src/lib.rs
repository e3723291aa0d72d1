//! # Tower Pace
//!
//! `tower-pace` puts a [`pace_limit::PacedLimiter`] in front of any
//! [Tower](https://github.com/tower-rs/tower) service.
//!
//! Each request is held in `poll_ready` until the limiter hands it a permit,
//! so calls go out at the limiter's pace and never exceed its window cap.
//! One limiter can be shared by any number of services and clones.
//!
//! ## The Managed Stack
//! [`ManagedPacedLayer`] composes the pieces most callers want:
//!
//! 1. **Pacing**: Requests queue for permits from the shared limiter.
//! 2. **Timeouts**: The wait for a permit plus the inner call is bounded,
//!    failing with `PaceError::Timeout` when exceeded.
//! 3. **Error Mapping**: Internal Tower errors (like
//!    `tower::timeout::error::Elapsed`) are converted into a unified, cloneable
//!    [`PaceError`] domain.
//!
//! ## Feature Flags
//!
//! - `axum`: Enables `IntoResponse` for [`PaceError`], allowing automatic conversion
//!   to HTTP status codes (408, 503, 500).

mod error;
mod layer;
mod managed_layer;
mod service;
mod utils;

#[cfg(test)]
mod tests;

pub use error::PaceError;
pub use layer::PacedLayer;
pub use managed_layer::ManagedPacedLayer;
pub use service::PacedService;
pub use service::ResponseFuture;
pub use utils::ServiceBuilderExt;
