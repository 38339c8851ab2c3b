//! Clients for the collaborators the realtime gateway consumes.
//!
//! - `rest`: shared reqwest wrapper with bearer auth and status mapping
//! - `section_snapshot`: entity list/detail fetcher backed by the REST API
//! - `analytics`: analytics endpoint fetcher
//! - `auth`: local JWT validation

pub mod analytics;
pub mod auth;
pub mod error;
pub mod rest;
pub mod section_snapshot;

pub use analytics::AnalyticsHttpClient;
pub use auth::{bearer_token, JwtValidator};
pub use error::{Error, Result};
pub use rest::RestClient;
pub use section_snapshot::SectionSnapshotHttpClient;
