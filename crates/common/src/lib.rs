//! Shared types and ports for the realtime gateway.

pub mod error;
pub mod messages;
pub mod ports;
pub mod query;
pub mod snapshot;

pub use error::{AuthError, FetchError, FetchResult};
pub use messages::{CanonicalMessage, Metadata};
pub use ports::{
    AnalyticsFetcher, Claims, SectionSnapshotFetcher, SnapshotAudience, TokenValidator,
};
pub use query::PagedQuery;
pub use snapshot::{AnalyticsRequest, AnalyticsSnapshot, SectionSnapshot};
