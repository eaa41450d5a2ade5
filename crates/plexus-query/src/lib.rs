//! Composable, replayable queries over bus records.
//!
//! A [`BusList`] is an immutable record sequence that remembers how it was
//! derived as a [`Plan`]. Given only the plan and a [`ReplaySource`], the
//! same result can be recomputed later, which is what [`Watcher`] relies on
//! to keep live views current as deltas arrive.

mod list;
mod plan;
mod sort;
mod watch;

pub use list::{BusList, TraceEntry};
pub use plan::{BinaryOp, Plan, Predicate, UnaryOp, WhereClause};
pub use sort::compare_fields;
pub use watch::{Notification, WatchError, Watcher};

use async_trait::async_trait;
use plexus_protocol::{ErrorCode, ErrorInfo};
use plexus_records::{FilterError, QueryParams, Record};

#[derive(thiserror::Error, Debug, Clone)]
pub enum QueryError {
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error("plan is not replayable: {0}")]
    Unreplayable(String),
    #[error("plan mixes buses: {}", .0.join(", "))]
    MixedBuses(Vec<String>),
    #[error("invalid plan: {0}")]
    InvalidPlan(String),
    #[error("source failed: {0}")]
    Source(#[from] ErrorInfo),
}

impl From<QueryError> for ErrorInfo {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::Filter(inner) => inner.into(),
            QueryError::Source(info) => info,
            QueryError::Unreplayable(_) => ErrorInfo::new(ErrorCode::Unreplayable, err.to_string()),
            QueryError::MixedBuses(_) | QueryError::InvalidPlan(_) => {
                ErrorInfo::new(ErrorCode::InvalidRequest, err.to_string())
            }
        }
    }
}

/// Where plan leaves are fetched from: the broker store, a broker client,
/// or a plugin's host relay.
#[async_trait]
pub trait ReplaySource: Send + Sync {
    async fn fetch(&self, bus: &str, params: &QueryParams) -> Result<Vec<Record>, QueryError>;

    /// Recomputes a whole plan. Sources that can evaluate server-side override this.
    async fn replay(&self, plan: &Plan) -> Result<BusList, QueryError> {
        BusList::evaluate(plan, self).await
    }
}
