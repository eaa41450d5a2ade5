//! Typed bus records, declarative filters and dedupe keys.

mod filter;
mod params;
mod record;

pub use filter::{Filter, FilterMode, FilterSpec};
pub use params::QueryParams;
pub use record::{values_equal, KindTag, Record, RecordKind};

use plexus_protocol::{ErrorCode, ErrorInfo};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RecordError {
    #[error("record payload must be a JSON object")]
    NotAnObject,
    #[error("record payload has no `kind` field")]
    MissingKind,
    #[error("unknown record kind `{0}`")]
    UnknownKind(String),
    #[error("invalid `{0}` field")]
    InvalidField(&'static str),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum FilterError {
    #[error("invalid regex `{pattern}` for field `{field}`: {reason}")]
    InvalidRegex {
        field: String,
        pattern: String,
        reason: String,
    },
    #[error("empty time window: since {since} is after until {until}")]
    InvalidBounds { since: f64, until: f64 },
}

impl From<RecordError> for ErrorInfo {
    fn from(err: RecordError) -> Self {
        ErrorInfo::new(ErrorCode::InvalidRequest, err.to_string())
    }
}

impl From<FilterError> for ErrorInfo {
    fn from(err: FilterError) -> Self {
        ErrorInfo::new(ErrorCode::FilterError, err.to_string())
    }
}
