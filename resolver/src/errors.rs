use crate::config::ValidationError;
use directory::{CacheError, ClientError, LookupError};

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ResolveError {
    #[error("missing \"X-Scope-OrgID\" header, is include_metadata enabled?")]
    MissingHeader,

    #[error("{0} source keys found in the context, can't determine which one to use")]
    AmbiguousHeader(usize),

    #[error("invalid \"X-Scope-OrgID\" header: {0}")]
    InvalidHeader(String),

    #[error("failure looking up by stack id: '{stack_id}', {source}")]
    LookupFailure {
        stack_id: i64,
        source: LookupError,
    },

    #[error("instance URL of stack {stack_id} is not a valid header value")]
    InvalidInstanceUrl { stack_id: i64 },
}

#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    #[error(transparent)]
    InvalidConfig(#[from] ValidationError),

    #[error("unable to create directory client: {0}")]
    Client(#[from] ClientError),

    #[error("unable to build instance cache: {0}")]
    Cache(#[from] CacheError),
}
