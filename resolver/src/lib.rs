//! Resolves the tenant of an incoming request from its `X-Scope-OrgID` stack id
//! and tells the next pipeline stages which instance should receive it.

pub mod config;
pub mod errors;
pub mod metadata;
pub mod metrics_defs;
pub mod processor;
pub mod signal;

pub use config::{ResolverConfig, ValidationError};
pub use errors::{BuildError, ResolveError};
pub use metadata::{INSTANCE_URL_HEADER, ORG_ID_HEADER, RequestContext};
pub use processor::{Consumer, Resolvers, TenantProcessor, TenantResolver};
pub use signal::Signal;
