use http::{HeaderMap, HeaderName};

/// Carries the stack id of the tenant sending the request.
pub const ORG_ID_HEADER: HeaderName = HeaderName::from_static("x-scope-orgid");

/// Set by the resolver to the URL of the instance that receives the request.
pub const INSTANCE_URL_HEADER: HeaderName = HeaderName::from_static("x-scope-instanceurl");

/// Metadata attached to a request as it flows through the pipeline.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    /// Metadata sent by the client, read only.
    pub client_metadata: HeaderMap,
    /// Metadata forwarded to the next stages, created on first write.
    pub metadata: Option<HeaderMap>,
}

impl RequestContext {
    pub fn new(client_metadata: HeaderMap) -> Self {
        RequestContext {
            client_metadata,
            metadata: None,
        }
    }

    /// Value of `name` in the forwarded metadata.
    pub fn get(&self, name: &HeaderName) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|metadata| metadata.get(name))
            .and_then(|value| value.to_str().ok())
    }
}
