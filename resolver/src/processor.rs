use crate::config::ResolverConfig;
use crate::errors::{BuildError, ResolveError};
use crate::metadata::{INSTANCE_URL_HEADER, ORG_ID_HEADER, RequestContext};
use crate::signal::Signal;
use async_trait::async_trait;
use directory::{EntityLookup, EntityType, MultiInstanceCache};
use http::{HeaderMap, HeaderValue};
use shared::counter;
use std::sync::Arc;

/// Resolves the stack id a request was sent with to the instance URL of a signal
/// and records it in the request metadata.
#[derive(Clone)]
pub struct TenantResolver {
    cache: Arc<dyn EntityLookup>,
    signal: Signal,
}

impl TenantResolver {
    pub fn new(cache: Arc<dyn EntityLookup>, signal: Signal) -> Self {
        TenantResolver { cache, signal }
    }

    pub fn signal(&self) -> Signal {
        self.signal
    }

    /// Sets the instance URL header on the forwarded metadata of `ctx`.
    ///
    /// On error `ctx` is left untouched.
    pub fn enrich(&self, ctx: &mut RequestContext) -> Result<(), ResolveError> {
        let org_id = org_id_from_metadata(&ctx.client_metadata)?;

        let stack_id: i64 = org_id
            .parse()
            .map_err(|_| ResolveError::InvalidHeader(org_id.to_string()))?;

        // The header carries the stack id, not the id of a signal instance.
        let stack = self
            .cache
            .get_by_id(EntityType::Stack, stack_id)
            .map_err(|source| ResolveError::LookupFailure { stack_id, source })?;

        let (tenant_id, cluster_url) = self.signal.tenant(&stack);
        let value = HeaderValue::from_str(cluster_url)
            .map_err(|_| ResolveError::InvalidInstanceUrl { stack_id })?;

        counter!(
            self.signal.requests_metric(),
            "org_id" => stack.org_id.to_string(),
            "tenant_id" => tenant_id.to_string(),
            "cluster_url" => cluster_url.to_string()
        )
        .increment(1);

        ctx.metadata
            .get_or_insert_with(HeaderMap::new)
            .insert(INSTANCE_URL_HEADER, value);

        Ok(())
    }
}

fn org_id_from_metadata(metadata: &HeaderMap) -> Result<&str, ResolveError> {
    let mut values = metadata.get_all(ORG_ID_HEADER).iter();

    match (values.next(), values.next()) {
        (None, _) => Err(ResolveError::MissingHeader),
        (Some(value), None) => value.to_str().map_err(|_| {
            ResolveError::InvalidHeader(String::from_utf8_lossy(value.as_bytes()).into_owned())
        }),
        (Some(_), Some(_)) => Err(ResolveError::AmbiguousHeader(
            metadata.get_all(ORG_ID_HEADER).iter().count(),
        )),
    }
}

/// The next stage of a pipeline.
#[async_trait]
pub trait Consumer<T: Send + 'static>: Send + Sync {
    type Error: From<ResolveError> + Send;

    async fn consume(&self, ctx: RequestContext, data: T) -> Result<(), Self::Error>;
}

/// Pipeline stage that resolves the tenant before handing the data to `next`.
pub struct TenantProcessor<C> {
    resolver: TenantResolver,
    next: C,
}

impl<C> TenantProcessor<C> {
    pub fn new(resolver: TenantResolver, next: C) -> Self {
        TenantProcessor { resolver, next }
    }

    pub fn resolver(&self) -> &TenantResolver {
        &self.resolver
    }
}

#[async_trait]
impl<T, C> Consumer<T> for TenantProcessor<C>
where
    T: Send + 'static,
    C: Consumer<T>,
{
    type Error = C::Error;

    async fn consume(&self, mut ctx: RequestContext, data: T) -> Result<(), Self::Error> {
        if let Err(e) = self.resolver.enrich(&mut ctx) {
            tracing::debug!(signal = %self.resolver.signal(), error = %e, "Rejecting request");
            return Err(e.into());
        }
        self.next.consume(ctx, data).await
    }
}

/// The stack cache and one resolver per signal, built from configuration.
pub struct Resolvers {
    cache: Arc<MultiInstanceCache>,
    pub metrics: TenantResolver,
    pub logs: TenantResolver,
    pub traces: TenantResolver,
}

impl Resolvers {
    pub async fn from_config(config: &ResolverConfig) -> Result<Self, BuildError> {
        config.validate()?;

        tracing::info!(
            service_name = %config.service_name,
            clusters = ?config.cluster_filters,
            "Building tenant resolvers"
        );

        let client = directory::new_client(&config.client, &config.service_name)?;
        let cluster_filters: Vec<String> = config
            .cluster_filters
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();

        let cache =
            Arc::new(MultiInstanceCache::new(&config.cache, &cluster_filters, client).await?);
        let lookup: Arc<dyn EntityLookup> = cache.clone();

        Ok(Resolvers {
            cache,
            metrics: TenantResolver::new(lookup.clone(), Signal::Metrics),
            logs: TenantResolver::new(lookup.clone(), Signal::Logs),
            traces: TenantResolver::new(lookup, Signal::Traces),
        })
    }

    pub fn cache(&self) -> Arc<MultiInstanceCache> {
        self.cache.clone()
    }

    pub fn for_signal(&self, signal: Signal) -> &TenantResolver {
        match signal {
            Signal::Metrics => &self.metrics,
            Signal::Logs => &self.logs,
            Signal::Traces => &self.traces,
        }
    }

    /// Stops the background refresh of the stack cache.
    pub async fn shutdown(&self) {
        self.cache.shutdown().await;
    }
}
