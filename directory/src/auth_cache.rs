//! Caches API key checks so that repeated requests with the same token do not
//! hit the directory. Expired valid keys are kept around and reused while the
//! directory is unreachable.

use crate::client::{ClientError, DirectoryClient};
use crate::metrics_defs::{AUTH_CACHE_HIT, AUTH_CACHE_MISS};
use crate::types::ApiKey;
use moka::sync::Cache;
use shared::counter;
use std::sync::Arc;
use std::time::{Duration, Instant};

const SIZE: u64 = 10_000;

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("API Key Not Valid")]
    BadKey,

    #[error(transparent)]
    Client(#[from] ClientError),
}

#[derive(Clone)]
struct CachedKey {
    // None for a key the directory rejected.
    key: Option<ApiKey>,
    expires_at: Instant,
}

pub struct AuthCache {
    client: Arc<dyn DirectoryClient>,
    ttl: Duration,
    items: Cache<String, CachedKey>,
}

impl AuthCache {
    pub fn new(client: Arc<dyn DirectoryClient>, ttl: Duration) -> Self {
        // Entries expire on our own clock, moka only bounds the size.
        let items = Cache::builder().max_capacity(SIZE).build();
        AuthCache { client, ttl, items }
    }

    pub fn set(&self, token: &str, key: Option<ApiKey>) {
        self.items.insert(
            token.to_string(),
            CachedKey {
                key,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn clear(&self) {
        self.items.invalidate_all();
    }

    /// Returns the key for `token`, asking the directory when the cached answer is
    /// missing or expired.
    pub async fn check_key(&self, token: &str) -> Result<ApiKey, AuthError> {
        let cached = self.items.get(token);

        if let Some(cached) = &cached
            && cached.expires_at > Instant::now()
        {
            counter!(AUTH_CACHE_HIT).increment(1);
            return match &cached.key {
                Some(key) => {
                    tracing::debug!("Cache hit for valid key");
                    Ok(key.clone())
                }
                None => {
                    tracing::debug!("Cache hit for invalid key");
                    Err(AuthError::BadKey)
                }
            };
        }

        counter!(AUTH_CACHE_MISS).increment(1);
        let stale = cached.and_then(|cached| cached.key);

        match self.client.check_api_key(token).await {
            Ok(key) => {
                self.set(token, Some(key.clone()));
                Ok(key)
            }
            Err(e) if e.is_access_error() && stale.is_some() => {
                tracing::warn!(error = %e, "Unable to reach the directory, using cached key");
                self.set(token, stale.clone());
                stale.ok_or(AuthError::Client(e))
            }
            Err(e) => {
                tracing::debug!(error = %e, "Caching rejected key");
                self.set(token, None);
                Err(e.into())
            }
        }
    }
}
