//! Cache-first request wrapper
//!
//! [`CachedRequest`] decorates any [`Fetch`] implementation:
//! - fresh cache entry: returned immediately, refreshed in the background
//! - no fresh entry: fetched and cached
//! - fetch failure: one fallback read with twice the TTL, marked `expired`
//!
//! Background refresh failures are logged and never reach the caller.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::ResponseCache;
use crate::Result;
use crate::config::CacheConfig;

/// An asynchronous data fetch addressed by endpoint and parameters
#[async_trait]
pub trait Fetch<T>: Send + Sync {
    /// Fetch the current value of `endpoint` with `params`
    async fn fetch(&self, endpoint: &str, params: &Value) -> Result<T>;
}

/// Background refresh of a cache hit, resolving to the fetched value
pub type Refresh<T> = JoinHandle<Option<T>>;

/// Options for a [`CachedRequest`]
#[derive(Debug, Clone)]
pub struct CachedRequestOptions {
    /// Freshness window
    pub ttl: Duration,
    /// Disable to always go to the fetcher
    pub use_cache: bool,
    /// Cache under this endpoint instead of the requested one
    pub cache_key: Option<String>,
}

impl CachedRequestOptions {
    /// Options derived from the cache configuration
    #[must_use]
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            ttl: config.default_ttl,
            use_cache: config.enabled,
            cache_key: None,
        }
    }

    /// Override the TTL
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

impl Default for CachedRequestOptions {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

/// Value returned by a [`CachedRequest`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedResponse<T> {
    /// The data
    pub data: T,
    /// Served from cache rather than a completed fetch
    pub from_cache: bool,
    /// Served past its freshness window because the fetch failed
    pub expired: bool,
}

impl<T> CachedResponse<T> {
    fn fresh(data: T) -> Self {
        Self {
            data,
            from_cache: false,
            expired: false,
        }
    }

    fn cached(data: T) -> Self {
        Self {
            data,
            from_cache: true,
            expired: false,
        }
    }

    fn stale(data: T) -> Self {
        Self {
            data,
            from_cache: true,
            expired: true,
        }
    }
}

/// A cache lookup for [`CachedRequest::preload`]
#[derive(Debug, Clone)]
pub struct PreloadRequest {
    /// Endpoint to look up
    pub endpoint: String,
    /// Request parameters
    pub params: Value,
    /// TTL to check against (defaults to the request's TTL)
    pub ttl: Option<Duration>,
}

/// Result of a cache lookup
#[derive(Debug, Clone, PartialEq)]
pub struct PreloadResult<T> {
    /// Probed endpoint
    pub endpoint: String,
    /// Cached data, if fresh
    pub data: Option<T>,
    /// Whether `data` came from the cache
    pub from_cache: bool,
}

/// A fetch operation wrapped with cache-first reads
pub struct CachedRequest<T, F> {
    cache: Arc<ResponseCache>,
    fetcher: Arc<F>,
    options: CachedRequestOptions,
    _marker: PhantomData<fn() -> T>,
}

impl<T, F> CachedRequest<T, F>
where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fetch<T> + 'static,
{
    /// Wrap `fetcher` with `cache`
    pub fn new(cache: Arc<ResponseCache>, fetcher: Arc<F>, options: CachedRequestOptions) -> Self {
        Self {
            cache,
            fetcher,
            options,
            _marker: PhantomData,
        }
    }

    /// Serve `(endpoint, params)` cache-first
    ///
    /// # Errors
    ///
    /// Returns the fetch error when the fetch fails and no relaxed-TTL
    /// cached value exists.
    pub async fn get(&self, endpoint: &str, params: &Value) -> Result<CachedResponse<T>> {
        let (response, _refresh) = self.get_with_refresh(endpoint, params).await?;
        Ok(response)
    }

    /// Like [`CachedRequest::get`], also handing back the background refresh
    /// started for a cache hit
    ///
    /// The refresh resolves to the fetched value, or `None` when the fetch
    /// failed. Short-lived callers await it so the refresh is not cut off
    /// when the runtime shuts down.
    ///
    /// # Errors
    ///
    /// Returns the fetch error when the fetch fails and no relaxed-TTL
    /// cached value exists.
    pub async fn get_with_refresh(
        &self,
        endpoint: &str,
        params: &Value,
    ) -> Result<(CachedResponse<T>, Option<Refresh<T>>)> {
        let key = self.options.cache_key.as_deref().unwrap_or(endpoint);
        let ttl = self.options.ttl;

        // Peek so an expired entry survives for the fallback below
        if self.options.use_cache {
            if let Some(data) = self.cache.peek::<T>(key, params, ttl) {
                let refresh = self.refresh_in_background(endpoint, key, params);
                return Ok((CachedResponse::cached(data), Some(refresh)));
            }
        }

        match self.fetcher.fetch(endpoint, params).await {
            Ok(data) => {
                if self.options.use_cache {
                    self.cache.set(key, params, &data, ttl);
                }
                Ok((CachedResponse::fresh(data), None))
            }
            Err(e) => {
                if self.options.use_cache {
                    if let Some(data) = self.cache.get::<T>(key, params, ttl.saturating_mul(2)) {
                        warn!(endpoint = %endpoint, error = %e, "Request failed, serving expired cache");
                        return Ok((CachedResponse::stale(data), None));
                    }
                }
                Err(e)
            }
        }
    }

    /// Report which requests the cache can already answer, without fetching
    pub fn preload(&self, requests: &[PreloadRequest]) -> Vec<PreloadResult<T>> {
        requests
            .iter()
            .map(|req| {
                let ttl = req.ttl.unwrap_or(self.options.ttl);
                let data = self.cache.peek::<T>(&req.endpoint, &req.params, ttl);
                PreloadResult {
                    endpoint: req.endpoint.clone(),
                    from_cache: data.is_some(),
                    data,
                }
            })
            .collect()
    }

    fn refresh_in_background(&self, endpoint: &str, key: &str, params: &Value) -> Refresh<T> {
        let cache = Arc::clone(&self.cache);
        let fetcher = Arc::clone(&self.fetcher);
        let endpoint = endpoint.to_string();
        let key = key.to_string();
        let params = params.clone();
        let ttl = self.options.ttl;

        tokio::spawn(async move {
            match fetcher.fetch(&endpoint, &params).await {
                Ok(data) => {
                    cache.set(&key, &params, &data, ttl);
                    Some(data)
                }
                Err(e) => {
                    debug!(endpoint = %endpoint, error = %e, "Background refresh failed");
                    None
                }
            }
        })
    }
}
