use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::cache::ExistenceCache;
use crate::rate::RateLimiter;
use crate::stats::RunStats;

/// Shared state of one run phase, handed explicitly to the fetcher or the
/// publisher.
///
/// `C` is the client of the provider the phase talks to. Each phase gets its
/// own limiter, so the tile server and the object store are paced
/// independently. The existence cache is only carried by the fetch phase.
pub struct RunContext<C> {
    pub client: Arc<C>,
    pub limiter: Arc<RateLimiter>,
    pub stats: Arc<RunStats>,
    pub cache: Option<Arc<ExistenceCache>>,
    pub cancel: CancellationToken,
}

impl<C> RunContext<C> {
    /// A context whose limiter allows `rate_per_second` provider calls.
    pub fn new(client: C, rate_per_second: u32) -> Self {
        Self {
            client: Arc::new(client),
            limiter: Arc::new(RateLimiter::new(rate_per_second)),
            stats: Arc::new(RunStats::default()),
            cache: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Shares the cancellation token and stats sink of another phase.
    pub fn with_shared(mut self, cancel: CancellationToken, stats: Arc<RunStats>) -> Self {
        self.cancel = cancel;
        self.stats = stats;
        self
    }

    pub fn with_cache(mut self, cache: Arc<ExistenceCache>) -> Self {
        self.cache = Some(cache);
        self
    }
}

impl<C> Clone for RunContext<C> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            limiter: Arc::clone(&self.limiter),
            stats: Arc::clone(&self.stats),
            cache: self.cache.clone(),
            cancel: self.cancel.clone(),
        }
    }
}
