//! Order resolution.
//!
//! Maps a tracking number or order number to the authoritative order
//! record: local cache first, then the remote order source under the retry
//! policy, then a fuzzy fallback. Remote hits are written back to the local
//! orders table so the next identical lookup is a cache hit.

use crate::db::{self, Pool};
use crate::model::OrderRecord;
use crate::source::{with_retry, OrderSource, RetryPolicy, SourceError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("order source failed: {0}")]
    Source(#[from] SourceError),
    #[error("database error: {0}")]
    Db(#[from] anyhow::Error),
}

/// Resolution outcome. `Ambiguous` carries every fuzzy candidate, most
/// recently updated first: the head is the deterministic winner, but the
/// caller sees that it was a guess.
#[derive(Debug, Clone)]
pub enum Resolution {
    Found(OrderRecord),
    Ambiguous(Vec<OrderRecord>),
    NotFound,
}

impl Resolution {
    pub fn order(&self) -> Option<&OrderRecord> {
        match self {
            Resolution::Found(order) => Some(order),
            Resolution::Ambiguous(candidates) => candidates.first(),
            Resolution::NotFound => None,
        }
    }

    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Resolution::Ambiguous(_))
    }
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub lookback_days: u32,
    pub retry: RetryPolicy,
    pub fuzzy_limit: i64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            lookback_days: 365,
            retry: RetryPolicy::default(),
            fuzzy_limit: 5,
        }
    }
}

pub struct OrderResolver {
    pool: Pool,
    source: Arc<dyn OrderSource>,
    cfg: ResolverConfig,
}

impl OrderResolver {
    pub fn new(pool: Pool, source: Arc<dyn OrderSource>, cfg: ResolverConfig) -> Self {
        Self { pool, source, cfg }
    }

    /// Resolve a tracking number or order number to an order.
    ///
    /// Ladder: local by tracking → local by order number → remote within the
    /// lookback window → fuzzy local fallback. A remote failure after
    /// retries propagates only for non-retryable errors; exhausted retries
    /// surface the same way so the caller can record the scan without order
    /// linkage.
    #[instrument(skip(self))]
    pub async fn resolve(&self, key: &str) -> Result<Resolution, ResolveError> {
        let key = key.trim();
        if key.is_empty() {
            return Ok(Resolution::NotFound);
        }

        if let Some(order) = db::order_by_tracking(&self.pool, key).await? {
            debug!(key, "resolved from local cache by tracking number");
            return Ok(Resolution::Found(order));
        }
        if let Some(order) = db::order_by_number(&self.pool, key.trim_start_matches('#')).await? {
            debug!(key, "resolved from local cache by order number");
            return Ok(Resolution::Found(order));
        }

        match self.resolve_remote(key).await {
            Ok(Some(order)) => return Ok(Resolution::Found(order)),
            Ok(None) => {}
            Err(err) => {
                // A failed remote lookup still gets the fuzzy fallback; the
                // error is only terminal when that finds nothing either.
                warn!(?err, key, "remote order lookup failed");
                return match self.resolve_fuzzy(key).await? {
                    Resolution::NotFound => Err(err),
                    found => Ok(found),
                };
            }
        }

        self.resolve_fuzzy(key).await
    }

    /// Remote lookup by tracking number, then by order number. Successful
    /// hits populate the local orders table.
    async fn resolve_remote(&self, key: &str) -> Result<Option<OrderRecord>, ResolveError> {
        let by_tracking = with_retry(&self.cfg.retry, || {
            self.source.fetch_order_by_tracking(key, self.cfg.lookback_days)
        })
        .await?;

        let remote = match by_tracking {
            Some(order) => Some(order),
            None => {
                with_retry(&self.cfg.retry, || {
                    self.source.fetch_order_by_number(key.trim_start_matches('#'))
                })
                .await?
            }
        };

        let Some(remote) = remote else {
            return Ok(None);
        };
        db::upsert_order(&self.pool, &remote).await?;
        let order = db::order_by_number(&self.pool, &remote.order_number)
            .await?
            .ok_or_else(|| anyhow::anyhow!("order {} vanished after upsert", remote.order_number))?;
        info!(key, order_number = %order.order_number, "resolved via remote order source");
        Ok(Some(order))
    }

    /// Fuzzy fallback: strip non-alphanumerics from the key and try a
    /// case-insensitive containment match, most recently updated first.
    async fn resolve_fuzzy(&self, key: &str) -> Result<Resolution, ResolveError> {
        let token: String = key.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
        if token.is_empty() {
            return Ok(Resolution::NotFound);
        }
        let candidates = db::fuzzy_order_candidates(&self.pool, &token, self.cfg.fuzzy_limit).await?;
        Ok(match candidates.len() {
            0 => Resolution::NotFound,
            1 => Resolution::Found(candidates.into_iter().next().expect("len checked")),
            _ => {
                warn!(key, count = candidates.len(), "fuzzy order match is ambiguous");
                Resolution::Ambiguous(candidates)
            }
        })
    }

    /// Customer email for an order, backfilling from the remote source when
    /// the local record has none.
    pub async fn customer_email(&self, order_number: &str) -> Result<Option<String>, ResolveError> {
        if let Some(order) = db::order_by_number(&self.pool, order_number).await? {
            if order.customer_email.as_deref().is_some_and(|e| !e.is_empty()) {
                return Ok(order.customer_email);
            }
        }
        let remote = with_retry(&self.cfg.retry, || {
            self.source.fetch_order_by_number(order_number)
        })
        .await?;
        if let Some(remote) = remote {
            db::upsert_order(&self.pool, &remote).await?;
            return Ok(remote.customer_email);
        }
        Ok(None)
    }
}
