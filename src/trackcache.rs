//! Tracking status cache and refresh scheduler.
//!
//! Read-through cache over the carrier tracking adapters with a freshness
//! TTL, plus the periodic per-carrier refresh cycle that keeps non-final
//! shipments current without exceeding upstream rate limits.

use crate::carriers::CarrierRegistry;
use crate::classify;
use crate::db::{self, Pool};
use crate::model::{Carrier, TrackingEntry};
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error)]
pub enum TrackError {
    #[error("no tracking adapter registered for {0}")]
    NoAdapter(&'static str),
    #[error("carrier unavailable and no cached status exists")]
    CarrierUnavailable,
    #[error("database error: {0}")]
    Db(#[from] anyhow::Error),
}

/// A cache read: the entry plus whether it is past its TTL. Stale entries
/// are only returned when the carrier could not be reached.
#[derive(Debug, Clone)]
pub struct StatusView {
    pub entry: TrackingEntry,
    pub stale: bool,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl_minutes: i64,
    pub activity_window_days: i64,
    pub batch_sizes: HashMap<Carrier, u32>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let mut batch_sizes = HashMap::new();
        batch_sizes.insert(Carrier::Ups, 30);
        batch_sizes.insert(Carrier::CanadaPost, 20);
        Self {
            ttl_minutes: 120,
            activity_window_days: 30,
            batch_sizes,
        }
    }
}

impl CacheConfig {
    fn cap_for(&self, carrier: Carrier) -> i64 {
        self.batch_sizes.get(&carrier).copied().unwrap_or(20) as i64
    }
}

pub struct TrackingCache {
    pool: Pool,
    registry: CarrierRegistry,
    cfg: CacheConfig,
    /// One lock per carrier; `try_lock` makes refresh cycles single-flight.
    cycle_locks: StdMutex<HashMap<Carrier, Arc<Mutex<()>>>>,
}

impl TrackingCache {
    pub fn new(pool: Pool, registry: CarrierRegistry, cfg: CacheConfig) -> Self {
        Self {
            pool,
            registry,
            cfg,
            cycle_locks: StdMutex::new(HashMap::new()),
        }
    }

    /// Whether a cached entry can still satisfy a fresh-data request.
    ///
    /// An entry inside the TTL is normally fresh, unless its estimated
    /// delivery date has already passed without a delivery: a lapsed promise
    /// date forces a refresh so the operator never sees it as current.
    fn is_fresh(&self, entry: &TrackingEntry) -> bool {
        let age = Utc::now() - entry.fetched_at;
        if age >= Duration::minutes(self.cfg.ttl_minutes) {
            return false;
        }
        if !entry.is_delivered {
            if let Some(promised) = entry.estimated_delivery {
                if promised < Utc::now().date_naive() {
                    return false;
                }
            }
        }
        true
    }

    /// Read-through status lookup.
    ///
    /// Fresh cache entries are returned as-is. On a miss or expiry the
    /// carrier adapter is called synchronously and the result cached. If the
    /// adapter fails but a stale entry exists, the stale entry is returned
    /// flagged rather than failing the caller.
    #[instrument(skip(self))]
    pub async fn status(&self, tracking_number: &str) -> Result<StatusView, TrackError> {
        let cached = db::tracking_entry(&self.pool, tracking_number).await?;
        if let Some(entry) = &cached {
            if self.is_fresh(entry) {
                return Ok(StatusView {
                    entry: entry.clone(),
                    stale: false,
                });
            }
        }

        let carrier = cached
            .as_ref()
            .map(|e| e.carrier)
            .filter(|c| *c != Carrier::Unknown)
            .unwrap_or_else(|| classify::detect_carrier(tracking_number));

        match self.refresh_one(carrier, tracking_number).await {
            Ok(entry) => Ok(StatusView { entry, stale: false }),
            Err(err) => match cached {
                Some(entry) => {
                    warn!(?err, tracking_number, "carrier lookup failed; serving stale status");
                    Ok(StatusView { entry, stale: true })
                }
                None => match err {
                    TrackError::NoAdapter(name) => Err(TrackError::NoAdapter(name)),
                    TrackError::Db(e) => Err(TrackError::Db(e)),
                    _ => Err(TrackError::CarrierUnavailable),
                },
            },
        }
    }

    /// Call the carrier and overwrite the cache entry.
    async fn refresh_one(
        &self,
        carrier: Carrier,
        tracking_number: &str,
    ) -> Result<TrackingEntry, TrackError> {
        let source = self
            .registry
            .get(carrier)
            .ok_or(TrackError::NoAdapter(carrier.as_str()))?;
        let snapshot = source
            .track(tracking_number)
            .await
            .map_err(|_| TrackError::CarrierUnavailable)?;
        db::upsert_tracking_entry(&self.pool, tracking_number, carrier, &snapshot).await?;
        let entry = db::tracking_entry(&self.pool, tracking_number)
            .await?
            .ok_or_else(|| anyhow::anyhow!("tracking entry vanished after upsert"))?;
        Ok(entry)
    }

    /// One refresh cycle for a carrier: refresh up to the per-carrier cap of
    /// candidates, oldest data first. Individual failures are logged and
    /// skipped. Returns how many entries were refreshed.
    ///
    /// Cycles are single-flight per carrier: if one is already running, this
    /// call is a no-op returning 0.
    #[instrument(skip(self))]
    pub async fn refresh_cycle(&self, carrier: Carrier) -> Result<usize, TrackError> {
        let lock = {
            let mut locks = self.cycle_locks.lock().expect("cycle lock registry poisoned");
            locks.entry(carrier).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        let Ok(_guard) = lock.try_lock() else {
            debug!(carrier = carrier.as_str(), "refresh cycle already in flight; skipping");
            return Ok(0);
        };

        if self.registry.get(carrier).is_none() {
            debug!(carrier = carrier.as_str(), "no adapter registered; skipping refresh");
            return Ok(0);
        }

        let candidates = db::refresh_candidates(
            &self.pool,
            carrier,
            self.cfg.activity_window_days,
            self.cfg.ttl_minutes,
            self.cfg.cap_for(carrier),
        )
        .await?;
        if candidates.is_empty() {
            debug!(carrier = carrier.as_str(), "no tracking numbers need refresh");
            return Ok(0);
        }

        info!(
            carrier = carrier.as_str(),
            count = candidates.len(),
            "refreshing tracking statuses"
        );
        let mut refreshed = 0usize;
        for tracking_number in &candidates {
            match self.refresh_one(carrier, tracking_number).await {
                Ok(_) => refreshed += 1,
                Err(err) => {
                    warn!(?err, tracking_number, "tracking refresh failed; skipping");
                }
            }
        }
        info!(
            carrier = carrier.as_str(),
            refreshed,
            errors = candidates.len() - refreshed,
            "refresh cycle complete"
        );
        Ok(refreshed)
    }
}
