use anyhow::Result;
use clap::Parser;
use parcelscan::carriers::{CarrierRegistry, UpsClient};
use parcelscan::config;
use parcelscan::db;
use parcelscan::model::Carrier;
use parcelscan::resolver::{OrderResolver, ResolverConfig};
use parcelscan::shopify::ShopifyClient;
use parcelscan::source::RetryPolicy;
use parcelscan::sync::{self, OrdersSync};
use parcelscan::trackcache::{CacheConfig, TrackingCache};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/parcelscan.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let retry = RetryPolicy {
        max_attempts: cfg.resolver.retry_max_attempts,
        base_delay: Duration::from_secs(cfg.resolver.retry_base_delay_secs),
        max_delay: Duration::from_secs(cfg.resolver.retry_max_delay_secs),
    };

    let shopify = Arc::new(ShopifyClient::new(
        &cfg.shopify.shop_url,
        cfg.shopify.access_token.clone(),
        Duration::from_secs(cfg.shopify.timeout_secs),
    ));
    let resolver = Arc::new(OrderResolver::new(
        pool.clone(),
        shopify.clone(),
        ResolverConfig {
            lookback_days: cfg.resolver.lookback_days,
            retry: retry.clone(),
            ..Default::default()
        },
    ));

    let mut registry = CarrierRegistry::new();
    if !cfg.ups.client_id.trim().is_empty() {
        registry.register(Arc::new(UpsClient::new(
            cfg.ups.client_id.clone(),
            cfg.ups.client_secret.clone(),
            Duration::from_secs(cfg.ups.timeout_secs),
        )));
    }
    let tracked_carriers = registry.carriers();

    let mut batch_sizes = HashMap::new();
    batch_sizes.insert(Carrier::Ups, cfg.refresh.ups_batch_size);
    batch_sizes.insert(Carrier::CanadaPost, cfg.refresh.canada_post_batch_size);
    let cache = Arc::new(TrackingCache::new(
        pool.clone(),
        registry,
        CacheConfig {
            ttl_minutes: cfg.refresh.ttl_minutes,
            activity_window_days: cfg.refresh.activity_window_days,
            batch_sizes,
        },
    ));

    let orders_sync = OrdersSync::new(pool.clone(), shopify.clone(), retry.clone());

    // Background scheduler: orders sync every tick, tracking refresh every
    // N ticks, repair backfills on startup and then daily.
    let tick = Duration::from_secs(cfg.app.sync_interval_secs);
    let refresh_every = cfg.app.refresh_every_ticks;
    let worker_pool = pool.clone();
    let worker_resolver = resolver.clone();
    let worker_cache = cache.clone();
    let scheduler = tokio::spawn(async move {
        if let Err(err) = sync::backfill_split_scans(&worker_pool).await {
            error!(?err, "split-tracking backfill error");
        }
        if let Err(err) = sync::backfill_missing_emails(&worker_pool, &worker_resolver).await {
            error!(?err, "email backfill error");
        }

        let mut ticks = 0u32;
        let mut last_backfill = tokio::time::Instant::now();
        loop {
            if let Err(err) = orders_sync.sync_orders(false).await {
                error!(?err, "orders sync error");
            }

            ticks += 1;
            if ticks >= refresh_every {
                ticks = 0;
                // Carriers refresh concurrently; single-flight is per carrier.
                let cycles = tracked_carriers
                    .iter()
                    .map(|carrier| worker_cache.refresh_cycle(*carrier));
                for (carrier, result) in
                    tracked_carriers.iter().zip(futures::future::join_all(cycles).await)
                {
                    match result {
                        Ok(count) => {
                            info!(carrier = carrier.as_str(), count, "tracking refresh cycle done")
                        }
                        Err(err) => error!(?err, carrier = carrier.as_str(), "refresh cycle error"),
                    }
                }
            }

            if last_backfill.elapsed() >= Duration::from_secs(86_400) {
                if let Err(err) = sync::backfill_split_scans(&worker_pool).await {
                    error!(?err, "split-tracking backfill error");
                }
                if let Err(err) = sync::backfill_missing_emails(&worker_pool, &worker_resolver).await
                {
                    error!(?err, "email backfill error");
                }
                last_backfill = tokio::time::Instant::now();
            }

            tokio::time::sleep(tick).await;
        }
    });

    info!("parcelscan worker started");
    scheduler.await?;
    Ok(())
}
