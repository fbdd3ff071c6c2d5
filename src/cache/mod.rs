pub mod single_flight;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::CacheConfig;
use crate::db::repository;

pub use single_flight::{Flight, SharedBuild, SingleFlight};

/// Stale-while-revalidate classification of a cache row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Within TTL; serve as-is.
    Fresh,
    /// Past TTL but within the hard expiry; serve and rebuild in background.
    Stale,
    /// Past the hard expiry; treat as a miss.
    Expired,
}

pub fn classify(
    last_updated: DateTime<Utc>,
    now: DateTime<Utc>,
    ttl: Duration,
    hard_expiry: Duration,
) -> Freshness {
    let age = (now - last_updated).to_std().unwrap_or(Duration::ZERO);
    if age < ttl {
        Freshness::Fresh
    } else if age < hard_expiry {
        Freshness::Stale
    } else {
        Freshness::Expired
    }
}

/// Durations derived once from config and shared by the engine and sweeper.
#[derive(Debug, Clone, Copy)]
pub struct CacheSettings {
    pub ttl: Duration,
    pub hard_expiry: Duration,
    pub build_timeout: Duration,
    pub stuck_threshold: Duration,
    pub sweep_interval: Duration,
}

impl From<&CacheConfig> for CacheSettings {
    fn from(config: &CacheConfig) -> Self {
        Self {
            ttl: Duration::from_secs(config.ttl_seconds),
            hard_expiry: Duration::from_secs(config.hard_expiry_minutes * 60),
            build_timeout: Duration::from_secs(config.build_timeout_seconds),
            stuck_threshold: Duration::from_secs(config.stuck_sync_threshold_seconds),
            sweep_interval: Duration::from_secs(config.sweep_interval_minutes * 60),
        }
    }
}

/// Periodic cache maintenance: clears syncing flags orphaned by a crash
/// (within a live process the single-flight map is authoritative) and drops
/// hard-expired rows for wallets nobody tracks.
pub async fn run_sweeper(db: PgPool, settings: CacheSettings, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(settings.sweep_interval) => {}
            _ = shutdown.cancelled() => {
                tracing::info!("Shutdown received, stopping cache sweeper");
                return;
            }
        }

        match repository::clear_stuck_syncing(&db, settings.stuck_threshold.as_secs()).await {
            Ok(cleared) if cleared > 0 => {
                tracing::warn!(cleared, "Recovered stuck syncing flags");
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "Stuck-sync sweep failed"),
        }

        match repository::delete_expired_cache(&db, settings.hard_expiry.as_secs()).await {
            Ok(deleted) if deleted > 0 => {
                tracing::info!(deleted, "Expired cache entries removed");
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "Expiry sweep failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    const TTL: Duration = Duration::from_secs(60);
    const HARD: Duration = Duration::from_secs(1800);

    #[test]
    fn classifies_fresh_stale_expired() {
        let now = Utc::now();
        let at = |secs: i64| now - TimeDelta::seconds(secs);

        assert_eq!(classify(at(10), now, TTL, HARD), Freshness::Fresh);
        assert_eq!(classify(at(59), now, TTL, HARD), Freshness::Fresh);
        assert_eq!(classify(at(60), now, TTL, HARD), Freshness::Stale);
        assert_eq!(classify(at(120), now, TTL, HARD), Freshness::Stale);
        assert_eq!(classify(at(1799), now, TTL, HARD), Freshness::Stale);
        assert_eq!(classify(at(1800), now, TTL, HARD), Freshness::Expired);
        assert_eq!(classify(at(86400), now, TTL, HARD), Freshness::Expired);
    }

    #[test]
    fn future_timestamps_read_as_fresh() {
        // Clock skew between app and DB must not expire live entries.
        let now = Utc::now();
        let future = now + TimeDelta::seconds(5);
        assert_eq!(classify(future, now, TTL, HARD), Freshness::Fresh);
    }

    #[test]
    fn invalidated_entry_is_expired() {
        // Invalidation rewrites last_updated to the epoch.
        let now = Utc::now();
        let epoch = DateTime::<Utc>::from_timestamp(0, 0).unwrap();
        assert_eq!(classify(epoch, now, TTL, HARD), Freshness::Expired);
    }
}
