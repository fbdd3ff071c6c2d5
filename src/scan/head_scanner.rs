use alloy::primitives::Address;
use sqlx::PgPool;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::ChainProfile;
use crate::db::repository;
use crate::error::Result;
use crate::scan::log_crawler::LogCrawler;
use crate::snapshot::discovery::normalize_transfers;
use crate::snapshot::SnapshotEngine;
use crate::tracked::TrackedSet;

const HEAD_QUORUM: usize = 2;

/// Per-chain polling loop: walk new blocks, find transfers touching tracked
/// wallets, invalidate their snapshots and schedule rebuilds. Database and
/// provider trouble backs off exponentially; the loop itself never exits
/// except on shutdown.
pub async fn run_head_scanner(
    engine: Arc<SnapshotEngine>,
    tracked: Arc<TrackedSet>,
    db: PgPool,
    profile: ChainProfile,
    shutdown: CancellationToken,
) {
    let poll = Duration::from_millis(profile.poll_interval_ms);
    let mut backoff = Duration::from_secs(1);

    tracing::info!(
        chain = %profile.name,
        chain_id = profile.chain_id,
        poll_ms = profile.poll_interval_ms,
        "Head scanner started"
    );

    loop {
        tokio::select! {
            _ = tokio::time::sleep(poll) => {}
            _ = shutdown.cancelled() => {
                tracing::info!(chain = %profile.name, "Shutdown received, stopping head scanner");
                return;
            }
        }

        match scan_tick(&engine, &tracked, &db, &profile).await {
            Ok(()) => backoff = Duration::from_secs(1),
            Err(e) => {
                tracing::error!(
                    chain = %profile.name,
                    error = %e,
                    backoff_secs = backoff.as_secs(),
                    "Head scan tick failed"
                );
                let _ = repository::set_block_sync_status(&db, profile.chain_id, "error").await;
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.cancelled() => return,
                }
                backoff = (backoff * 2).min(Duration::from_secs(60));
            }
        }
    }
}

async fn scan_tick(
    engine: &Arc<SnapshotEngine>,
    tracked: &TrackedSet,
    db: &PgPool,
    profile: &ChainProfile,
) -> Result<()> {
    let providers = engine.providers().chain(profile.chain_id)?;
    let latest = providers.block_number_quorum(HEAD_QUORUM).await?;

    let status = repository::get_block_sync(db, profile.chain_id).await?;
    let mut synced = match &status {
        Some(row) => {
            // A checkpoint ahead of its own recorded head means the row was
            // mutated out from under us; panic so the supervisor restarts
            // this scanner from a clean read.
            if row.synced_block > row.latest_block {
                panic!(
                    "block_sync_status for chain {} has synced_block {} > latest_block {}",
                    profile.chain_id, row.synced_block, row.latest_block
                );
            }
            row.synced_block as u64
        }
        None => {
            // First sight of this chain: start at the current head.
            let initial = latest.saturating_sub(1);
            repository::upsert_block_sync(db, profile.chain_id, latest as i64, initial as i64, "active")
                .await?;
            initial
        }
    };

    if latest < synced {
        // The chain head moved backwards: a reorg. Rewind and replay;
        // invalidation is idempotent so at-least-once is fine.
        let rewound = latest.saturating_sub(profile.reorg_depth);
        tracing::warn!(
            chain = %profile.name,
            latest,
            synced,
            rewound,
            "Reorg detected, rewinding scanner"
        );
        repository::upsert_block_sync(db, profile.chain_id, latest as i64, rewound as i64, "active")
            .await?;
        synced = rewound;
    }

    let from = synced + 1;
    if from > latest {
        repository::upsert_block_sync(db, profile.chain_id, latest as i64, synced as i64, "active")
            .await?;
        return Ok(());
    }
    let to = latest.min(synced + profile.max_catchup);

    let wallets = tracked.for_chain(profile.chain_id);
    if !wallets.is_empty() {
        let targets: Vec<Address> = wallets.iter().copied().collect();
        let crawler = LogCrawler::new(providers);
        let outcome = crawler.crawl_set(&targets, from, to).await?;

        if outcome.skipped_blocks > 0 {
            tracing::warn!(
                chain = %profile.name,
                skipped = outcome.skipped_blocks,
                "Blocks skipped in catch-up window"
            );
        }

        let touched = invalidate_touched(engine, db, profile, &wallets, &outcome).await?;
        if touched > 0 {
            tracing::info!(
                chain = %profile.name,
                from,
                to,
                transfers = outcome.transfers.len(),
                wallets = touched,
                "Tracked wallets touched by new blocks"
            );
        }
    }

    repository::upsert_block_sync(db, profile.chain_id, latest as i64, to as i64, "active").await?;
    Ok(())
}

/// Record normalized transfers and invalidate every tracked wallet that
/// appears on either side of one. Returns the number of wallets refreshed.
async fn invalidate_touched(
    engine: &Arc<SnapshotEngine>,
    db: &PgPool,
    profile: &ChainProfile,
    tracked: &HashSet<Address>,
    outcome: &crate::scan::log_crawler::CrawlOutcome,
) -> Result<usize> {
    let mut touched: HashSet<Address> = HashSet::new();
    for transfer in &outcome.transfers {
        if tracked.contains(&transfer.from) {
            touched.insert(transfer.from);
        }
        if tracked.contains(&transfer.to) {
            touched.insert(transfer.to);
        }
    }

    for wallet_addr in &touched {
        let wallet = format!("{:#x}", wallet_addr);

        let rows: Vec<_> = outcome
            .transfers
            .iter()
            .filter(|t| t.from == *wallet_addr || t.to == *wallet_addr)
            .cloned()
            .collect();
        let normalized = normalize_transfers(profile.chain_id, &wallet, *wallet_addr, &rows);
        if let Err(e) = repository::insert_wallet_transactions(db, &normalized).await {
            tracing::warn!(error = %e, wallet = %wallet, "Skipping transfer persistence");
        }

        engine.invalidate(profile.chain_id, &wallet).await?;
        engine.spawn_background_build(profile.chain_id, wallet, false);
    }

    Ok(touched.len())
}
