use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::types::Json;
use sqlx::PgPool;

use crate::error::Result;
use crate::snapshot::types::WalletSnapshot;

// ============================================================
// wallet_cache
// ============================================================

#[derive(Debug)]
pub struct CacheRow {
    pub data: WalletSnapshot,
    pub last_updated: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub syncing: bool,
}

pub async fn get_cache_entry(
    pool: &PgPool,
    chain_id: i64,
    wallet: &str,
) -> Result<Option<CacheRow>> {
    let row: Option<(Json<WalletSnapshot>, DateTime<Utc>, DateTime<Utc>, bool)> = sqlx::query_as(
        "SELECT data, last_updated, expires_at, syncing
         FROM wallet_cache WHERE chain_id = $1 AND wallet = $2",
    )
    .bind(chain_id)
    .bind(wallet)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(data, last_updated, expires_at, syncing)| CacheRow {
        data: data.0,
        last_updated,
        expires_at,
        syncing,
    }))
}

/// Write a freshly built snapshot. The row is taken FOR UPDATE first so a
/// concurrent sweeper never interleaves between read and write.
pub async fn upsert_cache_entry(
    pool: &PgPool,
    chain_id: i64,
    wallet: &str,
    snapshot: &WalletSnapshot,
    ttl_seconds: u64,
) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("SELECT 1 FROM wallet_cache WHERE chain_id = $1 AND wallet = $2 FOR UPDATE")
        .bind(chain_id)
        .bind(wallet)
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        "INSERT INTO wallet_cache (chain_id, wallet, data, last_updated, expires_at, syncing)
         VALUES ($1, $2, $3, NOW(), NOW() + make_interval(secs => $4), FALSE)
         ON CONFLICT (chain_id, wallet) DO UPDATE
         SET data = $3,
             last_updated = NOW(),
             expires_at = NOW() + make_interval(secs => $4),
             syncing = FALSE",
    )
    .bind(chain_id)
    .bind(wallet)
    .bind(Json(snapshot))
    .bind(ttl_seconds as f64)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Flip the persistent syncing flag on an existing row. New wallets get a
/// row only when their first build lands, so a missing row is fine.
pub async fn set_cache_syncing(
    pool: &PgPool,
    chain_id: i64,
    wallet: &str,
    syncing: bool,
) -> Result<()> {
    sqlx::query("UPDATE wallet_cache SET syncing = $3 WHERE chain_id = $1 AND wallet = $2")
        .bind(chain_id)
        .bind(wallet)
        .bind(syncing)
        .execute(pool)
        .await?;
    Ok(())
}

/// Mark an entry stale so the next read triggers a rebuild. Idempotent.
pub async fn invalidate_cache_entry(pool: &PgPool, chain_id: i64, wallet: &str) -> Result<()> {
    sqlx::query(
        "UPDATE wallet_cache SET last_updated = to_timestamp(0)
         WHERE chain_id = $1 AND wallet = $2",
    )
    .bind(chain_id)
    .bind(wallet)
    .execute(pool)
    .await?;
    Ok(())
}

/// Self-heal after a crash: clear syncing flags that no live build owns.
pub async fn clear_stuck_syncing(pool: &PgPool, threshold_seconds: u64) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE wallet_cache SET syncing = FALSE
         WHERE syncing AND last_updated < NOW() - make_interval(secs => $1)",
    )
    .bind(threshold_seconds as f64)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Drop hard-expired rows, except for wallets that are actively tracked.
pub async fn delete_expired_cache(pool: &PgPool, hard_expiry_seconds: u64) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM wallet_cache c
         WHERE c.last_updated + make_interval(secs => $1) < NOW()
           AND NOT EXISTS (
               SELECT 1 FROM tracked_wallets t
               WHERE t.wallet = c.wallet AND t.active
           )",
    )
    .bind(hard_expiry_seconds as f64)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

// ============================================================
// tracked_wallets
// ============================================================

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TrackedWalletRow {
    pub wallet: String,
    pub chains: Vec<i64>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Add or re-activate a tracked wallet; chain sets union on conflict.
pub async fn upsert_tracked_wallet(pool: &PgPool, wallet: &str, chains: &[i64]) -> Result<()> {
    sqlx::query(
        "INSERT INTO tracked_wallets (wallet, chains, active)
         VALUES ($1, $2, TRUE)
         ON CONFLICT (wallet) DO UPDATE
         SET chains = ARRAY(
                 SELECT DISTINCT c FROM unnest(tracked_wallets.chains || EXCLUDED.chains) AS c
                 ORDER BY c
             ),
             active = TRUE,
             last_seen = NOW()",
    )
    .bind(wallet)
    .bind(chains)
    .execute(pool)
    .await?;
    Ok(())
}

/// Soft-remove: history stays, the refresher and scanners stop caring.
/// Returns false when no active row matched.
pub async fn deactivate_tracked_wallet(pool: &PgPool, wallet: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE tracked_wallets SET active = FALSE, last_seen = NOW()
         WHERE wallet = $1 AND active",
    )
    .bind(wallet)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn list_tracked_wallets(pool: &PgPool) -> Result<Vec<TrackedWalletRow>> {
    let rows = sqlx::query_as::<_, TrackedWalletRow>(
        "SELECT wallet, chains, first_seen, last_seen
         FROM tracked_wallets WHERE active ORDER BY first_seen",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ============================================================
// block_sync_status
// ============================================================

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct BlockSyncRow {
    pub chain_id: i64,
    pub latest_block: i64,
    pub synced_block: i64,
    pub last_sync: DateTime<Utc>,
    pub status: String,
}

pub async fn get_block_sync(pool: &PgPool, chain_id: i64) -> Result<Option<BlockSyncRow>> {
    let row = sqlx::query_as::<_, BlockSyncRow>(
        "SELECT chain_id, latest_block, synced_block, last_sync, status
         FROM block_sync_status WHERE chain_id = $1",
    )
    .bind(chain_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn upsert_block_sync(
    pool: &PgPool,
    chain_id: i64,
    latest_block: i64,
    synced_block: i64,
    status: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO block_sync_status (chain_id, latest_block, synced_block, last_sync, status)
         VALUES ($1, $2, $3, NOW(), $4)
         ON CONFLICT (chain_id) DO UPDATE
         SET latest_block = $2, synced_block = $3, last_sync = NOW(), status = $4",
    )
    .bind(chain_id)
    .bind(latest_block)
    .bind(synced_block)
    .bind(status)
    .execute(pool)
    .await?;
    Ok(())
}

/// Flip only the status column, leaving block checkpoints untouched.
pub async fn set_block_sync_status(pool: &PgPool, chain_id: i64, status: &str) -> Result<()> {
    sqlx::query("UPDATE block_sync_status SET status = $2, last_sync = NOW() WHERE chain_id = $1")
        .bind(chain_id)
        .bind(status)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn list_block_sync(pool: &PgPool) -> Result<Vec<BlockSyncRow>> {
    let rows = sqlx::query_as::<_, BlockSyncRow>(
        "SELECT chain_id, latest_block, synced_block, last_sync, status
         FROM block_sync_status ORDER BY chain_id",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ============================================================
// wallet_scan_state
// ============================================================

pub async fn get_last_scanned_block(
    pool: &PgPool,
    chain_id: i64,
    wallet: &str,
) -> Result<Option<u64>> {
    let row: Option<(i64,)> = sqlx::query_as(
        "SELECT last_scanned_block FROM wallet_scan_state WHERE chain_id = $1 AND wallet = $2",
    )
    .bind(chain_id)
    .bind(wallet)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(b,)| b as u64))
}

pub async fn upsert_last_scanned_block(
    pool: &PgPool,
    chain_id: i64,
    wallet: &str,
    block: u64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO wallet_scan_state (chain_id, wallet, last_scanned_block)
         VALUES ($1, $2, $3)
         ON CONFLICT (chain_id, wallet) DO UPDATE
         SET last_scanned_block = GREATEST(wallet_scan_state.last_scanned_block, $3)",
    )
    .bind(chain_id)
    .bind(wallet)
    .bind(block as i64)
    .execute(pool)
    .await?;
    Ok(())
}

// ============================================================
// wallet_transactions
// ============================================================

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WalletTransactionRow {
    pub chain_id: i64,
    pub wallet: String,
    pub tx_hash: String,
    pub log_index: i64,
    pub block_number: i64,
    pub token_address: String,
    pub counterparty: String,
    pub direction: String,
    pub amount: BigDecimal,
    pub block_timestamp: DateTime<Utc>,
}

/// Multi-row insert, chunked to stay within the Postgres parameter limit.
pub async fn insert_wallet_transactions(
    pool: &PgPool,
    rows: &[WalletTransactionRow],
) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }

    for chunk in rows.chunks(500) {
        let mut query_builder: sqlx::QueryBuilder<sqlx::Postgres> = sqlx::QueryBuilder::new(
            "INSERT INTO wallet_transactions (chain_id, wallet, tx_hash, log_index, \
             block_number, token_address, counterparty, direction, amount, block_timestamp) ",
        );

        query_builder.push_values(chunk, |mut b, t| {
            b.push_bind(t.chain_id)
                .push_bind(&t.wallet)
                .push_bind(&t.tx_hash)
                .push_bind(t.log_index)
                .push_bind(t.block_number)
                .push_bind(&t.token_address)
                .push_bind(&t.counterparty)
                .push_bind(&t.direction)
                .push_bind(&t.amount)
                .push_bind(t.block_timestamp);
        });

        query_builder.push(" ON CONFLICT (chain_id, wallet, tx_hash, log_index) DO NOTHING");
        query_builder.build().execute(pool).await?;
    }

    Ok(())
}

pub async fn get_wallet_transactions(
    pool: &PgPool,
    chain_id: i64,
    wallet: &str,
    limit: i64,
    offset: i64,
) -> Result<(Vec<WalletTransactionRow>, i64)> {
    let rows = sqlx::query_as::<_, WalletTransactionRow>(
        "SELECT chain_id, wallet, tx_hash, log_index, block_number, token_address,
                counterparty, direction, amount, block_timestamp
         FROM wallet_transactions
         WHERE chain_id = $1 AND wallet = $2
         ORDER BY block_number DESC, log_index DESC
         LIMIT $3 OFFSET $4",
    )
    .bind(chain_id)
    .bind(wallet)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    let (total,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM wallet_transactions WHERE chain_id = $1 AND wallet = $2",
    )
    .bind(chain_id)
    .bind(wallet)
    .fetch_one(pool)
    .await?;

    Ok((rows, total))
}

// ============================================================
// token_details
// ============================================================

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TokenMetaRow {
    pub chain_id: i64,
    pub address: String,
    pub symbol: String,
    pub name: String,
    pub decimals: i16,
    pub logo: Option<String>,
    pub verified: bool,
    pub possible_spam: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Seed a curated token: authoritative metadata, marks verified.
pub async fn upsert_verified_token(
    pool: &PgPool,
    chain_id: i64,
    address: &str,
    symbol: &str,
    name: &str,
    decimals: i16,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO token_details (chain_id, address, symbol, name, decimals, verified)
         VALUES ($1, $2, $3, $4, $5, TRUE)
         ON CONFLICT (chain_id, address) DO UPDATE
         SET symbol = $3, name = $4, decimals = $5, verified = TRUE, updated_at = NOW()",
    )
    .bind(chain_id)
    .bind(address)
    .bind(symbol)
    .bind(name)
    .bind(decimals)
    .execute(pool)
    .await?;
    Ok(())
}

/// Record a token seen on-chain for the first time. Never downgrades an
/// existing (possibly verified) row.
pub async fn insert_discovered_token(
    pool: &PgPool,
    chain_id: i64,
    address: &str,
    symbol: &str,
    name: &str,
    decimals: i16,
    possible_spam: bool,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO token_details (chain_id, address, symbol, name, decimals, possible_spam)
         VALUES ($1, $2, $3, $4, $5, $6)
         ON CONFLICT (chain_id, address) DO NOTHING",
    )
    .bind(chain_id)
    .bind(address)
    .bind(symbol)
    .bind(name)
    .bind(decimals)
    .bind(possible_spam)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_tokens(
    pool: &PgPool,
    chain_id: i64,
    addresses: &[String],
) -> Result<Vec<TokenMetaRow>> {
    let rows = sqlx::query_as::<_, TokenMetaRow>(
        "SELECT chain_id, address, symbol, name, decimals, logo, verified, possible_spam,
                created_at, updated_at
         FROM token_details WHERE chain_id = $1 AND address = ANY($2)",
    )
    .bind(chain_id)
    .bind(addresses)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn get_verified_tokens(pool: &PgPool, chain_id: i64) -> Result<Vec<TokenMetaRow>> {
    let rows = sqlx::query_as::<_, TokenMetaRow>(
        "SELECT chain_id, address, symbol, name, decimals, logo, verified, possible_spam,
                created_at, updated_at
         FROM token_details WHERE chain_id = $1 AND verified",
    )
    .bind(chain_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Case-insensitive substring search on symbol/name, exact match on address.
pub async fn search_tokens(
    pool: &PgPool,
    chain_id: Option<i64>,
    query: Option<&str>,
    verified: Option<bool>,
    spam: Option<bool>,
    limit: i64,
    offset: i64,
) -> Result<(Vec<TokenMetaRow>, i64)> {
    let pattern = query.map(|q| format!("%{}%", q.trim().to_lowercase()));
    let exact_address = query
        .map(|q| q.trim().to_lowercase())
        .map(|q| {
            if q.starts_with("0x") {
                q
            } else {
                format!("0x{}", q)
            }
        })
        .filter(|q| q.len() == 42);

    let where_clause = "($1::BIGINT IS NULL OR chain_id = $1)
           AND ($2::TEXT IS NULL OR LOWER(symbol) LIKE $2 OR LOWER(name) LIKE $2 OR address = $3)
           AND ($4::BOOLEAN IS NULL OR verified = $4)
           AND ($5::BOOLEAN IS NULL OR possible_spam = $5)";

    let rows = sqlx::query_as::<_, TokenMetaRow>(&format!(
        "SELECT chain_id, address, symbol, name, decimals, logo, verified, possible_spam,
                created_at, updated_at
         FROM token_details
         WHERE {}
         ORDER BY verified DESC, symbol ASC
         LIMIT $6 OFFSET $7",
        where_clause
    ))
    .bind(chain_id)
    .bind(pattern.as_deref())
    .bind(exact_address.as_deref())
    .bind(verified)
    .bind(spam)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    let (total,): (i64,) = sqlx::query_as(&format!(
        "SELECT COUNT(*) FROM token_details WHERE {}",
        where_clause
    ))
    .bind(chain_id)
    .bind(pattern.as_deref())
    .bind(exact_address.as_deref())
    .bind(verified)
    .bind(spam)
    .fetch_one(pool)
    .await?;

    Ok((rows, total))
}

// ============================================================
// rpc_provider_health
// ============================================================

pub async fn upsert_provider_health(
    pool: &PgPool,
    chain_id: i64,
    url: &str,
    healthy: bool,
    response_time_ms: i64,
    consecutive_errors: i64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO rpc_provider_health (chain_id, url, healthy, last_check, response_time_ms, consecutive_errors)
         VALUES ($1, $2, $3, NOW(), $4, $5)
         ON CONFLICT (chain_id, url) DO UPDATE
         SET healthy = $3, last_check = NOW(), response_time_ms = $4, consecutive_errors = $5",
    )
    .bind(chain_id)
    .bind(url)
    .bind(healthy)
    .bind(response_time_ms)
    .bind(consecutive_errors)
    .execute(pool)
    .await?;
    Ok(())
}
