//! Schema management
//!
//! Every statement is idempotent so migrations run on each start. The
//! down-then-up mode wipes the schema and is only allowed before the first
//! block has been committed.

use super::StoreResult;
use crate::error::StoreError;
use sqlx::{PgPool, Row};

const UP: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS core_app_state (
        id SMALLINT PRIMARY KEY DEFAULT 1 CHECK (id = 1),
        block_height BIGINT NOT NULL,
        app_hash BYTEA NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS core_validators (
        id BIGSERIAL PRIMARY KEY,
        eth_address TEXT NOT NULL,
        comet_address TEXT NOT NULL UNIQUE,
        pub_key BYTEA NOT NULL,
        endpoint TEXT NOT NULL,
        node_type TEXT NOT NULL,
        sp_id BIGINT NOT NULL,
        eth_block BIGINT NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS core_validators_eth_address_idx
        ON core_validators (lower(eth_address))",
    "CREATE TABLE IF NOT EXISTS core_jailed_nodes (
        comet_address TEXT PRIMARY KEY,
        jailed_until BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS sla_rollups (
        id BIGSERIAL PRIMARY KEY,
        tx_hash TEXT NOT NULL UNIQUE,
        block_start BIGINT NOT NULL,
        block_end BIGINT NOT NULL,
        block_time BIGINT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS sla_node_reports (
        id BIGSERIAL PRIMARY KEY,
        sla_rollup_id BIGINT NOT NULL REFERENCES sla_rollups (id) ON DELETE CASCADE,
        position INTEGER NOT NULL,
        address TEXT NOT NULL,
        num_blocks_proposed INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS sla_node_reports_rollup_idx
        ON sla_node_reports (sla_rollup_id, position)",
    "CREATE TABLE IF NOT EXISTS sla_node_counters (
        address TEXT PRIMARY KEY,
        num_blocks_proposed INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS core_tx_stats (
        id BIGSERIAL PRIMARY KEY,
        tx_type TEXT NOT NULL,
        tx_hash TEXT NOT NULL,
        block_height BIGINT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS core_tx_stats_height_idx ON core_tx_stats (block_height)",
    "CREATE TABLE IF NOT EXISTS core_transactions (
        tx_hash TEXT PRIMARY KEY,
        block_height BIGINT NOT NULL,
        tx_index INTEGER NOT NULL,
        tx_bytes BYTEA NOT NULL,
        result_code INTEGER NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS core_plays (
        id BIGSERIAL PRIMARY KEY,
        tx_hash TEXT NOT NULL,
        block_height BIGINT NOT NULL,
        user_id TEXT NOT NULL,
        track_id TEXT NOT NULL,
        played_at BIGINT NOT NULL,
        signature TEXT NOT NULL,
        city TEXT NOT NULL,
        region TEXT NOT NULL,
        country TEXT NOT NULL
    )",
];

const DOWN: &[&str] = &[
    "DROP TABLE IF EXISTS core_plays",
    "DROP TABLE IF EXISTS core_transactions",
    "DROP TABLE IF EXISTS core_tx_stats",
    "DROP TABLE IF EXISTS sla_node_counters",
    "DROP TABLE IF EXISTS sla_node_reports",
    "DROP TABLE IF EXISTS sla_rollups",
    "DROP TABLE IF EXISTS core_jailed_nodes",
    "DROP TABLE IF EXISTS core_validators",
    "DROP TABLE IF EXISTS core_app_state",
];

/// Table names created by [`run_migrations`]
pub fn tables() -> impl Iterator<Item = &'static str> {
    DOWN.iter().filter_map(|stmt| stmt.strip_prefix("DROP TABLE IF EXISTS "))
}

/// Bring the schema up to date, optionally dropping it first
pub async fn run_migrations(pool: &PgPool, down_first: bool) -> StoreResult<()> {
    let mut tx = pool.begin().await?;

    if down_first {
        let exists: bool = sqlx::query("SELECT to_regclass('core_app_state') IS NOT NULL AS present")
            .fetch_one(&mut *tx)
            .await?
            .try_get("present")?;
        if exists {
            let rows: i64 = sqlx::query("SELECT count(*) AS committed FROM core_app_state")
                .fetch_one(&mut *tx)
                .await?
                .try_get("committed")?;
            if rows > 0 {
                return Err(StoreError::MigrationRefused(
                    "chain state already committed; down migration only runs at genesis".to_string(),
                ));
            }
        }

        tracing::warn!("Dropping core schema before migrating");
        for stmt in DOWN {
            sqlx::query(stmt).execute(&mut *tx).await?;
        }
    }

    for stmt in UP {
        sqlx::query(stmt).execute(&mut *tx).await?;
    }
    tx.commit().await?;

    tracing::info!(statements = UP.len(), down_first, "Database migrations applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_up_statements_are_idempotent() {
        for stmt in UP {
            assert!(stmt.contains("IF NOT EXISTS"), "{stmt}");
        }
    }

    #[test]
    fn test_down_covers_every_table() {
        let created = UP
            .iter()
            .filter_map(|stmt| stmt.strip_prefix("CREATE TABLE IF NOT EXISTS "))
            .map(|rest| rest.split_whitespace().next().unwrap_or_default())
            .collect::<Vec<_>>();
        let mut dropped = tables().collect::<Vec<_>>();
        dropped.reverse();
        assert_eq!(created, dropped);
    }
}
