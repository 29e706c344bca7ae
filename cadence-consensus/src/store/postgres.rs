//! Postgres store

use super::migrations::run_migrations;
use super::{
    AppStateRow, BlockTx, JailedNode, RegisteredNode, Store, StoreResult, StoredTransaction, TxStat,
};
use crate::error::StoreError;
use async_trait::async_trait;
use cadence_core::{Height, SlaNodeReport, SlaRollup, TrackPlay, TxHash};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};

const SAVEPOINT: &str = "cadence_tx";

/// Store backed by a Postgres connection pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        tracing::info!(max_connections, "Connected to Postgres");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self, down_first: bool) -> StoreResult<()> {
        run_migrations(&self.pool, down_first).await
    }
}

fn to_i64(value: u64, column: &str) -> StoreResult<i64> {
    i64::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column} {value} exceeds BIGINT")))
}

fn to_u64(value: i64, column: &str) -> StoreResult<u64> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative {column}: {value}")))
}

fn node_from_row(row: &PgRow) -> StoreResult<RegisteredNode> {
    Ok(RegisteredNode {
        eth_address: row.try_get("eth_address")?,
        comet_address: row.try_get("comet_address")?,
        pub_key: row.try_get("pub_key")?,
        endpoint: row.try_get("endpoint")?,
        node_type: row.try_get("node_type")?,
        sp_id: to_u64(row.try_get("sp_id")?, "sp_id")?,
        eth_block: to_u64(row.try_get("eth_block")?, "eth_block")?,
    })
}

fn counter_from_row(row: &PgRow) -> StoreResult<SlaNodeReport> {
    Ok(SlaNodeReport {
        address: row.try_get("address")?,
        num_blocks_proposed: row.try_get("num_blocks_proposed")?,
    })
}

const NODE_COLUMNS: &str =
    "eth_address, comet_address, pub_key, endpoint, node_type, sp_id, eth_block";

async fn fetch_app_state(conn: &mut PgConnection) -> StoreResult<Option<AppStateRow>> {
    let row = sqlx::query("SELECT block_height, app_hash FROM core_app_state WHERE id = 1")
        .fetch_optional(conn)
        .await?;
    row.map(|row| {
        Ok(AppStateRow {
            block_height: row.try_get("block_height")?,
            app_hash: row.try_get("app_hash")?,
        })
    })
    .transpose()
}

async fn fetch_node_by_eth(conn: &mut PgConnection, eth_address: &str) -> StoreResult<Option<RegisteredNode>> {
    let row = sqlx::query(&format!(
        "SELECT {NODE_COLUMNS} FROM core_validators WHERE lower(eth_address) = lower($1)"
    ))
    .bind(eth_address)
    .fetch_optional(conn)
    .await?;
    row.as_ref().map(node_from_row).transpose()
}

async fn fetch_latest_rollup(conn: &mut PgConnection) -> StoreResult<Option<SlaRollup>> {
    let Some(row) = sqlx::query(
        "SELECT id, block_start, block_end, block_time FROM sla_rollups ORDER BY block_end DESC, id DESC LIMIT 1",
    )
    .fetch_optional(&mut *conn)
    .await?
    else {
        return Ok(None);
    };

    let id: i64 = row.try_get("id")?;
    let reports = sqlx::query(
        "SELECT address, num_blocks_proposed FROM sla_node_reports WHERE sla_rollup_id = $1 ORDER BY position",
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?
    .iter()
    .map(counter_from_row)
    .collect::<StoreResult<Vec<_>>>()?;

    Ok(Some(SlaRollup {
        block_start: row.try_get("block_start")?,
        block_end: row.try_get("block_end")?,
        timestamp: row.try_get("block_time")?,
        reports,
    }))
}

async fn fetch_counters(conn: &mut PgConnection) -> StoreResult<Vec<SlaNodeReport>> {
    sqlx::query(
        r#"SELECT address, num_blocks_proposed FROM sla_node_counters ORDER BY address COLLATE "C""#,
    )
    .fetch_all(conn)
    .await?
    .iter()
    .map(counter_from_row)
    .collect()
}

#[async_trait]
impl Store for PgStore {
    async fn app_state(&self) -> StoreResult<Option<AppStateRow>> {
        let mut conn = self.pool.acquire().await?;
        fetch_app_state(&mut conn).await
    }

    async fn registered_nodes(&self) -> StoreResult<Vec<RegisteredNode>> {
        sqlx::query(&format!("SELECT {NODE_COLUMNS} FROM core_validators ORDER BY id"))
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(node_from_row)
            .collect()
    }

    async fn node_by_eth_address(&self, eth_address: &str) -> StoreResult<Option<RegisteredNode>> {
        let mut conn = self.pool.acquire().await?;
        fetch_node_by_eth(&mut conn, eth_address).await
    }

    async fn latest_sla_rollup(&self) -> StoreResult<Option<SlaRollup>> {
        let mut conn = self.pool.acquire().await?;
        fetch_latest_rollup(&mut conn).await
    }

    async fn sla_counters(&self) -> StoreResult<Vec<SlaNodeReport>> {
        let mut conn = self.pool.acquire().await?;
        fetch_counters(&mut conn).await
    }

    async fn transaction(&self, tx_hash: &TxHash) -> StoreResult<Option<StoredTransaction>> {
        let row = sqlx::query(
            "SELECT tx_hash, block_height, tx_index, tx_bytes, result_code, created_at
             FROM core_transactions WHERE tx_hash = $1",
        )
        .bind(tx_hash.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let hash: String = row.try_get("tx_hash")?;
            let code: i32 = row.try_get("result_code")?;
            Ok(StoredTransaction {
                tx_hash: TxHash::parse(&hash)
                    .ok_or_else(|| StoreError::Corrupt(format!("tx hash {hash}")))?,
                block_height: row.try_get("block_height")?,
                tx_index: row.try_get("tx_index")?,
                tx_bytes: row.try_get("tx_bytes")?,
                result_code: u32::try_from(code)
                    .map_err(|_| StoreError::Corrupt(format!("result code {code}")))?,
                created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            })
        })
        .transpose()
    }

    async fn jailed_nodes(&self) -> StoreResult<Vec<JailedNode>> {
        sqlx::query("SELECT comet_address, jailed_until FROM core_jailed_nodes ORDER BY comet_address")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|row| {
                Ok(JailedNode {
                    comet_address: row.try_get("comet_address")?,
                    jailed_until: row.try_get("jailed_until")?,
                })
            })
            .collect()
    }

    async fn begin_block(&self) -> StoreResult<Box<dyn BlockTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgBlockTx { tx: Some(tx) }))
    }
}

/// One database transaction per block
///
/// Dropping it without commit rolls back, as does losing the connection.
struct PgBlockTx {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgBlockTx {
    fn conn(&mut self) -> StoreResult<&mut PgConnection> {
        self.tx
            .as_deref_mut()
            .ok_or_else(|| StoreError::Corrupt("block transaction already closed".to_string()))
    }
}

#[async_trait]
impl BlockTx for PgBlockTx {
    async fn savepoint(&mut self) -> StoreResult<()> {
        sqlx::query(&format!("SAVEPOINT {SAVEPOINT}")).execute(self.conn()?).await?;
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self) -> StoreResult<()> {
        sqlx::query(&format!("ROLLBACK TO SAVEPOINT {SAVEPOINT}"))
            .execute(self.conn()?)
            .await?;
        Ok(())
    }

    async fn release_savepoint(&mut self) -> StoreResult<()> {
        sqlx::query(&format!("RELEASE SAVEPOINT {SAVEPOINT}"))
            .execute(self.conn()?)
            .await?;
        Ok(())
    }

    async fn node_by_eth_address(&mut self, eth_address: &str) -> StoreResult<Option<RegisteredNode>> {
        fetch_node_by_eth(self.conn()?, eth_address).await
    }

    async fn node_by_comet_address(&mut self, comet_address: &str) -> StoreResult<Option<RegisteredNode>> {
        let row = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM core_validators WHERE comet_address = $1"
        ))
        .bind(comet_address)
        .fetch_optional(self.conn()?)
        .await?;
        row.as_ref().map(node_from_row).transpose()
    }

    async fn insert_registered_node(&mut self, node: &RegisteredNode) -> StoreResult<()> {
        let sp_id = to_i64(node.sp_id, "sp_id")?;
        let eth_block = to_i64(node.eth_block, "eth_block")?;
        let result = sqlx::query(
            "INSERT INTO core_validators
                (eth_address, comet_address, pub_key, endpoint, node_type, sp_id, eth_block)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&node.eth_address)
        .bind(&node.comet_address)
        .bind(&node.pub_key)
        .bind(&node.endpoint)
        .bind(&node.node_type)
        .bind(sp_id)
        .bind(eth_block)
        .execute(self.conn()?)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(StoreError::Conflict(
                format!("validator {} ({})", node.eth_address, node.comet_address),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn insert_jailed_node(&mut self, node: &JailedNode) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO core_jailed_nodes (comet_address, jailed_until) VALUES ($1, $2)
             ON CONFLICT (comet_address)
             DO UPDATE SET jailed_until = GREATEST(core_jailed_nodes.jailed_until, EXCLUDED.jailed_until)",
        )
        .bind(&node.comet_address)
        .bind(node.jailed_until)
        .execute(self.conn()?)
        .await?;
        Ok(())
    }

    async fn latest_sla_rollup(&mut self) -> StoreResult<Option<SlaRollup>> {
        fetch_latest_rollup(self.conn()?).await
    }

    async fn insert_sla_rollup(&mut self, tx_hash: &TxHash, rollup: &SlaRollup) -> StoreResult<()> {
        let conn = self.conn()?;
        let id: i64 = sqlx::query(
            "INSERT INTO sla_rollups (tx_hash, block_start, block_end, block_time)
             VALUES ($1, $2, $3, $4) RETURNING id",
        )
        .bind(tx_hash.as_str())
        .bind(rollup.block_start)
        .bind(rollup.block_end)
        .bind(rollup.timestamp)
        .fetch_one(&mut *conn)
        .await?
        .try_get("id")?;

        for (position, report) in rollup.reports.iter().enumerate() {
            let position = i32::try_from(position)
                .map_err(|_| StoreError::Corrupt("too many rollup reports".to_string()))?;
            sqlx::query(
                "INSERT INTO sla_node_reports (sla_rollup_id, position, address, num_blocks_proposed)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(id)
            .bind(position)
            .bind(&report.address)
            .bind(report.num_blocks_proposed)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    async fn clear_sla_counters(&mut self) -> StoreResult<()> {
        sqlx::query("DELETE FROM sla_node_counters").execute(self.conn()?).await?;
        Ok(())
    }

    async fn increment_blocks_proposed(&mut self, address: &str) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO sla_node_counters (address, num_blocks_proposed) VALUES ($1, 1)
             ON CONFLICT (address)
             DO UPDATE SET num_blocks_proposed = sla_node_counters.num_blocks_proposed + 1",
        )
        .bind(address)
        .execute(self.conn()?)
        .await?;
        Ok(())
    }

    async fn insert_plays(&mut self, tx_hash: &TxHash, height: Height, plays: &[TrackPlay]) -> StoreResult<()> {
        let conn = self.conn()?;
        for play in plays {
            sqlx::query(
                "INSERT INTO core_plays
                    (tx_hash, block_height, user_id, track_id, played_at, signature, city, region, country)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(tx_hash.as_str())
            .bind(height)
            .bind(&play.user_id)
            .bind(&play.track_id)
            .bind(play.timestamp)
            .bind(&play.signature)
            .bind(&play.city)
            .bind(&play.region)
            .bind(&play.country)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    async fn insert_transaction(&mut self, tx: &StoredTransaction) -> StoreResult<()> {
        let code = i32::try_from(tx.result_code)
            .map_err(|_| StoreError::Corrupt(format!("result code {}", tx.result_code)))?;
        sqlx::query(
            "INSERT INTO core_transactions
                (tx_hash, block_height, tx_index, tx_bytes, result_code, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (tx_hash) DO NOTHING",
        )
        .bind(tx.tx_hash.as_str())
        .bind(tx.block_height)
        .bind(tx.tx_index)
        .bind(&tx.tx_bytes)
        .bind(code)
        .bind(tx.created_at)
        .execute(self.conn()?)
        .await?;
        Ok(())
    }

    async fn insert_tx_stat(&mut self, stat: &TxStat) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO core_tx_stats (tx_type, tx_hash, block_height, created_at)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(stat.tx_type.as_str())
        .bind(stat.tx_hash.as_str())
        .bind(stat.block_height)
        .bind(stat.created_at)
        .execute(self.conn()?)
        .await?;
        Ok(())
    }

    async fn upsert_app_state(&mut self, state: &AppStateRow) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO core_app_state (id, block_height, app_hash, updated_at)
             VALUES (1, $1, $2, now())
             ON CONFLICT (id)
             DO UPDATE SET block_height = EXCLUDED.block_height,
                           app_hash = EXCLUDED.app_hash,
                           updated_at = EXCLUDED.updated_at",
        )
        .bind(state.block_height)
        .bind(&state.app_hash)
        .execute(self.conn()?)
        .await?;
        Ok(())
    }

    async fn commit(&mut self) -> StoreResult<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| StoreError::Corrupt("block transaction already closed".to_string()))?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsigned_column_conversion() {
        assert_eq!(to_i64(42, "sp_id").unwrap(), 42);
        assert!(to_i64(u64::MAX, "sp_id").is_err());
        assert_eq!(to_u64(7, "eth_block").unwrap(), 7);
        assert!(to_u64(-1, "eth_block").is_err());
    }
}
