//! PostgreSQL ledger

use super::models::*;
use super::Ledger;
use crate::config::DatabaseConfig;
use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info, warn};

const DEPOSIT_COLUMNS: &str = r#"
    source_chain, target_chain, deposit_tx_hash, log_index, token, sender, recipient,
    amount::TEXT AS amount, nonce::TEXT AS nonce, source_block_number, source_block_hash,
    confirmations, status, distribution_tx_hash, failure_reason, created_at, updated_at
"#;

const METADATA_COLUMNS: &str =
    "chain_id, last_block_scanned, required_confirmations, is_active, updated_at";

/// Ledger backed by PostgreSQL
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    /// Connect to the database. Failure here is fatal for the process.
    pub async fn new(config: &DatabaseConfig) -> RelayerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Create tables and indexes if they do not exist
    pub async fn run_migrations(&self) -> RelayerResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS deposits (
                id BIGSERIAL PRIMARY KEY,
                source_chain BIGINT NOT NULL,
                target_chain BIGINT NOT NULL,
                deposit_tx_hash VARCHAR(66) NOT NULL,
                log_index BIGINT NOT NULL,
                token VARCHAR(42) NOT NULL,
                sender VARCHAR(42) NOT NULL,
                recipient VARCHAR(42) NOT NULL,
                amount NUMERIC(78, 0) NOT NULL,
                nonce NUMERIC(78, 0) NOT NULL,
                source_block_number BIGINT NOT NULL,
                source_block_hash VARCHAR(66) NOT NULL,
                confirmations BIGINT NOT NULL DEFAULT 0,
                status VARCHAR(20) NOT NULL,
                distribution_tx_hash VARCHAR(66),
                failure_reason TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                CONSTRAINT deposits_source_nonce_key UNIQUE (source_chain, nonce)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_deposits_status ON deposits (status)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_deposits_source_tx
            ON deposits (source_chain, deposit_tx_hash)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chain_metadata (
                chain_id BIGINT PRIMARY KEY,
                last_block_scanned BIGINT,
                required_confirmations BIGINT NOT NULL,
                is_active BOOLEAN NOT NULL DEFAULT TRUE,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS supported_tokens (
                chain_id BIGINT NOT NULL,
                token_address VARCHAR(42) NOT NULL,
                symbol VARCHAR(32) NOT NULL,
                decimals SMALLINT NOT NULL,
                PRIMARY KEY (chain_id, token_address)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }
}

fn parse_h256(value: &str) -> RelayerResult<H256> {
    H256::from_str(value).map_err(|e| RelayerError::Internal(format!("bad hash {}: {}", value, e)))
}

fn parse_address(value: &str) -> RelayerResult<Address> {
    Address::from_str(value)
        .map_err(|e| RelayerError::Internal(format!("bad address {}: {}", value, e)))
}

fn parse_u256(value: &str) -> RelayerResult<U256> {
    U256::from_dec_str(value)
        .map_err(|e| RelayerError::Internal(format!("bad integer {}: {}", value, e)))
}

fn hex_string<T: std::fmt::Debug>(value: &T) -> String {
    format!("{:?}", value)
}

fn row_to_deposit(row: &PgRow) -> RelayerResult<Deposit> {
    let distribution_tx_hash: Option<String> = row.try_get("distribution_tx_hash")?;
    let status: String = row.try_get("status")?;

    Ok(Deposit {
        source_chain: row.try_get::<i64, _>("source_chain")? as u64,
        target_chain: row.try_get::<i64, _>("target_chain")? as u64,
        deposit_tx_hash: parse_h256(row.try_get("deposit_tx_hash")?)?,
        log_index: row.try_get::<i64, _>("log_index")? as u64,
        token: parse_address(row.try_get("token")?)?,
        sender: parse_address(row.try_get("sender")?)?,
        recipient: parse_address(row.try_get("recipient")?)?,
        amount: parse_u256(row.try_get("amount")?)?,
        nonce: parse_u256(row.try_get("nonce")?)?,
        source_block_number: row.try_get::<i64, _>("source_block_number")? as u64,
        source_block_hash: parse_h256(row.try_get("source_block_hash")?)?,
        confirmations: row.try_get::<i64, _>("confirmations")? as u64,
        status: status.parse()?,
        distribution_tx_hash: distribution_tx_hash
            .as_deref()
            .map(parse_h256)
            .transpose()?,
        failure_reason: row.try_get("failure_reason")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

fn row_to_metadata(row: &PgRow) -> RelayerResult<ChainMetadata> {
    Ok(ChainMetadata {
        chain_id: row.try_get::<i64, _>("chain_id")? as u64,
        last_block_scanned: row
            .try_get::<Option<i64>, _>("last_block_scanned")?
            .map(|b| b as u64),
        required_confirmations: row.try_get::<i64, _>("required_confirmations")? as u64,
        is_active: row.try_get("is_active")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl Ledger for PgLedger {
    async fn record_deposit(&self, deposit: &NewDeposit) -> RelayerResult<RecordOutcome> {
        let sql = format!(
            r#"
            INSERT INTO deposits
                (source_chain, target_chain, deposit_tx_hash, log_index, token, sender,
                 recipient, amount, nonce, source_block_number, source_block_hash, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8::NUMERIC, $9::NUMERIC, $10, $11, 'pending')
            ON CONFLICT (source_chain, nonce) DO NOTHING
            RETURNING {}
            "#,
            DEPOSIT_COLUMNS
        );

        let inserted = sqlx::query(&sql)
            .bind(deposit.source_chain as i64)
            .bind(deposit.target_chain as i64)
            .bind(hex_string(&deposit.deposit_tx_hash))
            .bind(deposit.log_index as i64)
            .bind(hex_string(&deposit.token))
            .bind(hex_string(&deposit.sender))
            .bind(hex_string(&deposit.recipient))
            .bind(deposit.amount.to_string())
            .bind(deposit.nonce.to_string())
            .bind(deposit.source_block_number as i64)
            .bind(hex_string(&deposit.source_block_hash))
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = inserted {
            return Ok(RecordOutcome {
                deposit: row_to_deposit(&row)?,
                created: true,
            });
        }

        let existing = self
            .get_deposit(deposit.source_chain, deposit.nonce)
            .await?
            .ok_or_else(|| RelayerError::DepositNotFound {
                source_chain: deposit.source_chain,
                nonce: deposit.nonce.to_string(),
            })?;

        if existing.deposit_tx_hash != deposit.deposit_tx_hash {
            warn!(
                source_chain = deposit.source_chain,
                nonce = %deposit.nonce,
                stored_tx = ?existing.deposit_tx_hash,
                observed_tx = ?deposit.deposit_tx_hash,
                "Nonce already recorded under a different transaction"
            );
        }

        Ok(RecordOutcome {
            deposit: existing,
            created: false,
        })
    }

    async fn get_deposit(&self, source_chain: u64, nonce: U256) -> RelayerResult<Option<Deposit>> {
        let sql = format!(
            "SELECT {} FROM deposits WHERE source_chain = $1 AND nonce = $2::NUMERIC",
            DEPOSIT_COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(source_chain as i64)
            .bind(nonce.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_deposit).transpose()
    }

    async fn list_deposits(&self, query: &DepositQuery) -> RelayerResult<Vec<Deposit>> {
        let sql = format!(
            r#"
            SELECT {} FROM deposits
            WHERE ($1::TEXT IS NULL OR status = $1)
              AND ($2::BIGINT IS NULL OR source_chain = $2)
            ORDER BY source_chain, nonce
            LIMIT $3
            "#,
            DEPOSIT_COLUMNS
        );

        let rows = sqlx::query(&sql)
            .bind(query.status.map(|s| s.as_str()))
            .bind(query.source_chain.map(|c| c as i64))
            .bind(query.limit())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_deposit).collect()
    }

    async fn list_unfinished(&self) -> RelayerResult<Vec<Deposit>> {
        let sql = format!(
            r#"
            SELECT {} FROM deposits
            WHERE status IN ('pending', 'confirmed', 'distributing')
            ORDER BY source_chain, target_chain, nonce
            "#,
            DEPOSIT_COLUMNS
        );

        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_deposit).collect()
    }

    async fn lowest_open_nonce(
        &self,
        source_chain: u64,
        target_chain: u64,
    ) -> RelayerResult<Option<U256>> {
        let row = sqlx::query(
            r#"
            SELECT MIN(nonce)::TEXT AS nonce FROM deposits
            WHERE source_chain = $1 AND target_chain = $2
              AND status IN ('pending', 'confirmed', 'distributing')
            "#,
        )
        .bind(source_chain as i64)
        .bind(target_chain as i64)
        .fetch_one(&self.pool)
        .await?;

        let nonce: Option<String> = row.try_get("nonce")?;
        nonce.map(|n| parse_u256(&n)).transpose()
    }

    async fn update_confirmations(
        &self,
        source_chain: u64,
        nonce: U256,
        confirmations: u64,
    ) -> RelayerResult<()> {
        sqlx::query(
            r#"
            UPDATE deposits SET confirmations = $3, updated_at = NOW()
            WHERE source_chain = $1 AND nonce = $2::NUMERIC
            "#,
        )
        .bind(source_chain as i64)
        .bind(nonce.to_string())
        .bind(confirmations as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn transition(
        &self,
        source_chain: u64,
        nonce: U256,
        to: DepositStatus,
        update: StatusUpdate,
    ) -> RelayerResult<Deposit> {
        let allowed_from: Vec<String> = DepositStatus::predecessors(to)
            .into_iter()
            .map(|s| s.as_str().to_string())
            .collect();

        // The status guard makes the check and the write a single statement
        let sql = format!(
            r#"
            UPDATE deposits SET
                status = $3,
                distribution_tx_hash = COALESCE($4, distribution_tx_hash),
                failure_reason = COALESCE($5, failure_reason),
                confirmations = COALESCE($6, confirmations),
                updated_at = NOW()
            WHERE source_chain = $1 AND nonce = $2::NUMERIC AND status = ANY($7)
            RETURNING {}
            "#,
            DEPOSIT_COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(source_chain as i64)
            .bind(nonce.to_string())
            .bind(to.as_str())
            .bind(update.distribution_tx_hash.as_ref().map(hex_string))
            .bind(update.failure_reason)
            .bind(update.confirmations.map(|c| c as i64))
            .bind(allowed_from)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                debug!(source_chain, nonce = %nonce, status = %to, "Deposit transitioned");
                row_to_deposit(&row)
            }
            None => match self.get_deposit(source_chain, nonce).await? {
                Some(current) => Err(RelayerError::InvalidStateTransition {
                    from: current.status.to_string(),
                    to: to.to_string(),
                }),
                None => Err(RelayerError::DepositNotFound {
                    source_chain,
                    nonce: nonce.to_string(),
                }),
            },
        }
    }

    async fn record_distribution_tx(
        &self,
        source_chain: u64,
        nonce: U256,
        tx_hash: Option<H256>,
    ) -> RelayerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE deposits SET distribution_tx_hash = $3, updated_at = NOW()
            WHERE source_chain = $1 AND nonce = $2::NUMERIC AND status = 'distributing'
            "#,
        )
        .bind(source_chain as i64)
        .bind(nonce.to_string())
        .bind(tx_hash.as_ref().map(hex_string))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RelayerError::DepositNotFound {
                source_chain,
                nonce: nonce.to_string(),
            });
        }
        Ok(())
    }

    async fn get_chain_metadata(&self, chain_id: u64) -> RelayerResult<Option<ChainMetadata>> {
        let sql = format!(
            "SELECT {} FROM chain_metadata WHERE chain_id = $1",
            METADATA_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(chain_id as i64)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_metadata).transpose()
    }

    async fn list_chain_metadata(&self) -> RelayerResult<Vec<ChainMetadata>> {
        let sql = format!(
            "SELECT {} FROM chain_metadata ORDER BY chain_id",
            METADATA_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_metadata).collect()
    }

    async fn register_chain(
        &self,
        chain_id: u64,
        required_confirmations: u64,
    ) -> RelayerResult<ChainMetadata> {
        let sql = format!(
            r#"
            INSERT INTO chain_metadata (chain_id, last_block_scanned, required_confirmations, is_active)
            VALUES ($1, NULL, $2, TRUE)
            ON CONFLICT (chain_id)
            DO UPDATE SET required_confirmations = EXCLUDED.required_confirmations, updated_at = NOW()
            RETURNING {}
            "#,
            METADATA_COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(chain_id as i64)
            .bind(required_confirmations as i64)
            .fetch_one(&self.pool)
            .await?;

        row_to_metadata(&row)
    }

    async fn advance_cursor(
        &self,
        chain_id: u64,
        scanned_from: Option<u64>,
        block_number: u64,
    ) -> RelayerResult<Option<u64>> {
        // Only the scan that started from the stored cursor may move it
        let row = sqlx::query(
            r#"
            UPDATE chain_metadata
            SET last_block_scanned = GREATEST(COALESCE(last_block_scanned, $3), $3),
                updated_at = NOW()
            WHERE chain_id = $1 AND last_block_scanned IS NOT DISTINCT FROM $2
            RETURNING last_block_scanned
            "#,
        )
        .bind(chain_id as i64)
        .bind(scanned_from.map(|b| b as i64))
        .bind(block_number as i64)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            let stored: i64 = row.try_get("last_block_scanned")?;
            debug!("Saved cursor for chain {}: block {}", chain_id, stored);
            return Ok(Some(stored as u64));
        }

        let meta = self
            .get_chain_metadata(chain_id)
            .await?
            .ok_or(RelayerError::ChainNotFound { chain_id })?;
        Ok(meta.last_block_scanned)
    }

    async fn set_cursor(
        &self,
        chain_id: u64,
        block_number: Option<u64>,
    ) -> RelayerResult<ChainMetadata> {
        let sql = format!(
            r#"
            UPDATE chain_metadata SET last_block_scanned = $2, updated_at = NOW()
            WHERE chain_id = $1
            RETURNING {}
            "#,
            METADATA_COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(chain_id as i64)
            .bind(block_number.map(|b| b as i64))
            .fetch_optional(&self.pool)
            .await?
            .ok_or(RelayerError::ChainNotFound { chain_id })?;

        warn!(chain_id, cursor = ?block_number, "Chain cursor set manually");
        row_to_metadata(&row)
    }

    async fn set_chain_active(&self, chain_id: u64, active: bool) -> RelayerResult<ChainMetadata> {
        let sql = format!(
            r#"
            UPDATE chain_metadata SET is_active = $2, updated_at = NOW()
            WHERE chain_id = $1
            RETURNING {}
            "#,
            METADATA_COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(chain_id as i64)
            .bind(active)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(RelayerError::ChainNotFound { chain_id })?;

        row_to_metadata(&row)
    }

    async fn upsert_supported_token(&self, token: &SupportedToken) -> RelayerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO supported_tokens (chain_id, token_address, symbol, decimals)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (chain_id, token_address)
            DO UPDATE SET symbol = EXCLUDED.symbol, decimals = EXCLUDED.decimals
            "#,
        )
        .bind(token.chain_id as i64)
        .bind(hex_string(&token.token_address))
        .bind(&token.symbol)
        .bind(token.decimals as i16)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_supported_tokens(
        &self,
        chain_id: Option<u64>,
    ) -> RelayerResult<Vec<SupportedToken>> {
        let rows = sqlx::query(
            r#"
            SELECT chain_id, token_address, symbol, decimals FROM supported_tokens
            WHERE ($1::BIGINT IS NULL OR chain_id = $1)
            ORDER BY chain_id, symbol
            "#,
        )
        .bind(chain_id.map(|c| c as i64))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(SupportedToken {
                    chain_id: row.try_get::<i64, _>("chain_id")? as u64,
                    token_address: parse_address(row.try_get("token_address")?)?,
                    symbol: row.try_get("symbol")?,
                    decimals: row.try_get::<i16, _>("decimals")? as u8,
                })
            })
            .collect()
    }

    async fn stats(&self) -> RelayerResult<DepositStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') as pending,
                COUNT(*) FILTER (WHERE status = 'confirmed') as confirmed,
                COUNT(*) FILTER (WHERE status = 'distributing') as distributing,
                COUNT(*) FILTER (WHERE status = 'completed') as completed,
                COUNT(*) FILTER (WHERE status = 'failed') as failed
            FROM deposits
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(DepositStats {
            pending: row.get::<i64, _>("pending") as u64,
            confirmed: row.get::<i64, _>("confirmed") as u64,
            distributing: row.get::<i64, _>("distributing") as u64,
            completed: row.get::<i64, _>("completed") as u64,
            failed: row.get::<i64, _>("failed") as u64,
        })
    }

    async fn health_check(&self) -> RelayerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
