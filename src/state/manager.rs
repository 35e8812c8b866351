//! PostgreSQL state manager

use super::store::TransferStore;
use crate::config::{ChainConfig, DatabaseConfig};
use crate::error::{RelayerError, RelayerResult};
use crate::types::{
    normalize_address, Amount, AuditEntry, Checkpoint, EventKind, Signature, SupportedToken,
    Transfer, TransferStats, TransferStatus, ValidatorSet,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};

const TRANSFER_COLUMNS: &str = r#"
    id, kind, source_chain, destination_chain, token, amount::TEXT AS amount, sender,
    recipient, nonce, status, status_reason, source_tx_hash, destination_tx_hash,
    block_number, block_hash, confirmations, fee::TEXT AS fee, created_at, updated_at,
    status_changed_at
"#;

/// State manager for PostgreSQL persistence
pub struct StateManager {
    pool: PgPool,
}

impl StateManager {
    /// Create a new state manager
    pub async fn new(config: &DatabaseConfig) -> RelayerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> RelayerResult<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS transfers (
                id VARCHAR(66) PRIMARY KEY,
                kind VARCHAR(10) NOT NULL CHECK (kind IN ('lock', 'burn')),
                source_chain BIGINT NOT NULL,
                destination_chain BIGINT NOT NULL,
                token VARCHAR(128) NOT NULL,
                amount NUMERIC(78, 0) NOT NULL CHECK (amount > 0),
                sender VARCHAR(128) NOT NULL,
                recipient VARCHAR(128) NOT NULL,
                nonce BIGINT NOT NULL,
                status VARCHAR(20) NOT NULL CHECK (status IN (
                    'pending', 'confirming', 'signed', 'executing',
                    'completed', 'failed', 'under_review'
                )),
                status_reason TEXT,
                source_tx_hash VARCHAR(128) NOT NULL,
                destination_tx_hash VARCHAR(128),
                block_number BIGINT NOT NULL,
                block_hash VARCHAR(128) NOT NULL,
                confirmations BIGINT NOT NULL DEFAULT 0,
                fee NUMERIC(78, 0) NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                status_changed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                CHECK (source_chain <> destination_chain)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_transfers_status ON transfers (status)",
            "CREATE INDEX IF NOT EXISTS idx_transfers_source_block ON transfers (source_chain, block_number)",
            "CREATE INDEX IF NOT EXISTS idx_transfers_destination ON transfers (destination_chain)",
            r#"
            CREATE TABLE IF NOT EXISTS signatures (
                id BIGSERIAL PRIMARY KEY,
                transfer_id VARCHAR(66) NOT NULL REFERENCES transfers (id),
                relayer_address VARCHAR(42) NOT NULL,
                signature BYTEA NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (transfer_id, relayer_address)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS transfer_audit (
                id BIGSERIAL PRIMARY KEY,
                transfer_id VARCHAR(66) NOT NULL,
                from_status VARCHAR(20),
                to_status VARCHAR(20),
                error_kind VARCHAR(20),
                reason TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_audit_transfer ON transfer_audit (transfer_id, id)",
            r#"
            CREATE TABLE IF NOT EXISTS supported_tokens (
                chain_id BIGINT NOT NULL,
                token_address VARCHAR(128) NOT NULL,
                name VARCHAR(64) NOT NULL,
                symbol VARCHAR(16) NOT NULL,
                decimals SMALLINT NOT NULL CHECK (decimals BETWEEN 0 AND 18),
                is_native BOOLEAN NOT NULL DEFAULT FALSE,
                enabled BOOLEAN NOT NULL DEFAULT TRUE,
                min_amount NUMERIC(78, 0),
                max_amount NUMERIC(78, 0),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (chain_id, token_address)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS chain_config (
                chain_id BIGINT PRIMARY KEY,
                name VARCHAR(64) NOT NULL,
                family VARCHAR(10) NOT NULL,
                bridge_contract VARCHAR(128) NOT NULL,
                required_confirmations BIGINT NOT NULL,
                block_time_ms BIGINT NOT NULL,
                enabled BOOLEAN NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS chain_checkpoints (
                chain_id BIGINT PRIMARY KEY,
                block_number BIGINT NOT NULL,
                block_hash VARCHAR(128) NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS validator_sets (
                version BIGINT PRIMARY KEY,
                relayers TEXT[] NOT NULL,
                threshold INT NOT NULL CHECK (threshold > 0),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        info!("Database migrations complete");
        Ok(())
    }

    async fn insert_audit<'e, E>(executor: E, entry: &AuditEntry) -> RelayerResult<()>
    where
        E: sqlx::Executor<'e, Database = sqlx::Postgres>,
    {
        sqlx::query(
            r#"
            INSERT INTO transfer_audit (transfer_id, from_status, to_status, error_kind, reason, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&entry.transfer_id)
        .bind(entry.from_status.map(|s| s.as_str()))
        .bind(entry.to_status.map(|s| s.as_str()))
        .bind(entry.error_kind.as_deref())
        .bind(&entry.reason)
        .bind(entry.created_at)
        .execute(executor)
        .await?;
        Ok(())
    }

    async fn current_status(&self, id: &str) -> RelayerResult<Option<TransferStatus>> {
        let row = sqlx::query("SELECT status FROM transfers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| r.get::<String, _>("status").parse()).transpose()
    }
}

fn parse_amount(raw: String) -> RelayerResult<Amount> {
    raw.parse()
        .map_err(|e| RelayerError::Internal(format!("stored amount {}: {}", raw, e)))
}

fn transfer_from_row(row: &PgRow) -> RelayerResult<Transfer> {
    let kind: String = row.get("kind");
    let status: String = row.get("status");

    Ok(Transfer {
        id: row.get("id"),
        kind: kind.parse::<EventKind>()?,
        source_chain: row.get::<i64, _>("source_chain") as u64,
        destination_chain: row.get::<i64, _>("destination_chain") as u64,
        token: row.get("token"),
        amount: parse_amount(row.get("amount"))?,
        sender: row.get("sender"),
        recipient: row.get("recipient"),
        nonce: row.get::<i64, _>("nonce") as u64,
        status: status.parse()?,
        status_reason: row.get("status_reason"),
        source_tx_hash: row.get("source_tx_hash"),
        destination_tx_hash: row.get("destination_tx_hash"),
        block_number: row.get::<i64, _>("block_number") as u64,
        block_hash: row.get("block_hash"),
        confirmations: row.get::<i64, _>("confirmations") as u64,
        fee: parse_amount(row.get("fee"))?,
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
        status_changed_at: row.get::<DateTime<Utc>, _>("status_changed_at"),
    })
}

fn signature_from_row(row: &PgRow) -> Signature {
    Signature {
        transfer_id: row.get("transfer_id"),
        relayer_address: row.get("relayer_address"),
        signature: row.get("signature"),
        created_at: row.get("created_at"),
    }
}

fn token_from_row(row: &PgRow) -> RelayerResult<SupportedToken> {
    let bound = |column: &str| -> RelayerResult<Option<Amount>> {
        row.get::<Option<String>, _>(column).map(parse_amount).transpose()
    };
    Ok(SupportedToken {
        chain_id: row.get::<i64, _>("chain_id") as u64,
        token_address: row.get("token_address"),
        name: row.get("name"),
        symbol: row.get("symbol"),
        decimals: row.get::<i16, _>("decimals") as u8,
        is_native: row.get("is_native"),
        enabled: row.get("enabled"),
        min_amount: bound("min_amount")?,
        max_amount: bound("max_amount")?,
    })
}

#[async_trait]
impl TransferStore for StateManager {
    async fn health_check(&self) -> RelayerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn record_transfer(&self, transfer: &Transfer) -> RelayerResult<()> {
        transfer.validate()?;
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO transfers (
                id, kind, source_chain, destination_chain, token, amount, sender, recipient,
                nonce, status, status_reason, source_tx_hash, destination_tx_hash, block_number,
                block_hash, confirmations, fee, created_at, updated_at, status_changed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6::NUMERIC, $7, $8, $9, $10, $11, $12, $13, $14,
                    $15, $16, $17::NUMERIC, $18, $19, $20)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&transfer.id)
        .bind(transfer.kind.as_str())
        .bind(transfer.source_chain as i64)
        .bind(transfer.destination_chain as i64)
        .bind(&transfer.token)
        .bind(transfer.amount.to_string())
        .bind(&transfer.sender)
        .bind(&transfer.recipient)
        .bind(transfer.nonce as i64)
        .bind(transfer.status.as_str())
        .bind(transfer.status_reason.as_deref())
        .bind(&transfer.source_tx_hash)
        .bind(transfer.destination_tx_hash.as_deref())
        .bind(transfer.block_number as i64)
        .bind(&transfer.block_hash)
        .bind(transfer.confirmations as i64)
        .bind(transfer.fee.to_string())
        .bind(transfer.created_at)
        .bind(transfer.updated_at)
        .bind(transfer.status_changed_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            return Err(RelayerError::DuplicateTransfer {
                transfer_id: transfer.id.clone(),
            });
        }

        let entry = AuditEntry::transition(&transfer.id, None, transfer.status, "transfer recorded");
        Self::insert_audit(&mut *tx, &entry).await?;
        tx.commit().await?;

        debug!("Recorded transfer {}", transfer.id);
        Ok(())
    }

    async fn get_transfer(&self, id: &str) -> RelayerResult<Option<Transfer>> {
        let query = format!("SELECT {} FROM transfers WHERE id = $1", TRANSFER_COLUMNS);
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(transfer_from_row).transpose()
    }

    async fn transition(
        &self,
        id: &str,
        from: TransferStatus,
        to: TransferStatus,
        reason: Option<&str>,
    ) -> RelayerResult<bool> {
        if !from.can_transition_to(to) {
            return Err(RelayerError::InvalidStateTransition {
                transfer_id: id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE transfers
            SET status = $3, status_reason = $4, status_changed_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(reason)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return match self.current_status(id).await? {
                Some(_) => Ok(false),
                None => Err(RelayerError::TransferNotFound {
                    transfer_id: id.to_string(),
                }),
            };
        }

        let entry = AuditEntry::transition(id, Some(from), to, reason.unwrap_or_default());
        Self::insert_audit(&mut *tx, &entry).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn mark_transfer_complete(
        &self,
        id: &str,
        destination_tx_hash: Option<&str>,
    ) -> RelayerResult<bool> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE transfers
            SET status = 'completed',
                destination_tx_hash = COALESCE($2, destination_tx_hash),
                status_reason = NULL,
                status_changed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'executing'
            "#,
        )
        .bind(id)
        .bind(destination_tx_hash)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return match self.current_status(id).await? {
                Some(_) => Ok(false),
                None => Err(RelayerError::TransferNotFound {
                    transfer_id: id.to_string(),
                }),
            };
        }

        let entry = AuditEntry::transition(
            id,
            Some(TransferStatus::Executing),
            TransferStatus::Completed,
            destination_tx_hash.unwrap_or_default(),
        );
        Self::insert_audit(&mut *tx, &entry).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn set_destination_tx(&self, id: &str, tx_hash: &str) -> RelayerResult<()> {
        let updated = sqlx::query(
            "UPDATE transfers SET destination_tx_hash = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(tx_hash)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(RelayerError::TransferNotFound {
                transfer_id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn clear_destination_tx(&self, id: &str) -> RelayerResult<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE transfers SET destination_tx_hash = NULL, updated_at = NOW()
            WHERE id = $1 AND status IN ($2, $3)
            "#,
        )
        .bind(id)
        .bind(TransferStatus::Executing.as_str())
        .bind(TransferStatus::UnderReview.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 && self.current_status(id).await?.is_none() {
            return Err(RelayerError::TransferNotFound {
                transfer_id: id.to_string(),
            });
        }
        Ok(updated > 0)
    }

    async fn update_confirmations(&self, id: &str, confirmations: u64) -> RelayerResult<()> {
        sqlx::query("UPDATE transfers SET confirmations = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(confirmations as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn is_transfer_processed(&self, id: &str) -> RelayerResult<bool> {
        Ok(matches!(
            self.current_status(id).await?,
            Some(status) if status.is_terminal()
        ))
    }

    async fn get_transfers_by_status(
        &self,
        status: TransferStatus,
        limit: usize,
    ) -> RelayerResult<Vec<Transfer>> {
        let query = format!(
            "SELECT {} FROM transfers WHERE status = $1 ORDER BY created_at ASC LIMIT $2",
            TRANSFER_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(status.as_str())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(transfer_from_row).collect()
    }

    async fn get_transfers_in_block_range(
        &self,
        chain_id: u64,
        from_block: u64,
        to_block: u64,
    ) -> RelayerResult<Vec<Transfer>> {
        let query = format!(
            r#"
            SELECT {} FROM transfers
            WHERE source_chain = $1 AND block_number BETWEEN $2 AND $3
            ORDER BY block_number ASC
            "#,
            TRANSFER_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(chain_id as i64)
            .bind(from_block as i64)
            .bind(to_block as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(transfer_from_row).collect()
    }

    async fn list_transfers(&self, offset: usize, limit: usize) -> RelayerResult<Vec<Transfer>> {
        let query = format!(
            "SELECT {} FROM transfers ORDER BY created_at DESC OFFSET $1 LIMIT $2",
            TRANSFER_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(offset as i64)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(transfer_from_row).collect()
    }

    async fn get_stats(&self) -> RelayerResult<TransferStats> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM transfers GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = TransferStats::default();
        for row in rows {
            let status: TransferStatus = row.get::<String, _>("status").parse()?;
            stats.add(status, row.get::<i64, _>("count") as u64);
        }
        Ok(stats)
    }

    async fn add_signature(&self, signature: &Signature) -> RelayerResult<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO signatures (transfer_id, relayer_address, signature, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (transfer_id, relayer_address) DO NOTHING
            "#,
        )
        .bind(&signature.transfer_id)
        .bind(normalize_address(&signature.relayer_address))
        .bind(&signature.signature)
        .bind(signature.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                RelayerError::TransferNotFound {
                    transfer_id: signature.transfer_id.clone(),
                }
            }
            other => RelayerError::Database(other),
        })?
        .rows_affected();

        Ok(inserted == 1)
    }

    async fn get_signatures(&self, transfer_id: &str) -> RelayerResult<Vec<Signature>> {
        let rows = sqlx::query(
            r#"
            SELECT transfer_id, relayer_address, signature, created_at
            FROM signatures WHERE transfer_id = $1
            ORDER BY relayer_address ASC
            "#,
        )
        .bind(transfer_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(signature_from_row).collect())
    }

    async fn signature_count(&self, transfer_id: &str) -> RelayerResult<usize> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM signatures WHERE transfer_id = $1")
            .bind(transfer_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("count") as usize)
    }

    async fn has_signed(&self, transfer_id: &str, relayer_address: &str) -> RelayerResult<bool> {
        let row = sqlx::query(
            "SELECT 1 AS present FROM signatures WHERE transfer_id = $1 AND relayer_address = $2",
        )
        .bind(transfer_id)
        .bind(normalize_address(relayer_address))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn append_audit(&self, entry: &AuditEntry) -> RelayerResult<()> {
        Self::insert_audit(&self.pool, entry).await
    }

    async fn get_audit_trail(&self, transfer_id: &str) -> RelayerResult<Vec<AuditEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT transfer_id, from_status, to_status, error_kind, reason, created_at
            FROM transfer_audit WHERE transfer_id = $1 ORDER BY id ASC
            "#,
        )
        .bind(transfer_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let status = |column: &str| -> RelayerResult<Option<TransferStatus>> {
                    row.get::<Option<String>, _>(column)
                        .map(|s| s.parse())
                        .transpose()
                };
                Ok(AuditEntry {
                    transfer_id: row.get("transfer_id"),
                    from_status: status("from_status")?,
                    to_status: status("to_status")?,
                    error_kind: row.get("error_kind"),
                    reason: row.get("reason"),
                    created_at: row.get("created_at"),
                })
            })
            .collect()
    }

    async fn get_checkpoint(&self, chain_id: u64) -> RelayerResult<Option<Checkpoint>> {
        let row = sqlx::query(
            "SELECT block_number, block_hash FROM chain_checkpoints WHERE chain_id = $1",
        )
        .bind(chain_id as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Checkpoint {
            chain_id,
            block_number: r.get::<i64, _>("block_number") as u64,
            block_hash: r.get("block_hash"),
        }))
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> RelayerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chain_checkpoints (chain_id, block_number, block_hash, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (chain_id)
            DO UPDATE SET block_number = $2, block_hash = $3, updated_at = NOW()
            "#,
        )
        .bind(checkpoint.chain_id as i64)
        .bind(checkpoint.block_number as i64)
        .bind(&checkpoint.block_hash)
        .execute(&self.pool)
        .await?;

        debug!(
            "Saved checkpoint for chain {}: block {}",
            checkpoint.chain_id, checkpoint.block_number
        );
        Ok(())
    }

    async fn upsert_token(&self, token: &SupportedToken) -> RelayerResult<()> {
        token.validate()?;
        sqlx::query(
            r#"
            INSERT INTO supported_tokens
                (chain_id, token_address, name, symbol, decimals, is_native, enabled, min_amount, max_amount)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8::NUMERIC, $9::NUMERIC)
            ON CONFLICT (chain_id, token_address)
            DO UPDATE SET name = $3, symbol = $4, decimals = $5, is_native = $6, enabled = $7,
                          min_amount = $8::NUMERIC, max_amount = $9::NUMERIC, updated_at = NOW()
            "#,
        )
        .bind(token.chain_id as i64)
        .bind(normalize_address(&token.token_address))
        .bind(&token.name)
        .bind(&token.symbol)
        .bind(token.decimals as i16)
        .bind(token.is_native)
        .bind(token.enabled)
        .bind(token.min_amount.map(|a| a.to_string()))
        .bind(token.max_amount.map(|a| a.to_string()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_token(&self, chain_id: u64, token_address: &str) -> RelayerResult<Option<SupportedToken>> {
        let row = sqlx::query(
            r#"
            SELECT chain_id, token_address, name, symbol, decimals, is_native, enabled,
                   min_amount::TEXT AS min_amount, max_amount::TEXT AS max_amount
            FROM supported_tokens WHERE chain_id = $1 AND token_address = $2
            "#,
        )
        .bind(chain_id as i64)
        .bind(normalize_address(token_address))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(token_from_row).transpose()
    }

    async fn list_tokens(&self) -> RelayerResult<Vec<SupportedToken>> {
        let rows = sqlx::query(
            r#"
            SELECT chain_id, token_address, name, symbol, decimals, is_native, enabled,
                   min_amount::TEXT AS min_amount, max_amount::TEXT AS max_amount
            FROM supported_tokens ORDER BY chain_id, token_address
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(token_from_row).collect()
    }

    async fn save_validator_set(&self, set: &ValidatorSet) -> RelayerResult<()> {
        set.validate()?;
        let relayers: Vec<String> = set.relayers.iter().cloned().collect();
        let inserted = sqlx::query(
            r#"
            INSERT INTO validator_sets (version, relayers, threshold, updated_at)
            SELECT $1, $2, $3, $4
            WHERE NOT EXISTS (SELECT 1 FROM validator_sets WHERE version >= $1)
            "#,
        )
        .bind(set.version as i64)
        .bind(&relayers)
        .bind(set.threshold as i32)
        .bind(set.updated_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 0 {
            return Err(RelayerError::Validation(format!(
                "validator set version {} is not newer than the stored set",
                set.version
            )));
        }
        Ok(())
    }

    async fn latest_validator_set(&self) -> RelayerResult<Option<ValidatorSet>> {
        let row = sqlx::query(
            "SELECT version, relayers, threshold, updated_at FROM validator_sets ORDER BY version DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| {
            let relayers: Vec<String> = r.get("relayers");
            let mut set = ValidatorSet::new(
                relayers,
                r.get::<i32, _>("threshold") as usize,
                r.get::<i64, _>("version") as u64,
            );
            set.updated_at = r.get("updated_at");
            set
        }))
    }

    async fn upsert_chain_config(&self, config: &ChainConfig) -> RelayerResult<()> {
        let family = match config.family {
            crate::types::ChainFamily::Evm => "evm",
            crate::types::ChainFamily::Cosmos => "cosmos",
        };
        sqlx::query(
            r#"
            INSERT INTO chain_config
                (chain_id, name, family, bridge_contract, required_confirmations, block_time_ms, enabled)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (chain_id)
            DO UPDATE SET name = $2, family = $3, bridge_contract = $4,
                          required_confirmations = $5, block_time_ms = $6, enabled = $7,
                          updated_at = NOW()
            "#,
        )
        .bind(config.chain_id as i64)
        .bind(&config.name)
        .bind(family)
        .bind(&config.bridge_contract)
        .bind(config.required_confirmations as i64)
        .bind(config.block_time_ms as i64)
        .bind(config.enabled)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
