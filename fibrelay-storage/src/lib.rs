use std::str::FromStr;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fibrelay_core::{
    Chain, ChainStatus, EventKind, Hop, HopStatus, LogEntry, Network, TipMarker,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

/// Storage-layer trait for relay chains, mirroring `dxid-storage`'s
/// `BlockStore`/`StateStore` split of one `#[async_trait]` per concern over
/// a single pool-backed struct.
#[async_trait]
pub trait ChainStore: Send + Sync {
    async fn insert_chain(&self, chain: &NewChain) -> Result<Chain>;
    async fn get_chain(&self, id: i64) -> Result<Option<Chain>>;
    async fn list_chains(&self, network: Option<Network>) -> Result<Vec<Chain>>;
    async fn list_active_chains(&self, network: Network) -> Result<Vec<Chain>>;
    async fn set_chain_status(&self, id: i64, status: ChainStatus, error_message: Option<&str>) -> Result<()>;
    async fn mark_chain_started(&self, id: i64) -> Result<()>;
    async fn mark_chain_completed(&self, id: i64, amount_sent_sats: u64) -> Result<()>;
    async fn advance_chain_hop(&self, id: i64, current_hop: u32, total_fees_sats: u64) -> Result<()>;
    async fn set_chain_received(&self, id: i64, amount_sats: u64) -> Result<()>;
}

#[async_trait]
pub trait HopStore: Send + Sync {
    async fn insert_hops(&self, chain_id: i64, hops: &[NewHop]) -> Result<Vec<Hop>>;
    async fn get_hop(&self, id: i64) -> Result<Option<Hop>>;
    async fn list_hops(&self, chain_id: i64) -> Result<Vec<Hop>>;
    async fn get_hop_by_number(&self, chain_id: i64, hop_number: u32) -> Result<Option<Hop>>;
    async fn set_hop_funded(
        &self,
        id: i64,
        incoming_txid: &str,
        incoming_amount_sats: u64,
        confirmed_at_block: u64,
        relay_at_block: u64,
    ) -> Result<()>;
    async fn set_hop_pending_relay(&self, id: i64) -> Result<()>;
    async fn set_hop_relayed(
        &self,
        id: i64,
        outgoing_txid: &str,
        outgoing_amount_sats: u64,
        outgoing_fee_sats: u64,
    ) -> Result<()>;
    async fn set_hop_failed(&self, id: i64) -> Result<()>;
    /// Defensive catch-all used by chain completion: mark a hop `relayed`
    /// without outgoing tx metadata, for hops whose funds moved on without
    /// ever being swept by this engine (e.g. a manually imported key).
    async fn force_hop_relayed(&self, id: i64) -> Result<()>;
    /// Hops ready to be swept: funded (or pending_relay, for resumption after
    /// a crash) on `network`, whose `relay_at_block` has passed `tip_height`.
    async fn hops_pending_relay(&self, network: Network, tip_height: u64) -> Result<Vec<Hop>>;
}

#[async_trait]
pub trait LogStore: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn append(
        &self,
        chain_id: i64,
        hop_id: Option<i64>,
        event: EventKind,
        txid: Option<&str>,
        amount_sats: Option<u64>,
        fee_sats: Option<u64>,
        block_height: Option<u64>,
        details: Option<&str>,
    ) -> Result<()>;
    async fn list_for_chain(&self, chain_id: i64) -> Result<Vec<LogEntry>>;
}

#[async_trait]
pub trait TipStore: Send + Sync {
    async fn get_tip(&self, network: Network) -> Result<Option<TipMarker>>;
    async fn set_tip(&self, network: Network, height: u64, hash: Option<&str>) -> Result<()>;
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get_setting(&self, key: &str) -> Result<Option<String>>;
    async fn set_setting(&self, key: &str, value: &str) -> Result<()>;
}

/// Fields needed to persist a brand new chain; split from `Chain` because
/// several columns (id, timestamps, progress counters) are assigned by the
/// store, not the caller.
pub struct NewChain {
    pub name: String,
    pub network: Network,
    pub intake_address: String,
    pub intake_privkey_encrypted: String,
    pub final_address: String,
    pub final_is_generated: bool,
    pub final_privkey_encrypted: Option<String>,
    pub total_hops: u32,
}

pub struct NewHop {
    pub hop_number: u32,
    pub address: String,
    pub privkey_encrypted: String,
    pub delay_blocks: u64,
}

/// The Store: a `sqlx::SqlitePool` plus the schema migration. One struct
/// implementing every storage trait, matching `dxid-storage`'s `PgStore`.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self> {
        // An in-memory SQLite database is private to the connection that
        // opened it; a pool of more than one connection would hand back
        // fresh, unmigrated databases to anyone but the first caller. Only
        // file-backed databases benefit from a real connection pool.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let mut options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        if !database_url.contains(":memory:") {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS relay_chains (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                network TEXT NOT NULL CHECK (network IN ('testnet', 'mainnet')),
                status TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'active', 'completed', 'failed', 'cancelled')),
                intake_address TEXT NOT NULL,
                intake_privkey_encrypted TEXT NOT NULL,
                final_address TEXT NOT NULL,
                final_is_generated INTEGER NOT NULL DEFAULT 0,
                final_privkey_encrypted TEXT,
                total_hops INTEGER NOT NULL,
                current_hop INTEGER NOT NULL DEFAULT 0,
                amount_received_sats INTEGER,
                amount_sent_sats INTEGER,
                total_fees_sats INTEGER NOT NULL DEFAULT 0,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                started_at TIMESTAMP,
                completed_at TIMESTAMP,
                error_message TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS relay_hops (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chain_id INTEGER NOT NULL REFERENCES relay_chains(id) ON DELETE CASCADE,
                hop_number INTEGER NOT NULL,
                address TEXT NOT NULL,
                privkey_encrypted TEXT NOT NULL,
                delay_blocks INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'waiting'
                    CHECK (status IN ('waiting', 'funded', 'pending_relay', 'relayed', 'failed')),
                incoming_txid TEXT,
                incoming_amount_sats INTEGER,
                incoming_confirmed_at_block INTEGER,
                outgoing_txid TEXT,
                outgoing_amount_sats INTEGER,
                outgoing_fee_sats INTEGER,
                relay_at_block INTEGER,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                funded_at TIMESTAMP,
                relayed_at TIMESTAMP,
                UNIQUE(chain_id, hop_number)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transaction_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chain_id INTEGER NOT NULL REFERENCES relay_chains(id) ON DELETE CASCADE,
                hop_id INTEGER REFERENCES relay_hops(id) ON DELETE CASCADE,
                event_type TEXT NOT NULL,
                txid TEXT,
                amount_sats INTEGER,
                fee_sats INTEGER,
                block_height INTEGER,
                details TEXT,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS block_tracker (
                network TEXT PRIMARY KEY,
                last_height INTEGER NOT NULL,
                last_hash TEXT,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chains_status ON relay_chains(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chains_network ON relay_chains(network)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_hops_chain ON relay_hops(chain_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_hops_status ON relay_hops(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_log_chain ON transaction_log(chain_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    fn row_to_chain(row: &sqlx::sqlite::SqliteRow) -> Result<Chain> {
        let network: String = row.try_get("network")?;
        let status: String = row.try_get("status")?;
        Ok(Chain {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            network: network.parse().map_err(|e| anyhow!("{e}"))?,
            status: status.parse().map_err(|e| anyhow!("{e}"))?,
            intake_address: row.try_get("intake_address")?,
            intake_privkey_encrypted: row.try_get("intake_privkey_encrypted")?,
            final_address: row.try_get("final_address")?,
            final_is_generated: row.try_get::<i64, _>("final_is_generated")? != 0,
            final_privkey_encrypted: row.try_get("final_privkey_encrypted")?,
            total_hops: row.try_get::<i64, _>("total_hops")? as u32,
            current_hop: row.try_get::<i64, _>("current_hop")? as u32,
            amount_received_sats: row.try_get::<Option<i64>, _>("amount_received_sats")?.map(|v| v as u64),
            amount_sent_sats: row.try_get::<Option<i64>, _>("amount_sent_sats")?.map(|v| v as u64),
            total_fees_sats: row.try_get::<i64, _>("total_fees_sats")? as u64,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            error_message: row.try_get("error_message")?,
        })
    }

    fn row_to_hop(row: &sqlx::sqlite::SqliteRow) -> Result<Hop> {
        let status: String = row.try_get("status")?;
        Ok(Hop {
            id: row.try_get("id")?,
            chain_id: row.try_get("chain_id")?,
            hop_number: row.try_get::<i64, _>("hop_number")? as u32,
            address: row.try_get("address")?,
            privkey_encrypted: row.try_get("privkey_encrypted")?,
            delay_blocks: row.try_get::<i64, _>("delay_blocks")? as u64,
            status: status.parse().map_err(|e| anyhow!("{e}"))?,
            incoming_txid: row.try_get("incoming_txid")?,
            incoming_amount_sats: row.try_get::<Option<i64>, _>("incoming_amount_sats")?.map(|v| v as u64),
            incoming_confirmed_at_block: row
                .try_get::<Option<i64>, _>("incoming_confirmed_at_block")?
                .map(|v| v as u64),
            outgoing_txid: row.try_get("outgoing_txid")?,
            outgoing_amount_sats: row.try_get::<Option<i64>, _>("outgoing_amount_sats")?.map(|v| v as u64),
            outgoing_fee_sats: row.try_get::<Option<i64>, _>("outgoing_fee_sats")?.map(|v| v as u64),
            relay_at_block: row.try_get::<Option<i64>, _>("relay_at_block")?.map(|v| v as u64),
            created_at: row.try_get("created_at")?,
            funded_at: row.try_get("funded_at")?,
            relayed_at: row.try_get("relayed_at")?,
        })
    }
}

#[async_trait]
impl ChainStore for Store {
    async fn insert_chain(&self, chain: &NewChain) -> Result<Chain> {
        let rec = sqlx::query(
            r#"
            INSERT INTO relay_chains
                (name, network, intake_address, intake_privkey_encrypted,
                 final_address, final_is_generated, final_privkey_encrypted, total_hops)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chain.name)
        .bind(chain.network.as_str())
        .bind(&chain.intake_address)
        .bind(&chain.intake_privkey_encrypted)
        .bind(&chain.final_address)
        .bind(chain.final_is_generated as i64)
        .bind(&chain.final_privkey_encrypted)
        .bind(chain.total_hops as i64)
        .execute(&self.pool)
        .await?;

        let id = rec.last_insert_rowid();
        self.get_chain(id)
            .await?
            .ok_or_else(|| anyhow!("chain {id} missing immediately after insert"))
    }

    async fn get_chain(&self, id: i64) -> Result<Option<Chain>> {
        let row = sqlx::query("SELECT * FROM relay_chains WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::row_to_chain(&r)).transpose()
    }

    async fn list_chains(&self, network: Option<Network>) -> Result<Vec<Chain>> {
        let rows = match network {
            Some(net) => {
                sqlx::query("SELECT * FROM relay_chains WHERE network = ? ORDER BY id DESC")
                    .bind(net.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM relay_chains ORDER BY id DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(Self::row_to_chain).collect()
    }

    async fn list_active_chains(&self, network: Network) -> Result<Vec<Chain>> {
        let rows = sqlx::query(
            "SELECT * FROM relay_chains WHERE network = ? AND status = 'active' ORDER BY id",
        )
        .bind(network.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_chain).collect()
    }

    async fn set_chain_status(&self, id: i64, status: ChainStatus, error_message: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE relay_chains SET status = ?, error_message = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(error_message)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_chain_started(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE relay_chains SET status = 'active', started_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_chain_completed(&self, id: i64, amount_sent_sats: u64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE relay_chains
            SET status = 'completed', completed_at = CURRENT_TIMESTAMP, amount_sent_sats = ?
            WHERE id = ?
            "#,
        )
        .bind(amount_sent_sats as i64)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn advance_chain_hop(&self, id: i64, current_hop: u32, total_fees_sats: u64) -> Result<()> {
        sqlx::query("UPDATE relay_chains SET current_hop = ?, total_fees_sats = ? WHERE id = ?")
            .bind(current_hop as i64)
            .bind(total_fees_sats as i64)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_chain_received(&self, id: i64, amount_sats: u64) -> Result<()> {
        sqlx::query("UPDATE relay_chains SET amount_received_sats = ? WHERE id = ?")
            .bind(amount_sats as i64)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl HopStore for Store {
    async fn insert_hops(&self, chain_id: i64, hops: &[NewHop]) -> Result<Vec<Hop>> {
        let mut out = Vec::with_capacity(hops.len());
        for hop in hops {
            sqlx::query(
                r#"
                INSERT INTO relay_hops (chain_id, hop_number, address, privkey_encrypted, delay_blocks)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(chain_id)
            .bind(hop.hop_number as i64)
            .bind(&hop.address)
            .bind(&hop.privkey_encrypted)
            .bind(hop.delay_blocks as i64)
            .execute(&self.pool)
            .await?;
            out.push(
                self.get_hop_by_number(chain_id, hop.hop_number)
                    .await?
                    .ok_or_else(|| anyhow!("hop {} missing immediately after insert", hop.hop_number))?,
            );
        }
        Ok(out)
    }

    async fn get_hop(&self, id: i64) -> Result<Option<Hop>> {
        let row = sqlx::query("SELECT * FROM relay_hops WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::row_to_hop(&r)).transpose()
    }

    async fn list_hops(&self, chain_id: i64) -> Result<Vec<Hop>> {
        let rows = sqlx::query("SELECT * FROM relay_hops WHERE chain_id = ? ORDER BY hop_number")
            .bind(chain_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_hop).collect()
    }

    async fn get_hop_by_number(&self, chain_id: i64, hop_number: u32) -> Result<Option<Hop>> {
        let row = sqlx::query("SELECT * FROM relay_hops WHERE chain_id = ? AND hop_number = ?")
            .bind(chain_id)
            .bind(hop_number as i64)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::row_to_hop(&r)).transpose()
    }

    async fn set_hop_funded(
        &self,
        id: i64,
        incoming_txid: &str,
        incoming_amount_sats: u64,
        confirmed_at_block: u64,
        relay_at_block: u64,
    ) -> Result<()> {
        // `funded` and `pending_relay` are equivalent once incoming metadata is
        // recorded; go straight to `pending_relay` so `hops_pending_relay` sees it.
        sqlx::query(
            r#"
            UPDATE relay_hops
            SET status = 'pending_relay', incoming_txid = ?, incoming_amount_sats = ?,
                incoming_confirmed_at_block = ?, relay_at_block = ?, funded_at = CURRENT_TIMESTAMP
            WHERE id = ?
            "#,
        )
        .bind(incoming_txid)
        .bind(incoming_amount_sats as i64)
        .bind(confirmed_at_block as i64)
        .bind(relay_at_block as i64)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_hop_pending_relay(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE relay_hops SET status = 'pending_relay' WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_hop_relayed(
        &self,
        id: i64,
        outgoing_txid: &str,
        outgoing_amount_sats: u64,
        outgoing_fee_sats: u64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE relay_hops
            SET status = 'relayed', outgoing_txid = ?, outgoing_amount_sats = ?,
                outgoing_fee_sats = ?, relayed_at = CURRENT_TIMESTAMP
            WHERE id = ?
            "#,
        )
        .bind(outgoing_txid)
        .bind(outgoing_amount_sats as i64)
        .bind(outgoing_fee_sats as i64)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_hop_failed(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE relay_hops SET status = 'failed' WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn force_hop_relayed(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE relay_hops SET status = 'relayed', relayed_at = CURRENT_TIMESTAMP WHERE id = ? AND status != 'relayed'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn hops_pending_relay(&self, network: Network, tip_height: u64) -> Result<Vec<Hop>> {
        let rows = sqlx::query(
            r#"
            SELECT h.* FROM relay_hops h
            JOIN relay_chains c ON c.id = h.chain_id
            WHERE c.network = ?
              AND c.status = 'active'
              AND h.status IN ('funded', 'pending_relay')
              AND (h.relay_at_block IS NULL OR h.relay_at_block <= ?)
            ORDER BY h.chain_id, h.hop_number
            "#,
        )
        .bind(network.as_str())
        .bind(tip_height as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_hop).collect()
    }
}

#[async_trait]
impl LogStore for Store {
    async fn append(
        &self,
        chain_id: i64,
        hop_id: Option<i64>,
        event: EventKind,
        txid: Option<&str>,
        amount_sats: Option<u64>,
        fee_sats: Option<u64>,
        block_height: Option<u64>,
        details: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO transaction_log
                (chain_id, hop_id, event_type, txid, amount_sats, fee_sats, block_height, details)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(chain_id)
        .bind(hop_id)
        .bind(event.as_str())
        .bind(txid)
        .bind(amount_sats.map(|v| v as i64))
        .bind(fee_sats.map(|v| v as i64))
        .bind(block_height.map(|v| v as i64))
        .bind(details)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_for_chain(&self, chain_id: i64) -> Result<Vec<LogEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM transaction_log WHERE chain_id = ? ORDER BY id",
        )
        .bind(chain_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let event_type: String = row.try_get("event_type")?;
                Ok(LogEntry {
                    id: row.try_get("id")?,
                    chain_id: row.try_get("chain_id")?,
                    hop_id: row.try_get("hop_id")?,
                    event: event_type.parse().map_err(|e| anyhow!("{e}"))?,
                    txid: row.try_get("txid")?,
                    amount_sats: row.try_get::<Option<i64>, _>("amount_sats")?.map(|v| v as u64),
                    fee_sats: row.try_get::<Option<i64>, _>("fee_sats")?.map(|v| v as u64),
                    block_height: row.try_get::<Option<i64>, _>("block_height")?.map(|v| v as u64),
                    details: row.try_get("details")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl TipStore for Store {
    async fn get_tip(&self, network: Network) -> Result<Option<TipMarker>> {
        let row = sqlx::query("SELECT * FROM block_tracker WHERE network = ?")
            .bind(network.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            Ok(TipMarker {
                network,
                last_height: r.try_get::<i64, _>("last_height")? as u64,
                last_hash: r.try_get("last_hash")?,
                updated_at: r.try_get::<DateTime<Utc>, _>("updated_at")?,
            })
        })
        .transpose()
    }

    async fn set_tip(&self, network: Network, height: u64, hash: Option<&str>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO block_tracker (network, last_height, last_hash, updated_at)
            VALUES (?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(network) DO UPDATE SET
                last_height = excluded.last_height,
                last_hash = excluded.last_hash,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(network.as_str())
        .bind(height as i64)
        .bind(hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for Store {
    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| r.try_get::<String, _>("value").map_err(Into::into))
            .transpose()
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
