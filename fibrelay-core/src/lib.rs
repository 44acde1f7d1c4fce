use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// `testnet` or `mainnet`. Affects address prefixes, default fee floors, and
/// which Esplora/mempool.space base URL a `ChainClient`/`FeeOracle` talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Testnet,
    Mainnet,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Testnet => "testnet",
            Network::Mainnet => "mainnet",
        }
    }

    /// Base sat/vB rate used to synthesize a fallback fee schedule when the
    /// fee oracle is unreachable.
    pub fn fallback_base_fee_rate(self) -> u64 {
        match self {
            Network::Testnet => 10,
            Network::Mainnet => 20,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "testnet" => Ok(Network::Testnet),
            "mainnet" => Ok(Network::Mainnet),
            other => Err(Error::InvalidInput(format!("unknown network: {other}"))),
        }
    }
}

/// The error taxonomy shared by every component. `Fatal` is the only variant
/// that should ever take down a worker; everything else leaves the chain in
/// a consistent state to be retried on the next cycle.
#[derive(Debug, Error)]
pub enum Error {
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("insufficient balance: have {available} sats, need more than {fee} sats fee")]
    InsufficientBalance { available: u64, fee: u64 },

    #[error("decryption failed")]
    DecryptFailed,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("broadcast rejected: {0}")]
    BroadcastRejected(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Minimum number of hops a chain may request.
pub const MIN_HOPS: u32 = 2;
/// Maximum number of hops a chain may request.
pub const MAX_HOPS: u32 = 10;
/// Average transaction size assumed for fee estimation, P2WPKH single in/out.
pub const ESTIMATED_TX_VBYTES: u64 = 110;
/// Floor below which a computed fee is never allowed to fall (dust-fee
/// rejection protection).
pub const MIN_FEE_SATS: u64 = 200;
/// Fixed fee used by the manual "recover stuck chain" procedure.
pub const MANUAL_RETRY_FEE_SATS: u64 = 200;

/// The Fibonacci sequence starting `1, 1`, used to pace hops.
/// `fibonacci_delays(n)` returns the first `n` terms, extending the
/// hard-coded table with `f[i] = f[i-1] + f[i-2]` past its end.
pub fn fibonacci_delays(num_hops: u32) -> Vec<u64> {
    const TABLE: [u64; 12] = [1, 1, 2, 3, 5, 8, 13, 21, 34, 55, 89, 144];
    let n = num_hops as usize;
    if n <= TABLE.len() {
        return TABLE[..n].to_vec();
    }
    let mut delays = TABLE.to_vec();
    while delays.len() < n {
        let len = delays.len();
        delays.push(delays[len - 1] + delays[len - 2]);
    }
    delays
}

/// Estimated wall-clock duration of a relay chain, assuming a fixed average
/// block time. Mirrors the original prototype's `estimate_relay_timing`
/// helper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayTiming {
    pub delays_per_hop: Vec<u64>,
    pub total_delay_blocks: u64,
    pub estimated_minutes: u64,
    pub estimated_hours: f64,
    pub estimated_days: f64,
}

pub fn estimate_relay_timing(num_hops: u32, avg_block_minutes: u64) -> RelayTiming {
    let delays = fibonacci_delays(num_hops);
    let total_delay_blocks: u64 = delays.iter().sum();
    let estimated_minutes = total_delay_blocks * avg_block_minutes;
    RelayTiming {
        delays_per_hop: delays,
        total_delay_blocks,
        estimated_minutes,
        estimated_hours: estimated_minutes as f64 / 60.0,
        estimated_days: estimated_minutes as f64 / 1440.0,
    }
}

/// Validate a native segwit / legacy address against a network's expected
/// prefixes and length. This is a structural check only — no checksum
/// verification is performed, matching the original prototype's
/// `validate_address`.
pub fn validate_address(address: &str, network: Network) -> bool {
    let prefixes: &[&str] = match network {
        Network::Testnet => &["m", "n", "2", "tb1"],
        Network::Mainnet => &["1", "3", "bc1"],
    };
    if !prefixes.iter().any(|p| address.starts_with(p)) {
        return false;
    }
    if address.starts_with("bc1") || address.starts_with("tb1") {
        (42..=62).contains(&address.len())
    } else {
        (26..=35).contains(&address.len())
    }
}

/// One relay job's lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl ChainStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChainStatus::Completed | ChainStatus::Failed | ChainStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChainStatus::Pending => "pending",
            ChainStatus::Active => "active",
            ChainStatus::Completed => "completed",
            ChainStatus::Failed => "failed",
            ChainStatus::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for ChainStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ChainStatus::Pending),
            "active" => Ok(ChainStatus::Active),
            "completed" => Ok(ChainStatus::Completed),
            "failed" => Ok(ChainStatus::Failed),
            "cancelled" => Ok(ChainStatus::Cancelled),
            other => Err(Error::InvalidInput(format!("unknown chain status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chain {
    pub id: i64,
    pub name: String,
    pub network: Network,
    pub status: ChainStatus,

    pub intake_address: String,
    pub intake_privkey_encrypted: String,

    pub final_address: String,
    pub final_is_generated: bool,
    pub final_privkey_encrypted: Option<String>,

    pub total_hops: u32,
    pub current_hop: u32,

    pub amount_received_sats: Option<u64>,
    pub amount_sent_sats: Option<u64>,
    pub total_fees_sats: u64,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Lifecycle state of one intermediate, single-use address in a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HopStatus {
    Waiting,
    Funded,
    PendingRelay,
    Relayed,
    Failed,
}

impl HopStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HopStatus::Waiting => "waiting",
            HopStatus::Funded => "funded",
            HopStatus::PendingRelay => "pending_relay",
            HopStatus::Relayed => "relayed",
            HopStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for HopStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "waiting" => Ok(HopStatus::Waiting),
            "funded" => Ok(HopStatus::Funded),
            "pending_relay" => Ok(HopStatus::PendingRelay),
            "relayed" => Ok(HopStatus::Relayed),
            "failed" => Ok(HopStatus::Failed),
            other => Err(Error::InvalidInput(format!("unknown hop status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hop {
    pub id: i64,
    pub chain_id: i64,
    pub hop_number: u32,

    pub address: String,
    pub privkey_encrypted: String,
    pub delay_blocks: u64,
    pub status: HopStatus,

    pub incoming_txid: Option<String>,
    pub incoming_amount_sats: Option<u64>,
    pub incoming_confirmed_at_block: Option<u64>,

    pub outgoing_txid: Option<String>,
    pub outgoing_amount_sats: Option<u64>,
    pub outgoing_fee_sats: Option<u64>,

    pub relay_at_block: Option<u64>,

    pub created_at: DateTime<Utc>,
    pub funded_at: Option<DateTime<Utc>>,
    pub relayed_at: Option<DateTime<Utc>>,
}

/// Audit event kinds, enriched from the original prototype's
/// `log_transaction` call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ChainCreated,
    ChainActivated,
    ChainCancelled,
    RelaySent,
    RelayError,
    ManualRelay,
    ChainCompleted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ChainCreated => "chain_created",
            EventKind::ChainActivated => "chain_activated",
            EventKind::ChainCancelled => "chain_cancelled",
            EventKind::RelaySent => "relay_sent",
            EventKind::RelayError => "relay_error",
            EventKind::ManualRelay => "manual_relay",
            EventKind::ChainCompleted => "chain_completed",
        }
    }
}

impl std::str::FromStr for EventKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "chain_created" => Ok(EventKind::ChainCreated),
            "chain_activated" => Ok(EventKind::ChainActivated),
            "chain_cancelled" => Ok(EventKind::ChainCancelled),
            "relay_sent" => Ok(EventKind::RelaySent),
            "relay_error" => Ok(EventKind::RelayError),
            "manual_relay" => Ok(EventKind::ManualRelay),
            "chain_completed" => Ok(EventKind::ChainCompleted),
            other => Err(Error::InvalidInput(format!("unknown event kind: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    pub chain_id: i64,
    pub hop_id: Option<i64>,
    pub event: EventKind,
    pub txid: Option<String>,
    pub amount_sats: Option<u64>,
    pub fee_sats: Option<u64>,
    pub block_height: Option<u64>,
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-network last-seen chain tip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TipMarker {
    pub network: Network,
    pub last_height: u64,
    pub last_hash: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Well-known `settings` keys.
pub mod settings_keys {
    pub const ACTIVE_NETWORK: &str = "active_network";
    pub const PASSWORD_VERIFIER: &str = "password_verifier";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fibonacci_matches_table() {
        assert_eq!(fibonacci_delays(3), vec![1, 1, 2]);
        assert_eq!(fibonacci_delays(12), vec![1, 1, 2, 3, 5, 8, 13, 21, 34, 55, 89, 144]);
    }

    #[test]
    fn fibonacci_extends_past_table() {
        let delays = fibonacci_delays(15);
        assert_eq!(delays.len(), 15);
        for i in 2..delays.len() {
            assert_eq!(delays[i], delays[i - 1] + delays[i - 2]);
        }
    }

    #[test]
    fn fibonacci_rejects_nothing_but_stays_consistent_at_min_max() {
        assert_eq!(fibonacci_delays(MIN_HOPS).len(), MIN_HOPS as usize);
        assert_eq!(fibonacci_delays(MAX_HOPS).len(), MAX_HOPS as usize);
    }

    #[test]
    fn address_validation_testnet() {
        assert!(validate_address("tb1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq", Network::Testnet));
        assert!(validate_address("mxxTPFxCoCBwWpMK3JnfjPzYjD2Xr4QX8p", Network::Testnet));
        assert!(!validate_address("bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq", Network::Testnet));
    }

    #[test]
    fn address_validation_mainnet() {
        assert!(validate_address("bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq", Network::Mainnet));
        assert!(validate_address("1BvBMSEYstWetqTFn5Au4m4GFg7xJaNVN2", Network::Mainnet));
        assert!(!validate_address("tb1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq", Network::Mainnet));
    }

    #[test]
    fn chain_status_terminal() {
        assert!(ChainStatus::Completed.is_terminal());
        assert!(ChainStatus::Failed.is_terminal());
        assert!(ChainStatus::Cancelled.is_terminal());
        assert!(!ChainStatus::Active.is_terminal());
        assert!(!ChainStatus::Pending.is_terminal());
    }

    #[test]
    fn relay_timing_sums_delays() {
        let timing = estimate_relay_timing(3, 10);
        assert_eq!(timing.total_delay_blocks, 4); // 1 + 1 + 2
        assert_eq!(timing.estimated_minutes, 40);
    }
}
