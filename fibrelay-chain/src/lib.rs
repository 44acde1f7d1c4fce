//! The `ChainClient` abstract interface plus a concrete Esplora/Blockstream
//! REST adapter, grounded on the original prototype's `BitcoinAPI`
//! (`bitcoin_utils.py`) and on `dxid-interop`'s `HttpJsonRpcAdapter` for the
//! reqwest + typed-error shape.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ChainClientError {
    #[error("http error: {0}")]
    Http(String),
    #[error("not found")]
    NotFound,
    #[error("unexpected response: {0}")]
    Unexpected(String),
}

/// An unspent output, matching the original prototype's `UTXOInfo`
/// (`bitcoin_utils.py`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtxoInfo {
    pub txid: String,
    pub vout: u32,
    pub value_sats: u64,
    pub confirmed_at_block: Option<u64>,
}

/// A transaction's confirmation state, matching the original prototype's
/// `TransactionInfo`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub txid: String,
    pub confirmed: bool,
    pub block_height: Option<u64>,
    pub fee_sats: Option<u64>,
}

/// Confirmed/unconfirmed balance of an address, in satoshis.
///
/// Both fields are signed: `confirmed_sats` is
/// `chain.funded − chain.spent` and `unconfirmed_sats` is
/// `mempool.funded − mempool.spent`. A wallet that has already spent a
/// confirmed UTXO in an unconfirmed transaction shows a negative
/// `unconfirmed_sats` until that spend itself confirms.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AddressBalance {
    pub confirmed_sats: i64,
    pub unconfirmed_sats: i64,
}

impl AddressBalance {
    pub fn has_any_funds(&self) -> bool {
        self.confirmed_sats > 0 || self.unconfirmed_sats > 0
    }
}

/// The abstract chain-query and broadcast surface the Relay Engine depends
/// on. Marked out of scope for a specific implementation by the design this
/// is built from; this crate supplies one concrete adapter so the workspace
/// produces a runnable binary.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn get_block_height(&self) -> Result<u64, ChainClientError>;
    async fn get_block_hash(&self, height: u64) -> Result<String, ChainClientError>;
    async fn get_address_utxos(&self, address: &str) -> Result<Vec<UtxoInfo>, ChainClientError>;
    async fn get_address_balance(&self, address: &str) -> Result<AddressBalance, ChainClientError>;
    async fn get_transaction(&self, txid: &str) -> Result<Option<TransactionInfo>, ChainClientError>;
    async fn broadcast_transaction(&self, tx_hex: &str) -> Result<String, ChainClientError>;
}

/// Blockstream Esplora-compatible REST client. Works against both
/// `blockstream.info/testnet/api` and `blockstream.info/api` depending on
/// which base URL the caller configures.
pub struct EsploraChainClient {
    client: Client,
    api_base: String,
}

impl EsploraChainClient {
    pub fn new(api_base: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client");
        Self {
            client,
            api_base: api_base.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_base.trim_end_matches('/'), path)
    }

    async fn get_text(&self, path: &str) -> Result<String, ChainClientError> {
        let resp = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| ChainClientError::Http(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ChainClientError::NotFound);
        }
        let resp = resp.error_for_status().map_err(|e| ChainClientError::Http(e.to_string()))?;
        resp.text().await.map_err(|e| ChainClientError::Http(e.to_string()))
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, ChainClientError> {
        let resp = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| ChainClientError::Http(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ChainClientError::NotFound);
        }
        let resp = resp.error_for_status().map_err(|e| ChainClientError::Http(e.to_string()))?;
        resp.json::<T>().await.map_err(|e| ChainClientError::Unexpected(e.to_string()))
    }
}

#[derive(Deserialize)]
struct EsploraUtxo {
    txid: String,
    vout: u32,
    value: u64,
    status: EsploraStatus,
}

#[derive(Deserialize)]
struct EsploraStatus {
    confirmed: bool,
    block_height: Option<u64>,
}

#[derive(Deserialize)]
struct EsploraAddressInfo {
    chain_stats: EsploraStats,
    mempool_stats: EsploraStats,
}

#[derive(Deserialize, Default)]
struct EsploraStats {
    funded_txo_sum: u64,
    spent_txo_sum: u64,
}

#[derive(Deserialize)]
struct EsploraTx {
    status: EsploraStatus,
    fee: Option<u64>,
}

#[async_trait]
impl ChainClient for EsploraChainClient {
    async fn get_block_height(&self) -> Result<u64, ChainClientError> {
        let text = self.get_text("blocks/tip/height").await?;
        text.trim()
            .parse()
            .map_err(|_| ChainClientError::Unexpected(format!("non-numeric tip height: {text}")))
    }

    async fn get_block_hash(&self, height: u64) -> Result<String, ChainClientError> {
        self.get_text(&format!("block-height/{height}")).await
    }

    async fn get_address_utxos(&self, address: &str) -> Result<Vec<UtxoInfo>, ChainClientError> {
        let utxos: Vec<EsploraUtxo> = self.get_json(&format!("address/{address}/utxo")).await?;
        Ok(utxos
            .into_iter()
            .map(|u| UtxoInfo {
                txid: u.txid,
                vout: u.vout,
                value_sats: u.value,
                confirmed_at_block: if u.status.confirmed { u.status.block_height } else { None },
            })
            .collect())
    }

    async fn get_address_balance(&self, address: &str) -> Result<AddressBalance, ChainClientError> {
        let info: EsploraAddressInfo = self.get_json(&format!("address/{address}")).await?;
        Ok(AddressBalance {
            confirmed_sats: info.chain_stats.funded_txo_sum as i64 - info.chain_stats.spent_txo_sum as i64,
            unconfirmed_sats: info.mempool_stats.funded_txo_sum as i64 - info.mempool_stats.spent_txo_sum as i64,
        })
    }

    async fn get_transaction(&self, txid: &str) -> Result<Option<TransactionInfo>, ChainClientError> {
        match self.get_json::<EsploraTx>(&format!("tx/{txid}")).await {
            Ok(tx) => Ok(Some(TransactionInfo {
                txid: txid.to_string(),
                confirmed: tx.status.confirmed,
                block_height: tx.status.block_height,
                fee_sats: tx.fee,
            })),
            Err(ChainClientError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn broadcast_transaction(&self, tx_hex: &str) -> Result<String, ChainClientError> {
        let resp = self
            .client
            .post(self.url("tx"))
            .body(tx_hex.to_string())
            .send()
            .await
            .map_err(|e| ChainClientError::Http(e.to_string()))?;
        let resp = resp.error_for_status().map_err(|e| ChainClientError::Http(e.to_string()))?;
        let txid = resp.text().await.map_err(|e| ChainClientError::Http(e.to_string()))?;
        debug!(txid = %txid, "broadcast transaction");
        Ok(txid.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_trailing_slash() {
        let client = EsploraChainClient::new("https://blockstream.info/testnet/api/");
        assert_eq!(client.url("blocks/tip/height"), "https://blockstream.info/testnet/api/blocks/tip/height");
    }

    #[test]
    fn address_balance_unconfirmed_can_go_negative() {
        let bal = AddressBalance { confirmed_sats: 50_000, unconfirmed_sats: -10_000 };
        assert!(bal.has_any_funds());
        assert_eq!(bal.confirmed_sats + bal.unconfirmed_sats, 40_000);
    }
}
