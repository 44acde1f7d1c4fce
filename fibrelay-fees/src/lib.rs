//! The `FeeOracle` abstract interface plus a mempool.space adapter with a
//! hard-coded fallback schedule, grounded on the original prototype's
//! `BitcoinAPI.get_fee_estimates` (`bitcoin_utils.py`).

use std::time::Duration;

use async_trait::async_trait;
use fibrelay_core::{Network, ESTIMATED_TX_VBYTES};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum FeeOracleError {
    #[error("http error: {0}")]
    Http(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeePriority {
    High,
    Medium,
    Low,
    Economy,
}

impl FeePriority {
    pub fn as_str(self) -> &'static str {
        match self {
            FeePriority::High => "high",
            FeePriority::Medium => "medium",
            FeePriority::Low => "low",
            FeePriority::Economy => "economy",
        }
    }
}

/// One priority tier's fee estimate, matching the original prototype's
/// `FeeEstimate` (`bitcoin_utils.py`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeEstimate {
    pub fee_rate_sat_vb: f64,
    pub estimated_fee_sats: u64,
    pub priority: FeePriority,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub high: FeeEstimate,
    pub medium: FeeEstimate,
    pub low: FeeEstimate,
    pub economy: FeeEstimate,
}

impl FeeSchedule {
    pub fn for_priority(&self, priority: FeePriority) -> &FeeEstimate {
        match priority {
            FeePriority::High => &self.high,
            FeePriority::Medium => &self.medium,
            FeePriority::Low => &self.low,
            FeePriority::Economy => &self.economy,
        }
    }
}

/// Total-fees breakdown returned by the fee-preview control-surface
/// operation, `estimate_total_fees`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TotalFeeEstimate {
    pub fee_rate_sat_vb: f64,
    pub fee_per_transaction_sats: u64,
    pub num_transactions: u32,
    pub total_fees_sats: u64,
    pub priority: FeePriority,
}

pub fn estimate_total_fees(num_hops: u32, estimate: &FeeEstimate) -> TotalFeeEstimate {
    let num_transactions = num_hops + 1;
    TotalFeeEstimate {
        fee_rate_sat_vb: estimate.fee_rate_sat_vb,
        fee_per_transaction_sats: estimate.estimated_fee_sats,
        num_transactions,
        total_fees_sats: estimate.estimated_fee_sats * num_transactions as u64,
        priority: estimate.priority,
    }
}

#[async_trait]
pub trait FeeOracle: Send + Sync {
    async fn estimates(&self) -> FeeSchedule;
}

fn estimate(rate: f64, priority: FeePriority) -> FeeEstimate {
    FeeEstimate {
        fee_rate_sat_vb: rate,
        estimated_fee_sats: (rate * ESTIMATED_TX_VBYTES as f64) as u64,
        priority,
    }
}

/// Synthesize a fee schedule from a single base rate, used both as the
/// fallback when mempool.space is unreachable and directly on networks
/// with no live oracle.
pub fn fallback_schedule(network: Network) -> FeeSchedule {
    let base = network.fallback_base_fee_rate() as f64;
    FeeSchedule {
        high: estimate(base * 2.0, FeePriority::High),
        medium: estimate(base, FeePriority::Medium),
        low: estimate(base / 2.0, FeePriority::Low),
        economy: estimate(base / 4.0, FeePriority::Economy),
    }
}

#[derive(Deserialize)]
struct MempoolRecommendedFees {
    #[serde(rename = "fastestFee")]
    fastest_fee: f64,
    #[serde(rename = "halfHourFee")]
    half_hour_fee: f64,
    #[serde(rename = "hourFee")]
    hour_fee: f64,
    #[serde(rename = "economyFee")]
    economy_fee: f64,
}

/// mempool.space `/api/v1/fees/recommended` adapter with a fallback to
/// [`fallback_schedule`] on any network error, matching the original's
/// `try/except Exception` around the live request.
pub struct MempoolFeeOracle {
    client: Client,
    url: String,
    network: Network,
}

impl MempoolFeeOracle {
    pub fn new(network: Network) -> Self {
        let url = match network {
            Network::Testnet => "https://mempool.space/testnet/api/v1/fees/recommended".to_string(),
            Network::Mainnet => "https://mempool.space/api/v1/fees/recommended".to_string(),
        };
        Self::with_base_url(network, url)
    }

    /// Same as [`MempoolFeeOracle::new`] but against a caller-supplied
    /// `fees/recommended` URL, for deployments pointed at a self-hosted
    /// mempool.space instance (config.toml's `fee_oracle` section).
    pub fn with_base_url(network: Network, url: impl Into<String>) -> Self {
        Self {
            client: Client::builder().timeout(Duration::from_secs(10)).build().expect("reqwest client"),
            url: url.into(),
            network,
        }
    }

    async fn fetch(&self) -> Result<FeeSchedule, FeeOracleError> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| FeeOracleError::Http(e.to_string()))?
            .error_for_status()
            .map_err(|e| FeeOracleError::Http(e.to_string()))?;
        let data: MempoolRecommendedFees = resp.json().await.map_err(|e| FeeOracleError::Http(e.to_string()))?;
        Ok(FeeSchedule {
            high: estimate(data.fastest_fee, FeePriority::High),
            medium: estimate(data.half_hour_fee, FeePriority::Medium),
            low: estimate(data.hour_fee, FeePriority::Low),
            economy: estimate(data.economy_fee, FeePriority::Economy),
        })
    }
}

#[async_trait]
impl FeeOracle for MempoolFeeOracle {
    async fn estimates(&self) -> FeeSchedule {
        match self.fetch().await {
            Ok(schedule) => schedule,
            Err(e) => {
                warn!(error = %e, "mempool.space fee oracle unreachable, using fallback schedule");
                fallback_schedule(self.network)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_schedule_orders_tiers_descending() {
        let schedule = fallback_schedule(Network::Testnet);
        assert!(schedule.high.fee_rate_sat_vb > schedule.medium.fee_rate_sat_vb);
        assert!(schedule.medium.fee_rate_sat_vb > schedule.low.fee_rate_sat_vb);
        assert!(schedule.low.fee_rate_sat_vb > schedule.economy.fee_rate_sat_vb);
    }

    #[test]
    fn total_fee_estimate_counts_one_extra_transaction() {
        let schedule = fallback_schedule(Network::Testnet);
        let total = estimate_total_fees(3, &schedule.medium);
        assert_eq!(total.num_transactions, 4);
        assert_eq!(total.total_fees_sats, schedule.medium.estimated_fee_sats * 4);
    }
}
