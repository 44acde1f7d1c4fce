//! The Relay Engine: the durable, recoverable state machine that walks
//! funds down a chain of hops. One [`Engine`] drives one `(network, session)`
//! pair; [`EngineHandle`] owns its lifecycle (start/stop, restart-on-switch).
//!
//! Grounded on the original prototype's `RelayEngine` (`relay_engine.py`):
//! the per-cycle algorithm (`_process_cycle` / `_process_chain` /
//! `_find_funds_location` / `_relay_from_location` / `_complete_chain`) and
//! the standalone `manual_relay_chain` recovery procedure are ported
//! function-for-function, substituting a cooperative `tokio` task +
//! `Notify`-based cancellation for the Python `threading.Thread` +
//! `threading.Event`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use fibrelay_chain::{AddressBalance, ChainClient};
use fibrelay_core::{
    Chain, ChainStatus, EventKind, Hop, HopStatus, Network, MANUAL_RETRY_FEE_SATS, MIN_FEE_SATS,
};
use fibrelay_fees::FeeOracle;
use fibrelay_signer::{BitcoinSigner, SweepInput};
use fibrelay_storage::{ChainStore, HopStore, LogStore, Store, TipStore};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Errors from engine lifecycle operations (start/stop), as opposed to the
/// per-cycle reconciliation errors which are always absorbed into
/// `EngineStatus` rather than propagated: only `Fatal` conditions should
/// ever surface past a worker boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine not running")]
    NotRunning,
}

/// Per-chain human-readable status and last cycle error, surfaced by the
/// control surface's `status`/`get_chain` operations (the engine's
/// `processing_status` map; mirrors the original's `self.processing_status`).
#[derive(Debug, Clone, Default)]
pub struct EngineStatus {
    pub network: Option<Network>,
    pub last_error: Option<String>,
    pub processing: HashMap<i64, String>,
}

/// A boolean shutdown flag plus a `Notify`, so the poll-interval sleep can
/// be woken early without polling.
struct ShutdownSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    fn new() -> Self {
        Self { flag: AtomicBool::new(false), notify: Notify::new() }
    }

    fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep for `dur`, waking early if `request()` is called.
    async fn cancellable_sleep(&self, dur: Duration) {
        if self.is_set() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(dur) => {}
            _ = self.notify.notified() => {}
        }
    }
}

/// Dependencies needed to run one engine for one network. `store` is the
/// concrete `sqlx`-backed `Store`, cheap to clone (an `Arc`-backed pool
/// internally); the chain client, signer, and fee oracle are the three
/// external collaborators treated abstractly so tests can swap in mocks.
pub struct EngineParams {
    pub network: Network,
    pub store: Store,
    pub chain_client: Arc<dyn ChainClient>,
    pub signer: Arc<dyn BitcoinSigner>,
    pub fee_oracle: Arc<dyn FeeOracle>,
    pub vault_password: Arc<str>,
    pub poll_interval: Duration,
}

/// One running engine instance. Holds no OS thread of its own; `EngineHandle`
/// spawns [`Engine::run_cycle`] in a loop on a `tokio` task.
pub struct Engine {
    network: Network,
    store: Store,
    chain_client: Arc<dyn ChainClient>,
    signer: Arc<dyn BitcoinSigner>,
    fee_oracle: Arc<dyn FeeOracle>,
    vault_password: Arc<str>,
    poll_interval: Duration,
    status: StdMutex<EngineStatus>,
}

impl Engine {
    fn new(params: EngineParams) -> Arc<Self> {
        Arc::new(Self {
            network: params.network,
            store: params.store,
            chain_client: params.chain_client,
            signer: params.signer,
            fee_oracle: params.fee_oracle,
            vault_password: params.vault_password,
            poll_interval: params.poll_interval,
            status: StdMutex::new(EngineStatus { network: Some(params.network), ..Default::default() }),
        })
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn status(&self) -> EngineStatus {
        self.status.lock().unwrap().clone()
    }

    fn set_status(&self, chain_id: i64, message: impl Into<String>) {
        self.status.lock().unwrap().processing.insert(chain_id, message.into());
    }

    fn set_last_error(&self, error: Option<String>) {
        self.status.lock().unwrap().last_error = error;
    }

    /// One pass of the main loop: read tip, load active chains, reconcile
    /// each, commit the new tip marker.
    pub async fn run_cycle(&self) {
        let tip = match self.chain_client.get_block_height().await {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "failed to read tip height, skipping cycle");
                self.set_last_error(Some(e.to_string()));
                return;
            }
        };
        self.set_last_error(None);

        let chains = match self.store.list_active_chains(self.network).await {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "failed to load active chains");
                self.set_last_error(Some(e.to_string()));
                return;
            }
        };

        debug!(count = chains.len(), tip, network = %self.network, "processing active chains");

        for chain in chains {
            let chain_id = chain.id;
            if let Err(e) = self.reconcile_and_advance(&chain, tip).await {
                warn!(chain_id, error = %e, "reconciliation error");
                let _ = self
                    .store
                    .append(chain_id, None, EventKind::RelayError, None, None, None, Some(tip), Some(&e.to_string()))
                    .await;
                self.set_status(chain_id, format!("Error: {e}"));
            }
        }

        if let Err(e) = self.store.set_tip(self.network, tip, None).await {
            warn!(error = %e, "failed to persist tip marker");
        }
    }

    /// ReconcileAndAdvance for one chain. The engine never trusts its own
    /// bookkeeping about where funds are: it rebuilds the address list and
    /// asks the chain client directly, every cycle.
    async fn reconcile_and_advance(&self, chain: &Chain, tip: u64) -> Result<()> {
        let hops = self.store.list_hops(chain.id).await?;
        if hops.len() != chain.total_hops as usize {
            return Err(anyhow!(
                "chain {} has {} hops persisted, expected {}",
                chain.id,
                hops.len(),
                chain.total_hops
            ));
        }

        // A = [intake, hop[0], hop[1], ..., hop[n-1]]
        let mut addresses: Vec<&str> = Vec::with_capacity(hops.len() + 1);
        addresses.push(chain.intake_address.as_str());
        for hop in &hops {
            addresses.push(hop.address.as_str());
        }

        let mut funded_index = None;
        let mut balances: Vec<AddressBalance> = Vec::with_capacity(addresses.len());
        for address in &addresses {
            let balance = self
                .chain_client
                .get_address_balance(address)
                .await
                .map_err(|e| anyhow!("balance query for {address}: {e}"))?;
            let confirmed = balance.confirmed_sats;
            balances.push(balance);
            if confirmed > 0 {
                funded_index = Some(balances.len() - 1);
                break;
            }
        }

        let Some(i_star) = funded_index else {
            // balances now holds one entry per address scanned, in order;
            // balances[0] is always the intake balance since the scan never
            // breaks before reaching it.
            return self.reconcile_no_funds_found(chain, &hops, balances[0]).await;
        };

        // Enforce the Fibonacci delay rather than sweeping the instant
        // funds are confirmed, except for the intake sweep (there is no
        // prior hop to have delayed against).
        if i_star > 0 {
            let source_hop = &hops[i_star - 1];
            if let Some(relay_at) = source_hop.relay_at_block {
                if tip < relay_at {
                    self.set_status(chain.id, format!("waiting for delay: block {tip} of {relay_at}"));
                    return Ok(());
                }
            }
        }

        self.sweep(chain, &hops, i_star, tip).await
    }

    async fn reconcile_no_funds_found(&self, chain: &Chain, hops: &[Hop], intake_balance: AddressBalance) -> Result<()> {
        let final_balance = self
            .chain_client
            .get_address_balance(&chain.final_address)
            .await
            .map_err(|e| anyhow!("final balance query: {e}"))?;

        if final_balance.has_any_funds() {
            return self.complete_chain(chain, hops, final_balance).await;
        }

        if intake_balance.has_any_funds() {
            self.set_status(chain.id, "funds in transit");
        } else {
            self.set_status(chain.id, "waiting for funds at intake");
        }
        Ok(())
    }

    /// Sweep the confirmed balance at address index `i_star` forward to its
    /// destination. Ported from the original's `_relay_from_location`.
    async fn sweep(&self, chain: &Chain, hops: &[Hop], i_star: usize, tip: u64) -> Result<()> {
        let (source_address, source_key_enc): (&str, &str) = if i_star == 0 {
            (chain.intake_address.as_str(), chain.intake_privkey_encrypted.as_str())
        } else {
            let hop = &hops[i_star - 1];
            (hop.address.as_str(), hop.privkey_encrypted.as_str())
        };
        let destination: &str = if i_star < hops.len() {
            hops[i_star].address.as_str()
        } else {
            chain.final_address.as_str()
        };

        let secret = fibrelay_crypto::decrypt(source_key_enc, &self.vault_password)
            .map_err(|_| anyhow!("failed to decrypt signing key for chain {} at index {i_star}", chain.id))?;

        let utxos = self
            .chain_client
            .get_address_utxos(source_address)
            .await
            .map_err(|e| anyhow!("utxo query for {source_address}: {e}"))?;
        let balance: u64 = utxos.iter().map(|u| u.value_sats).sum();

        let fee_schedule = self.fee_oracle.estimates().await;
        let fee_sats = fee_schedule.medium.estimated_fee_sats.max(MIN_FEE_SATS);

        if balance <= fee_sats {
            self.set_status(chain.id, format!("Insufficient balance: {balance} sats"));
            self.store
                .append(
                    chain.id,
                    None,
                    EventKind::RelayError,
                    None,
                    Some(balance),
                    Some(fee_sats),
                    Some(tip),
                    Some(&format!("insufficient balance at {source_address}: {balance} <= fee {fee_sats}")),
                )
                .await?;
            return Ok(());
        }

        let inputs: Vec<SweepInput> = utxos
            .into_iter()
            .map(|u| SweepInput { txid: u.txid, vout: u.vout, value_sats: u.value_sats })
            .collect();

        let signed = self
            .signer
            .sign_sweep(secret.expose(), chain.network, &inputs, destination, fee_sats)
            .map_err(|e| anyhow!("sign sweep: {e}"))?;
        drop(secret);

        let txid = match self.chain_client.broadcast_transaction(&signed.tx_hex).await {
            Ok(txid) => txid,
            Err(e) => {
                // Per the hop state machine (spec.md §4.6), a broadcast error
                // parks the source hop at `failed` rather than leaving it
                // `pending_relay` silently; the engine still re-evaluates it
                // from live chain state next cycle regardless of this label.
                if i_star > 0 {
                    let _ = self.store.set_hop_failed(hops[i_star - 1].id).await;
                }
                return Err(anyhow!("broadcast: {e}"));
            }
        };

        let desc = describe_hop_move(hops.len(), i_star);
        info!(chain_id = chain.id, %txid, %desc, amount = signed.amount_sats, "swept funds");

        if i_star == 0 {
            self.store.set_chain_received(chain.id, balance).await?;
            let dest_hop = &hops[0];
            self.store
                .set_hop_funded(dest_hop.id, &txid, signed.amount_sats, tip, tip + dest_hop.delay_blocks)
                .await?;
            self.store.advance_chain_hop(chain.id, 0, chain.total_fees_sats).await?;
            self.store
                .append(
                    chain.id,
                    Some(dest_hop.id),
                    EventKind::RelaySent,
                    Some(&txid),
                    Some(signed.amount_sats),
                    Some(fee_sats),
                    Some(tip),
                    Some(&desc),
                )
                .await?;
        } else {
            let source_hop = &hops[i_star - 1];
            self.store.set_hop_relayed(source_hop.id, &txid, signed.amount_sats, fee_sats).await?;
            if i_star < hops.len() {
                let dest_hop = &hops[i_star];
                self.store
                    .set_hop_funded(dest_hop.id, &txid, signed.amount_sats, tip, tip + dest_hop.delay_blocks)
                    .await?;
            }
            let total_fees = chain.total_fees_sats + fee_sats;
            self.store.advance_chain_hop(chain.id, i_star as u32, total_fees).await?;
            self.store
                .append(
                    chain.id,
                    Some(source_hop.id),
                    EventKind::RelaySent,
                    Some(&txid),
                    Some(signed.amount_sats),
                    Some(fee_sats),
                    Some(tip),
                    Some(&desc),
                )
                .await?;
        }

        self.set_status(chain.id, format!("Sent: {desc} ({} sats)", signed.amount_sats));
        Ok(())
    }

    /// Completion. Ported from the original's `_complete_chain`.
    async fn complete_chain(&self, chain: &Chain, hops: &[Hop], final_balance: AddressBalance) -> Result<()> {
        let total_fees: u64 = hops.iter().filter_map(|h| h.outgoing_fee_sats).sum();

        let mut final_amount = (final_balance.confirmed_sats.max(0) + final_balance.unconfirmed_sats.max(0)) as u64;
        if final_amount == 0 {
            for hop in hops.iter().rev() {
                if let Some(amount) = hop.outgoing_amount_sats {
                    final_amount = amount;
                    break;
                }
            }
        }

        for hop in hops {
            if hop.status != HopStatus::Relayed {
                self.store.force_hop_relayed(hop.id).await?;
            }
        }
        self.store.advance_chain_hop(chain.id, chain.total_hops, total_fees).await?;
        self.store.mark_chain_completed(chain.id, final_amount).await?;
        self.store
            .append(
                chain.id,
                None,
                EventKind::ChainCompleted,
                None,
                Some(final_amount),
                Some(total_fees),
                None,
                Some(&format!("successfully relayed to {}", chain.final_address)),
            )
            .await?;

        self.set_status(chain.id, "COMPLETED");
        info!(chain_id = chain.id, amount = final_amount, fees = total_fees, "chain completed");
        Ok(())
    }

    async fn run_loop(self: Arc<Self>, shutdown: Arc<ShutdownSignal>) {
        info!(network = %self.network, "relay engine loop started");
        while !shutdown.is_set() {
            self.run_cycle().await;
            shutdown.cancellable_sleep(self.poll_interval).await;
        }
        info!(network = %self.network, "relay engine loop stopped");
    }
}

/// `"Hop 1"` style description of a sweep, matching the original's
/// `f"Hop {hop_index + 1} -> Hop {hop_index + 2}"` strings used in both the
/// `processing_status` map and the audit log `details` field.
fn describe_hop_move(num_hops: usize, i_star: usize) -> String {
    let from = if i_star == 0 { "Intake".to_string() } else { format!("Hop {i_star}") };
    let to = if i_star < num_hops { format!("Hop {}", i_star + 1) } else { "Final".to_string() };
    format!("{from} -> {to}")
}

struct ActiveEngine {
    engine: Arc<Engine>,
    shutdown: Arc<ShutdownSignal>,
    join: JoinHandle<()>,
}

/// Owns at most one running [`Engine`] at a time. `start`/`stop` take the
/// same async mutex, so "stop the old engine, start the new one" (network
/// switch) is atomic with respect to any concurrent caller.
pub struct EngineHandle {
    active: AsyncMutex<Option<ActiveEngine>>,
}

impl Default for EngineHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineHandle {
    pub fn new() -> Self {
        Self { active: AsyncMutex::new(None) }
    }

    /// Start a new engine, stopping any previously running one first.
    pub async fn start(&self, params: EngineParams) -> Arc<Engine> {
        let mut guard = self.active.lock().await;
        if let Some(previous) = guard.take() {
            stop_active(previous).await;
        }

        let engine = Engine::new(params);
        let shutdown = Arc::new(ShutdownSignal::new());
        let join = tokio::spawn(engine.clone().run_loop(shutdown.clone()));

        let handle = engine.clone();
        *guard = Some(ActiveEngine { engine, shutdown, join });
        handle
    }

    /// Stop the running engine, joining within a bounded 10s timeout.
    pub async fn stop(&self) -> std::result::Result<(), EngineError> {
        let mut guard = self.active.lock().await;
        match guard.take() {
            Some(active) => {
                stop_active(active).await;
                Ok(())
            }
            None => Err(EngineError::NotRunning),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.active.lock().await.is_some()
    }

    pub async fn status(&self) -> Option<EngineStatus> {
        self.active.lock().await.as_ref().map(|a| a.engine.status())
    }

    pub async fn network(&self) -> Option<Network> {
        self.active.lock().await.as_ref().map(|a| a.engine.network())
    }
}

async fn stop_active(active: ActiveEngine) {
    active.shutdown.request();
    if tokio::time::timeout(Duration::from_secs(10), active.join).await.is_err() {
        warn!("relay engine did not stop within 10s timeout");
    }
}

/// Outcome of one step of a manual retry walk (mirrors the original's
/// result dict `{'step', 'status', ...}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualRetryStatus {
    Success,
    Skipped,
    NoFunds,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManualRetryStep {
    pub step: String,
    pub status: ManualRetryStatus,
    pub txid: Option<String>,
    pub amount_sats: Option<u64>,
    pub destination: Option<String>,
    pub detail: Option<String>,
}

fn retry_step(step: impl Into<String>, status: ManualRetryStatus) -> ManualRetryStep {
    ManualRetryStep { step: step.into(), status, txid: None, amount_sats: None, destination: None, detail: None }
}

/// Manually recover a stuck chain: walk the full address list once, sweeping
/// whichever address currently holds funds to its next destination with a
/// fixed 200-sat fee. Ported from the original's `manual_relay_chain`.
/// Independent of any running [`Engine`] — it may be called whether or not
/// the background worker is active.
pub async fn manual_retry_chain(
    store: &Store,
    chain_client: &dyn ChainClient,
    signer: &dyn BitcoinSigner,
    chain_id: i64,
    vault_password: &str,
) -> Result<Vec<ManualRetryStep>> {
    let chain = store.get_chain(chain_id).await?.ok_or_else(|| anyhow!("chain {chain_id} not found"))?;
    let hops = store.list_hops(chain_id).await?;
    if hops.is_empty() {
        return Err(anyhow!("chain {chain_id} has no hops"));
    }
    let tip = chain_client.get_block_height().await.map_err(|e| anyhow!("tip height: {e}"))?;

    let mut steps = Vec::with_capacity(hops.len() + 1);

    for i in 0..=hops.len() {
        let (step_name, address, key_enc) = if i == 0 {
            ("intake".to_string(), chain.intake_address.clone(), chain.intake_privkey_encrypted.clone())
        } else {
            let hop = &hops[i - 1];
            (format!("hop_{i}"), hop.address.clone(), hop.privkey_encrypted.clone())
        };
        let destination = if i < hops.len() { hops[i].address.clone() } else { chain.final_address.clone() };

        let balance = match chain_client.get_address_balance(&address).await {
            Ok(b) => b,
            Err(e) => {
                steps.push(ManualRetryStep { detail: Some(e.to_string()), ..retry_step(step_name, ManualRetryStatus::Error) });
                continue;
            }
        };
        if balance.confirmed_sats <= 0 {
            steps.push(retry_step(step_name, ManualRetryStatus::NoFunds));
            continue;
        }

        let secret = match fibrelay_crypto::decrypt(&key_enc, vault_password) {
            Ok(s) => s,
            Err(_) => {
                steps.push(ManualRetryStep {
                    detail: Some("decryption failed".to_string()),
                    ..retry_step(step_name, ManualRetryStatus::Error)
                });
                continue;
            }
        };

        let utxos = match chain_client.get_address_utxos(&address).await {
            Ok(u) => u,
            Err(e) => {
                steps.push(ManualRetryStep { detail: Some(e.to_string()), ..retry_step(step_name, ManualRetryStatus::Error) });
                continue;
            }
        };
        let available: u64 = utxos.iter().map(|u| u.value_sats).sum();
        if available <= MANUAL_RETRY_FEE_SATS {
            steps.push(ManualRetryStep {
                detail: Some(format!("insufficient balance: {available}")),
                ..retry_step(step_name, ManualRetryStatus::Skipped)
            });
            continue;
        }

        let inputs: Vec<SweepInput> =
            utxos.into_iter().map(|u| SweepInput { txid: u.txid, vout: u.vout, value_sats: u.value_sats }).collect();

        let signed = match signer.sign_sweep(secret.expose(), chain.network, &inputs, &destination, MANUAL_RETRY_FEE_SATS) {
            Ok(s) => s,
            Err(e) => {
                steps.push(ManualRetryStep { detail: Some(e.to_string()), ..retry_step(step_name, ManualRetryStatus::Error) });
                continue;
            }
        };
        drop(secret);

        let txid = match chain_client.broadcast_transaction(&signed.tx_hex).await {
            Ok(t) => t,
            Err(e) => {
                steps.push(ManualRetryStep { detail: Some(e.to_string()), ..retry_step(step_name, ManualRetryStatus::Error) });
                continue;
            }
        };

        if i == 0 {
            store.set_chain_received(chain_id, available).await?;
            store.set_hop_funded(hops[0].id, &txid, signed.amount_sats, tip, tip).await?;
        } else {
            store.set_hop_relayed(hops[i - 1].id, &txid, signed.amount_sats, MANUAL_RETRY_FEE_SATS).await?;
            if i < hops.len() {
                store.set_hop_funded(hops[i].id, &txid, signed.amount_sats, tip, tip).await?;
            }
        }
        store
            .append(
                chain_id,
                None,
                EventKind::ManualRelay,
                Some(&txid),
                Some(signed.amount_sats),
                Some(MANUAL_RETRY_FEE_SATS),
                Some(tip),
                Some(&format!("manual relay from {step_name}")),
            )
            .await?;

        steps.push(ManualRetryStep {
            txid: Some(txid),
            amount_sats: Some(signed.amount_sats),
            destination: Some(destination),
            ..retry_step(step_name, ManualRetryStatus::Success)
        });
    }

    Ok(steps)
}

/// Report produced by the `fix-status` control-surface operation, mirroring
/// the original's `/api/chains/<id>/fix-status`.
#[derive(Debug, Clone, Serialize)]
pub struct FixStatusReport {
    pub chain_id: i64,
    pub fixes: Vec<String>,
}

/// Walk a chain comparing actual on-chain balances to stored hop/chain
/// status, correcting hops whose downstream address is already funded
/// (infers `relayed`) and marking the chain `completed` if `final` is
/// funded. A one-shot reconciliation independent of the cycling engine,
/// for chains whose keys were used outside of fibrelay.
pub async fn fix_status(store: &Store, chain_client: &dyn ChainClient, chain_id: i64) -> Result<FixStatusReport> {
    let chain = store.get_chain(chain_id).await?.ok_or_else(|| anyhow!("chain {chain_id} not found"))?;
    let hops = store.list_hops(chain_id).await?;
    let mut fixes = Vec::new();

    for (i, hop) in hops.iter().enumerate() {
        if hop.status == HopStatus::Relayed {
            continue;
        }
        let own_balance = chain_client.get_address_balance(&hop.address).await.map_err(|e| anyhow!("{e}"))?;
        if own_balance.has_any_funds() {
            continue;
        }
        let next_address = if i + 1 < hops.len() { hops[i + 1].address.as_str() } else { chain.final_address.as_str() };
        let next_balance = chain_client.get_address_balance(next_address).await.map_err(|e| anyhow!("{e}"))?;
        if next_balance.has_any_funds() {
            store.force_hop_relayed(hop.id).await?;
            fixes.push(format!("hop {}: {:?} -> relayed", hop.hop_number + 1, hop.status));
        }
    }

    let final_balance = chain_client.get_address_balance(&chain.final_address).await.map_err(|e| anyhow!("{e}"))?;
    if final_balance.confirmed_sats > 0 && chain.status != ChainStatus::Completed {
        store.mark_chain_completed(chain_id, final_balance.confirmed_sats as u64).await?;
        fixes.push(format!("chain status: {:?} -> completed", chain.status));

        for hop in &hops {
            if hop.status != HopStatus::Relayed {
                store.force_hop_relayed(hop.id).await?;
                fixes.push(format!("hop {}: forced to relayed", hop.hop_number + 1));
            }
        }
    }

    Ok(FixStatusReport { chain_id, fixes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fibrelay_chain::{ChainClientError, TransactionInfo, UtxoInfo};
    use fibrelay_fees::{FeeEstimate, FeeOracle as FeeOracleTrait, FeePriority, FeeSchedule};
    use fibrelay_signer::{KeyPair, SignedSweep, SignerError};
    use fibrelay_storage::{NewChain, NewHop};
    use std::collections::HashMap as Map;
    use std::sync::atomic::AtomicU64;

    const PASSWORD: &str = "test-vault-password";

    #[derive(Default)]
    struct MockState {
        tip: u64,
        balances: Map<String, AddressBalance>,
        utxos: Map<String, Vec<UtxoInfo>>,
        broadcasts: Vec<String>,
        reject_broadcasts: bool,
    }

    struct MockChainClient {
        state: StdMutex<MockState>,
        txid_counter: AtomicU64,
    }

    impl MockChainClient {
        fn new(tip: u64) -> Self {
            Self { state: StdMutex::new(MockState { tip, ..Default::default() }), txid_counter: AtomicU64::new(0) }
        }

        fn set_balance(&self, address: &str, confirmed: i64, unconfirmed: i64) {
            self.state
                .lock()
                .unwrap()
                .balances
                .insert(address.to_string(), AddressBalance { confirmed_sats: confirmed, unconfirmed_sats: unconfirmed });
        }

        fn set_utxos(&self, address: &str, utxos: Vec<UtxoInfo>) {
            self.state.lock().unwrap().utxos.insert(address.to_string(), utxos);
        }

        fn set_tip(&self, tip: u64) {
            self.state.lock().unwrap().tip = tip;
        }

        fn broadcast_count(&self) -> usize {
            self.state.lock().unwrap().broadcasts.len()
        }

        fn reject_broadcasts(&self, reject: bool) {
            self.state.lock().unwrap().reject_broadcasts = reject;
        }
    }

    #[async_trait]
    impl ChainClient for MockChainClient {
        async fn get_block_height(&self) -> std::result::Result<u64, ChainClientError> {
            Ok(self.state.lock().unwrap().tip)
        }

        async fn get_block_hash(&self, _height: u64) -> std::result::Result<String, ChainClientError> {
            Ok("deadbeef".to_string())
        }

        async fn get_address_utxos(&self, address: &str) -> std::result::Result<Vec<UtxoInfo>, ChainClientError> {
            Ok(self.state.lock().unwrap().utxos.get(address).cloned().unwrap_or_default())
        }

        async fn get_address_balance(&self, address: &str) -> std::result::Result<AddressBalance, ChainClientError> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .balances
                .get(address)
                .copied()
                .unwrap_or(AddressBalance { confirmed_sats: 0, unconfirmed_sats: 0 }))
        }

        async fn get_transaction(&self, _txid: &str) -> std::result::Result<Option<TransactionInfo>, ChainClientError> {
            Ok(None)
        }

        async fn broadcast_transaction(&self, tx_hex: &str) -> std::result::Result<String, ChainClientError> {
            let mut state = self.state.lock().unwrap();
            if state.reject_broadcasts {
                return Err(ChainClientError::Unexpected("node rejected transaction".to_string()));
            }
            state.broadcasts.push(tx_hex.to_string());
            let n = self.txid_counter.fetch_add(1, Ordering::SeqCst);
            Ok(format!("mocktxid{n:08}"))
        }
    }

    struct MockSigner;

    impl BitcoinSigner for MockSigner {
        fn generate_keypair(&self, _network: Network) -> std::result::Result<KeyPair, SignerError> {
            unimplemented!("not exercised by engine tests")
        }

        fn address_from_wif(&self, wif: &str, _network: Network) -> std::result::Result<String, SignerError> {
            Ok(wif.to_string())
        }

        fn sign_sweep(
            &self,
            _wif: &str,
            _network: Network,
            inputs: &[SweepInput],
            to_address: &str,
            fee_sats: u64,
        ) -> std::result::Result<SignedSweep, SignerError> {
            let total_in: u64 = inputs.iter().map(|i| i.value_sats).sum();
            if total_in <= fee_sats {
                return Err(SignerError::InsufficientBalance { available: total_in, fee: fee_sats });
            }
            let amount_sats = total_in - fee_sats;
            Ok(SignedSweep {
                tx_hex: format!("rawtx:{to_address}:{amount_sats}"),
                txid: "unused-presigned-txid".to_string(),
                amount_sats,
            })
        }
    }

    struct MockFeeOracle {
        medium_sats: u64,
    }

    #[async_trait]
    impl FeeOracleTrait for MockFeeOracle {
        async fn estimates(&self) -> FeeSchedule {
            let est = |rate: f64, sats: u64, priority: FeePriority| FeeEstimate {
                fee_rate_sat_vb: rate,
                estimated_fee_sats: sats,
                priority,
            };
            FeeSchedule {
                high: est(4.0, self.medium_sats * 2, FeePriority::High),
                medium: est(2.0, self.medium_sats, FeePriority::Medium),
                low: est(1.0, self.medium_sats / 2, FeePriority::Low),
                economy: est(0.5, self.medium_sats / 4, FeePriority::Economy),
            }
        }
    }

    async fn memory_store() -> Store {
        Store::connect("sqlite::memory:").await.unwrap()
    }

    async fn seed_chain(store: &Store, total_hops: u32) -> (Chain, Vec<Hop>) {
        let chain = store
            .insert_chain(&NewChain {
                name: "test chain".into(),
                network: Network::Testnet,
                intake_address: "tb1qintake".into(),
                intake_privkey_encrypted: fibrelay_crypto::encrypt("intake-wif", PASSWORD).unwrap(),
                final_address: "tb1qfinal".into(),
                final_is_generated: false,
                final_privkey_encrypted: None,
                total_hops,
            })
            .await
            .unwrap();

        let delays = fibrelay_core::fibonacci_delays(total_hops);
        let new_hops: Vec<NewHop> = (0..total_hops)
            .map(|i| NewHop {
                hop_number: i,
                address: format!("tb1qhop{i}"),
                privkey_encrypted: fibrelay_crypto::encrypt(&format!("hop{i}-wif"), PASSWORD).unwrap(),
                delay_blocks: delays[i as usize],
            })
            .collect();
        let hops = store.insert_hops(chain.id, &new_hops).await.unwrap();
        store.mark_chain_started(chain.id).await.unwrap();
        let chain = store.get_chain(chain.id).await.unwrap().unwrap();
        (chain, hops)
    }

    fn test_engine(store: Store, chain_client: Arc<MockChainClient>, fee_medium_sats: u64) -> Arc<Engine> {
        Engine::new(EngineParams {
            network: Network::Testnet,
            store,
            chain_client,
            signer: Arc::new(MockSigner),
            fee_oracle: Arc::new(MockFeeOracle { medium_sats: fee_medium_sats }),
            vault_password: Arc::from(PASSWORD),
            poll_interval: Duration::from_millis(10),
        })
    }

    #[tokio::test]
    async fn sweep_from_intake_funds_first_hop() {
        let store = memory_store().await;
        let (chain, hops) = seed_chain(&store, 2).await;

        let client = Arc::new(MockChainClient::new(100));
        client.set_balance(&chain.intake_address, 100_000, 0);
        client.set_utxos(&chain.intake_address, vec![UtxoInfo { txid: "aa".repeat(32), vout: 0, value_sats: 100_000, confirmed_at_block: Some(99) }]);

        let engine = test_engine(store.clone(), client.clone(), 300);
        engine.run_cycle().await;

        assert_eq!(client.broadcast_count(), 1);
        let hop0 = store.get_hop(hops[0].id).await.unwrap().unwrap();
        assert_eq!(hop0.status, HopStatus::PendingRelay);
        assert_eq!(hop0.incoming_amount_sats, Some(100_000 - 300));
        assert_eq!(hop0.relay_at_block, Some(100 + hop0.delay_blocks));

        let reloaded = store.get_chain(chain.id).await.unwrap().unwrap();
        assert_eq!(reloaded.amount_received_sats, Some(100_000));
        assert_eq!(reloaded.current_hop, 0);
    }

    #[tokio::test]
    async fn delay_gate_blocks_premature_sweep_then_allows_it() {
        let store = memory_store().await;
        let (chain, hops) = seed_chain(&store, 2).await;

        let client = Arc::new(MockChainClient::new(100));
        client.set_balance(&chain.intake_address, 100_000, 0);
        client.set_utxos(&chain.intake_address, vec![UtxoInfo { txid: "bb".repeat(32), vout: 0, value_sats: 100_000, confirmed_at_block: Some(99) }]);
        let engine = test_engine(store.clone(), client.clone(), 300);
        engine.run_cycle().await;
        assert_eq!(client.broadcast_count(), 1);

        // Funds now visible at hop0, intake drained; delay for hop0 is fib(0) = 1
        // block, so relay_at_block = 101. Still at tip 100: gate must block.
        client.set_balance(&chain.intake_address, 0, 0);
        client.set_balance(&hops[0].address, 100_000 - 300, 0);
        engine.run_cycle().await;
        assert_eq!(client.broadcast_count(), 1, "sweep must not fire before relay_at_block");
        let status = engine.status();
        assert!(status.processing.get(&chain.id).unwrap().contains("waiting for delay"));

        // Advance the tip past relay_at_block: the gate now opens.
        client.set_tip(101);
        client.set_utxos(&hops[0].address, vec![UtxoInfo { txid: "cc".repeat(32), vout: 0, value_sats: 100_000 - 300, confirmed_at_block: Some(100) }]);
        engine.run_cycle().await;
        assert_eq!(client.broadcast_count(), 2, "sweep should fire once the delay has elapsed");

        let hop0 = store.get_hop(hops[0].id).await.unwrap().unwrap();
        assert_eq!(hop0.status, HopStatus::Relayed);
        let hop1 = store.get_hop(hops[1].id).await.unwrap().unwrap();
        assert_eq!(hop1.status, HopStatus::PendingRelay);
    }

    #[tokio::test]
    async fn insufficient_balance_is_skipped_and_logged() {
        let store = memory_store().await;
        let (chain, _hops) = seed_chain(&store, 2).await;

        let client = Arc::new(MockChainClient::new(50));
        client.set_balance(&chain.intake_address, 150, 0);
        client.set_utxos(&chain.intake_address, vec![UtxoInfo { txid: "dd".repeat(32), vout: 0, value_sats: 150, confirmed_at_block: Some(49) }]);

        let engine = test_engine(store.clone(), client.clone(), 300);
        engine.run_cycle().await;

        assert_eq!(client.broadcast_count(), 0);
        let reloaded = store.get_chain(chain.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, ChainStatus::Active);
        let log = store.list_for_chain(chain.id).await.unwrap();
        assert!(log.iter().any(|e| e.event == EventKind::RelayError));
    }

    #[tokio::test]
    async fn broadcast_rejection_marks_source_hop_failed_then_recovers() {
        let store = memory_store().await;
        let (chain, hops) = seed_chain(&store, 2).await;

        // hop0 already funded and past its delay gate; hop1 is the sweep target.
        store.set_hop_funded(hops[0].id, "inbound-tx", 100_000 - 300, 5, 5).await.unwrap();

        let client = Arc::new(MockChainClient::new(10));
        client.set_balance(&hops[0].address, 100_000 - 300, 0);
        client.set_utxos(&hops[0].address, vec![UtxoInfo { txid: "ff".repeat(32), vout: 0, value_sats: 100_000 - 300, confirmed_at_block: Some(5) }]);
        client.reject_broadcasts(true);

        let engine = test_engine(store.clone(), client.clone(), 300);
        engine.run_cycle().await;

        assert_eq!(client.broadcast_count(), 0, "rejected broadcast must not be recorded as sent");
        let hop0 = store.get_hop(hops[0].id).await.unwrap().unwrap();
        assert_eq!(hop0.status, HopStatus::Failed);
        let log = store.list_for_chain(chain.id).await.unwrap();
        assert!(log.iter().any(|e| e.event == EventKind::RelayError));

        // Next cycle re-derives from live chain state regardless of the
        // `failed` label and succeeds once the node accepts the broadcast.
        client.reject_broadcasts(false);
        engine.run_cycle().await;
        assert_eq!(client.broadcast_count(), 1);
        let hop0 = store.get_hop(hops[0].id).await.unwrap().unwrap();
        assert_eq!(hop0.status, HopStatus::Relayed);
    }

    #[tokio::test]
    async fn reconciliation_is_idempotent_when_chain_state_is_unchanged() {
        let store = memory_store().await;
        let (chain, _hops) = seed_chain(&store, 2).await;

        let client = Arc::new(MockChainClient::new(10));
        // No balance anywhere: nothing to do.
        let engine = test_engine(store.clone(), client.clone(), 300);
        engine.run_cycle().await;
        engine.run_cycle().await;
        assert_eq!(client.broadcast_count(), 0);

        let log = store.list_for_chain(chain.id).await.unwrap();
        assert!(log.is_empty(), "no writes beyond the tip marker expected");
    }

    #[tokio::test]
    async fn completion_detected_when_final_address_is_funded() {
        let store = memory_store().await;
        let (chain, hops) = seed_chain(&store, 1).await;

        // Simulate hop0 already relayed to final by a prior cycle.
        store.set_hop_relayed(hops[0].id, "priortxid", 90_000, 300).await.unwrap();
        store.advance_chain_hop(chain.id, 1, 300).await.unwrap();

        let client = Arc::new(MockChainClient::new(200));
        client.set_balance(&chain.final_address, 90_000, 0);

        let engine = test_engine(store.clone(), client.clone(), 300);
        engine.run_cycle().await;

        let reloaded = store.get_chain(chain.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, ChainStatus::Completed);
        assert_eq!(reloaded.amount_sent_sats, Some(90_000));

        let log = store.list_for_chain(chain.id).await.unwrap();
        assert!(log.iter().any(|e| e.event == EventKind::ChainCompleted));
    }

    #[tokio::test]
    async fn manual_retry_sweeps_a_single_funded_hop_then_reports_no_funds() {
        let store = memory_store().await;
        let (chain, hops) = seed_chain(&store, 2).await;

        // Funds stranded at hop0 because the engine was stopped.
        store.set_hop_funded(hops[0].id, "inbound-tx", 50_000, 10, 10).await.unwrap();

        let client = Arc::new(MockChainClient::new(20));
        client.set_balance(&hops[0].address, 50_000, 0);
        client.set_utxos(&hops[0].address, vec![UtxoInfo { txid: "ee".repeat(32), vout: 0, value_sats: 50_000, confirmed_at_block: Some(10) }]);

        let signer = MockSigner;
        let report = manual_retry_chain(&store, client.as_ref(), &signer, chain.id, PASSWORD).await.unwrap();

        assert_eq!(report.len(), 3); // intake, hop_1, hop_2
        assert_eq!(report[0].status, ManualRetryStatus::NoFunds);
        assert_eq!(report[1].status, ManualRetryStatus::Success);
        assert_eq!(report[2].status, ManualRetryStatus::NoFunds);

        let hop0 = store.get_hop(hops[0].id).await.unwrap().unwrap();
        assert_eq!(hop0.status, HopStatus::Relayed);
    }

    #[tokio::test]
    async fn fix_status_infers_relayed_hop_from_downstream_funding() {
        let store = memory_store().await;
        let (chain, hops) = seed_chain(&store, 1).await;
        store.set_hop_funded(hops[0].id, "inbound-tx", 50_000, 5, 5).await.unwrap();

        let client = MockChainClient::new(10);
        // hop0's own address is now empty, but final is funded: infer relayed.
        client.set_balance(&hops[0].address, 0, 0);
        client.set_balance(&chain.final_address, 49_800, 0);

        let report = fix_status(&store, &client, chain.id).await.unwrap();
        assert!(!report.fixes.is_empty());

        let hop0 = store.get_hop(hops[0].id).await.unwrap().unwrap();
        assert_eq!(hop0.status, HopStatus::Relayed);
        let reloaded = store.get_chain(chain.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, ChainStatus::Completed);
    }

    #[tokio::test]
    async fn handle_start_stop_is_atomic_and_joins_promptly() {
        let store = memory_store().await;
        let client = Arc::new(MockChainClient::new(1));
        let handle = EngineHandle::new();

        handle
            .start(EngineParams {
                network: Network::Testnet,
                store,
                chain_client: client,
                signer: Arc::new(MockSigner),
                fee_oracle: Arc::new(MockFeeOracle { medium_sats: 300 }),
                vault_password: Arc::from(PASSWORD),
                poll_interval: Duration::from_millis(5),
            })
            .await;
        assert!(handle.is_running().await);

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.stop().await.unwrap();
        assert!(!handle.is_running().await);
        assert!(handle.stop().await.is_err(), "stopping twice should report not-running");
    }
}
