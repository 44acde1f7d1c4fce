//! The application facade: owns the Store, Vault password, engine handle,
//! chain clients, signer, and fee oracles, and implements every control
//! surface operation as a plain async method.
//!
//! Grounded on `dxid-node::run_node` for wiring shape (load
//! config, build collaborators, hand them to a long-running driver) and on
//! the original prototype's `RelayService` (`app.py`) for the operation set
//! itself (`create_chain`, `get_chain_status`, `cancel_chain`,
//! `activate_chain`, `manual_relay_chain`, `fix_chain_status`,
//! `export_chain_keys`, fee preview).

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use fibrelay_chain::{AddressBalance, ChainClient, EsploraChainClient};
use fibrelay_config::FibrelayConfig;
use fibrelay_core::{
    estimate_relay_timing, fibonacci_delays, settings_keys, validate_address, Chain, ChainStatus,
    Error as CoreError, EventKind, Hop, Network, RelayTiming, MAX_HOPS, MIN_HOPS,
};
use fibrelay_engine::{
    manual_retry_chain, EngineHandle, EngineParams, EngineStatus, FixStatusReport, ManualRetryStep,
};
use fibrelay_fees::{estimate_total_fees, FeeOracle, FeePriority, FeeSchedule, MempoolFeeOracle, TotalFeeEstimate};
use fibrelay_signer::{BitcoinSigner, Secp256k1Signer};
use fibrelay_storage::{ChainStore, HopStore, LogStore, NewChain, NewHop, SettingsStore, Store};
use serde::{Deserialize, Serialize};

pub type AppResult<T> = std::result::Result<T, CoreError>;

fn db_err(e: anyhow::Error) -> CoreError {
    CoreError::Fatal(e.to_string())
}

/// Request body for `create_chain` (`POST /api/chains`).
#[derive(Debug, Clone, Deserialize)]
pub struct CreateChainRequest {
    #[serde(default)]
    pub name: Option<String>,
    pub network: Network,
    pub num_hops: u32,
    #[serde(default)]
    pub final_address: Option<String>,
    #[serde(default)]
    pub fee_priority: Option<FeePriority>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateChainResponse {
    pub chain: Option<Chain>,
    pub intake_address: String,
    pub final_address: String,
    pub delay_schedule: Vec<u64>,
    pub dry_run: bool,
}

/// Chain + hops + live balances, for `get_chain` (the chain detail view,
/// with live intake/final address balances).
#[derive(Debug, Clone, Serialize)]
pub struct ChainDetail {
    pub chain: Chain,
    pub hops: Vec<Hop>,
    pub intake_balance: AddressBalance,
    pub final_balance: AddressBalance,
    pub processing_status: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportedKey {
    pub address: String,
    pub wif: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportedKeys {
    pub chain_id: i64,
    pub intake: ExportedKey,
    pub hops: Vec<ExportedKey>,
    pub final_key: Option<ExportedKey>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeePreviewResponse {
    pub schedule: FeeSchedule,
    pub preview: Option<TotalFeeEstimate>,
    pub timing: Option<RelayTiming>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub network: Network,
    pub engine_running: bool,
    pub last_error: Option<String>,
    pub chains_processing: HashMap<i64, String>,
}

/// Owns every collaborator the control surface needs and drives the
/// lifecycle of the single active [`EngineHandle`]: the process owns one
/// in-memory engine handle at a time.
pub struct App {
    config: FibrelayConfig,
    store: Store,
    signer: Arc<dyn BitcoinSigner>,
    chain_clients: HashMap<Network, Arc<dyn ChainClient>>,
    fee_oracles: HashMap<Network, Arc<dyn FeeOracle>>,
    vault_password: Arc<str>,
    engine: EngineHandle,
}

impl App {
    /// Wire up real collaborators from config and start the engine on
    /// whichever network was last active (or the config default on first
    /// run).
    pub async fn new(config: FibrelayConfig) -> Result<Self> {
        let store = Store::connect(&config.database_path)
            .await
            .with_context(|| format!("opening database at {}", config.database_path))?;
        let vault_password: Arc<str> = Arc::from(config.vault.resolve_password()?);
        let signer: Arc<dyn BitcoinSigner> = Arc::new(Secp256k1Signer::new());

        let mut chain_clients: HashMap<Network, Arc<dyn ChainClient>> = HashMap::new();
        let mut fee_oracles: HashMap<Network, Arc<dyn FeeOracle>> = HashMap::new();
        for network in [Network::Testnet, Network::Mainnet] {
            chain_clients.insert(
                network,
                Arc::new(EsploraChainClient::new(config.chain_client.base_url_for(network))) as Arc<dyn ChainClient>,
            );
            fee_oracles.insert(
                network,
                Arc::new(MempoolFeeOracle::with_base_url(network, config.fee_oracle.base_url_for(network)))
                    as Arc<dyn FeeOracle>,
            );
        }

        let app = Self { config, store, signer, chain_clients, fee_oracles, vault_password, engine: EngineHandle::new() };
        app.bootstrap_active_network().await?;
        Ok(app)
    }

    /// Construct an `App` from already-built collaborators rather than a
    /// config-driven wiring pass. Used by this crate's own tests and by
    /// `fibrelay-server`'s router tests, both of which need to substitute a
    /// mock `ChainClient`/`FeeOracle` for the real network adapters.
    pub async fn new_for_tests(
        config: FibrelayConfig,
        store: Store,
        signer: Arc<dyn BitcoinSigner>,
        chain_clients: HashMap<Network, Arc<dyn ChainClient>>,
        fee_oracles: HashMap<Network, Arc<dyn FeeOracle>>,
    ) -> Result<Self> {
        let vault_password: Arc<str> = Arc::from(config.vault.resolve_password()?);
        let app = Self { config, store, signer, chain_clients, fee_oracles, vault_password, engine: EngineHandle::new() };
        app.bootstrap_active_network().await?;
        Ok(app)
    }

    async fn bootstrap_active_network(&self) -> Result<()> {
        let network = self.active_network().await?;
        self.start_engine_for(network).await;
        Ok(())
    }

    fn chain_client(&self, network: Network) -> Arc<dyn ChainClient> {
        self.chain_clients.get(&network).expect("chain client configured for every network").clone()
    }

    fn fee_oracle(&self, network: Network) -> Arc<dyn FeeOracle> {
        self.fee_oracles.get(&network).expect("fee oracle configured for every network").clone()
    }

    async fn start_engine_for(&self, network: Network) {
        let params = EngineParams {
            network,
            store: self.store.clone(),
            chain_client: self.chain_client(network),
            signer: self.signer.clone(),
            fee_oracle: self.fee_oracle(network),
            vault_password: self.vault_password.clone(),
            poll_interval: self.config.engine.poll_interval(),
        };
        self.engine.start(params).await;
    }

    /// The network the engine is currently driving, persisted in `settings`
    /// so it survives a restart.
    pub async fn active_network(&self) -> Result<Network> {
        match self.store.get_setting(settings_keys::ACTIVE_NETWORK).await? {
            Some(s) => Ok(s.parse()?),
            None => {
                self.store
                    .set_setting(settings_keys::ACTIVE_NETWORK, self.config.active_network.as_str())
                    .await?;
                Ok(self.config.active_network)
            }
        }
    }

    /// `POST /api/network`: persist the new active network and restart the
    /// engine on it (`EngineHandle::start` tears down the previous one
    /// atomically).
    pub async fn switch_network(&self, network: Network) -> Result<()> {
        self.store.set_setting(settings_keys::ACTIVE_NETWORK, network.as_str()).await?;
        self.start_engine_for(network).await;
        Ok(())
    }

    /// `POST /api/engine/start`.
    pub async fn engine_start(&self) -> Result<()> {
        let network = self.active_network().await?;
        self.start_engine_for(network).await;
        Ok(())
    }

    /// `POST /api/engine/stop`.
    pub async fn engine_stop(&self) -> std::result::Result<(), fibrelay_engine::EngineError> {
        self.engine.stop().await
    }

    /// `GET /api/status`.
    pub async fn status(&self) -> StatusResponse {
        let network = self.active_network().await.unwrap_or(self.config.active_network);
        let engine_status: Option<EngineStatus> = self.engine.status().await;
        StatusResponse {
            network,
            engine_running: self.engine.is_running().await,
            last_error: engine_status.as_ref().and_then(|s| s.last_error.clone()),
            chains_processing: engine_status.map(|s| s.processing).unwrap_or_default(),
        }
    }

    async fn get_chain_or_not_found(&self, id: i64) -> AppResult<Chain> {
        self.store.get_chain(id).await.map_err(db_err)?.ok_or_else(|| CoreError::NotFound(format!("chain {id}")))
    }

    /// `POST /api/chains`: generate intake/hop/final keys, encrypt them,
    /// and persist the chain `pending` (or, if `dry_run`, just compute and
    /// return the schedule without touching the Store).
    pub async fn create_chain(&self, req: CreateChainRequest) -> AppResult<CreateChainResponse> {
        if !(MIN_HOPS..=MAX_HOPS).contains(&req.num_hops) {
            return Err(CoreError::InvalidInput(format!(
                "num_hops must be between {MIN_HOPS} and {MAX_HOPS}, got {}",
                req.num_hops
            )));
        }
        let delays = fibonacci_delays(req.num_hops);

        let intake_pair = self.signer.generate_keypair(req.network).map_err(|e| CoreError::Fatal(e.to_string()))?;
        let mut hop_pairs = Vec::with_capacity(req.num_hops as usize);
        for _ in 0..req.num_hops {
            hop_pairs.push(self.signer.generate_keypair(req.network).map_err(|e| CoreError::Fatal(e.to_string()))?);
        }

        let (final_address, final_is_generated, final_pair) = match &req.final_address {
            Some(addr) => {
                if !validate_address(addr, req.network) {
                    return Err(CoreError::InvalidInput(format!("invalid final address for {}: {addr}", req.network)));
                }
                (addr.clone(), false, None)
            }
            None => {
                let pair = self.signer.generate_keypair(req.network).map_err(|e| CoreError::Fatal(e.to_string()))?;
                let addr = pair.address.clone();
                (addr, true, Some(pair))
            }
        };

        if req.dry_run {
            return Ok(CreateChainResponse {
                chain: None,
                intake_address: intake_pair.address,
                final_address,
                delay_schedule: delays,
                dry_run: true,
            });
        }

        let intake_privkey_encrypted = fibrelay_crypto::encrypt(&intake_pair.wif, &self.vault_password)
            .map_err(|e| CoreError::Fatal(format!("vault encrypt failed: {e}")))?;
        let final_privkey_encrypted = match &final_pair {
            Some(pair) => Some(
                fibrelay_crypto::encrypt(&pair.wif, &self.vault_password)
                    .map_err(|e| CoreError::Fatal(format!("vault encrypt failed: {e}")))?,
            ),
            None => None,
        };

        let chain = self
            .store
            .insert_chain(&NewChain {
                name: req.name.unwrap_or_else(|| "unnamed relay".to_string()),
                network: req.network,
                intake_address: intake_pair.address.clone(),
                intake_privkey_encrypted,
                final_address: final_address.clone(),
                final_is_generated,
                final_privkey_encrypted,
                total_hops: req.num_hops,
            })
            .await
            .map_err(db_err)?;

        let mut new_hops = Vec::with_capacity(hop_pairs.len());
        for (i, pair) in hop_pairs.iter().enumerate() {
            let privkey_encrypted = fibrelay_crypto::encrypt(&pair.wif, &self.vault_password)
                .map_err(|e| CoreError::Fatal(format!("vault encrypt failed: {e}")))?;
            new_hops.push(NewHop { hop_number: i as u32, address: pair.address.clone(), privkey_encrypted, delay_blocks: delays[i] });
        }
        self.store.insert_hops(chain.id, &new_hops).await.map_err(db_err)?;
        self.store
            .append(
                chain.id,
                None,
                EventKind::ChainCreated,
                None,
                None,
                None,
                None,
                Some(&format!("{} hops on {}", req.num_hops, req.network)),
            )
            .await
            .map_err(db_err)?;

        Ok(CreateChainResponse { chain: Some(chain), intake_address: intake_pair.address, final_address, delay_schedule: delays, dry_run: false })
    }

    /// `GET /api/chains`.
    pub async fn list_chains(&self, network: Option<Network>) -> AppResult<Vec<Chain>> {
        self.store.list_chains(network).await.map_err(db_err)
    }

    /// `GET /api/chains/{id}`.
    pub async fn get_chain(&self, id: i64) -> AppResult<ChainDetail> {
        let chain = self.get_chain_or_not_found(id).await?;
        let hops = self.store.list_hops(id).await.map_err(db_err)?;
        let client = self.chain_client(chain.network);
        let intake_balance = client
            .get_address_balance(&chain.intake_address)
            .await
            .map_err(|e| CoreError::TransientNetwork(e.to_string()))?;
        let final_balance = client
            .get_address_balance(&chain.final_address)
            .await
            .map_err(|e| CoreError::TransientNetwork(e.to_string()))?;
        let processing_status = self
            .engine
            .status()
            .await
            .filter(|s| s.network == Some(chain.network))
            .and_then(|s| s.processing.get(&id).cloned());
        Ok(ChainDetail { chain, hops, intake_balance, final_balance, processing_status })
    }

    /// `POST /api/chains/{id}/activate`: `pending` -> `active`.
    pub async fn activate_chain(&self, id: i64) -> AppResult<Chain> {
        let chain = self.get_chain_or_not_found(id).await?;
        if chain.status != ChainStatus::Pending {
            return Err(CoreError::InvalidInput(format!("chain {id} is {:?}, only pending chains can be activated", chain.status)));
        }
        self.store.mark_chain_started(id).await.map_err(db_err)?;
        self.store
            .append(id, None, EventKind::ChainActivated, None, None, None, None, None)
            .await
            .map_err(db_err)?;
        self.get_chain_or_not_found(id).await
    }

    /// `POST /api/chains/{id}/cancel`: accepted only from `pending` or
    /// `active`.
    pub async fn cancel_chain(&self, id: i64) -> AppResult<Chain> {
        let chain = self.get_chain_or_not_found(id).await?;
        if !matches!(chain.status, ChainStatus::Pending | ChainStatus::Active) {
            return Err(CoreError::InvalidInput(format!("chain {id} cannot be cancelled from status {:?}", chain.status)));
        }
        self.store.set_chain_status(id, ChainStatus::Cancelled, None).await.map_err(db_err)?;
        self.store
            .append(id, None, EventKind::ChainCancelled, None, None, None, None, None)
            .await
            .map_err(db_err)?;
        self.get_chain_or_not_found(id).await
    }

    /// `POST /api/chains/{id}/retry`: the one-shot manual recovery walk,
    /// independent of the engine.
    pub async fn retry_chain(&self, id: i64) -> AppResult<Vec<ManualRetryStep>> {
        let chain = self.get_chain_or_not_found(id).await?;
        let client = self.chain_client(chain.network);
        manual_retry_chain(&self.store, client.as_ref(), self.signer.as_ref(), id, &self.vault_password)
            .await
            .map_err(|e| CoreError::TransientNetwork(e.to_string()))
    }

    /// `POST /api/chains/{id}/fix-status`.
    pub async fn fix_status(&self, id: i64) -> AppResult<FixStatusReport> {
        let chain = self.get_chain_or_not_found(id).await?;
        let client = self.chain_client(chain.network);
        fibrelay_engine::fix_status(&self.store, client.as_ref(), id)
            .await
            .map_err(|e| CoreError::TransientNetwork(e.to_string()))
    }

    /// `POST /api/chains/{id}/export`: decrypt every key under this chain
    /// with the supplied password. Any single decrypt failure aborts the
    /// whole export with `DecryptFailed` rather than returning a partial
    /// set — the caller learns nothing about which keys, if any, would
    /// have decrypted correctly.
    pub async fn export_keys(&self, id: i64, password: &str) -> AppResult<ExportedKeys> {
        let chain = self.get_chain_or_not_found(id).await?;
        let hops = self.store.list_hops(id).await.map_err(db_err)?;

        let intake = decrypt_export(&chain.intake_address, &chain.intake_privkey_encrypted, password)?;
        let mut hop_keys = Vec::with_capacity(hops.len());
        for hop in &hops {
            hop_keys.push(decrypt_export(&hop.address, &hop.privkey_encrypted, password)?);
        }
        let final_key = match &chain.final_privkey_encrypted {
            Some(enc) => Some(decrypt_export(&chain.final_address, enc, password)?),
            None => None,
        };

        Ok(ExportedKeys { chain_id: id, intake, hops: hop_keys, final_key })
    }

    /// `POST /api/fees/estimate` / `GET /api/fees`.
    pub async fn fee_preview(&self, network: Network, num_hops: Option<u32>, priority: FeePriority) -> FeePreviewResponse {
        let schedule = self.fee_oracle(network).estimates().await;
        let preview = num_hops.map(|n| estimate_total_fees(n, schedule.for_priority(priority)));
        let timing = num_hops.map(|n| estimate_relay_timing(n, self.config.engine.avg_block_minutes));
        FeePreviewResponse { schedule, preview, timing }
    }

    /// `POST /api/address/validate`.
    pub fn validate_address(&self, address: &str, network: Network) -> bool {
        validate_address(address, network)
    }

    /// `POST /api/address/balance`.
    pub async fn address_balance(&self, address: &str, network: Network) -> AppResult<AddressBalance> {
        self.chain_client(network)
            .get_address_balance(address)
            .await
            .map_err(|e| CoreError::TransientNetwork(e.to_string()))
    }

    /// Configure the master-password verifier (settings key
    /// `password_verifier`). Rejects a second call, matching the
    /// original's duplicate-setup guard.
    pub async fn vault_set_password(&self, password: &str) -> AppResult<()> {
        if self.store.get_setting(settings_keys::PASSWORD_VERIFIER).await.map_err(db_err)?.is_some() {
            return Err(CoreError::InvalidInput("vault password is already configured".into()));
        }
        let hash = fibrelay_crypto::generate_password_hash(password);
        self.store.set_setting(settings_keys::PASSWORD_VERIFIER, &hash).await.map_err(db_err)?;
        Ok(())
    }

    /// Check a candidate password against the stored verifier, without
    /// ever exposing the vault's real master password.
    pub async fn vault_verify(&self, password: &str) -> AppResult<bool> {
        match self.store.get_setting(settings_keys::PASSWORD_VERIFIER).await.map_err(db_err)? {
            Some(hash) => Ok(fibrelay_crypto::verify_password_hash(password, &hash)),
            None => Err(CoreError::NotFound("no vault password configured".into())),
        }
    }
}

fn decrypt_export(address: &str, encrypted: &str, password: &str) -> AppResult<ExportedKey> {
    let secret = fibrelay_crypto::decrypt(encrypted, password).map_err(|_| CoreError::DecryptFailed)?;
    Ok(ExportedKey { address: address.to_string(), wif: secret.expose().to_string() })
}
