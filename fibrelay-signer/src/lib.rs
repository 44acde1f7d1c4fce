//! The `BitcoinSigner` abstract interface plus a concrete WIF/P2WPKH
//! adapter built on the `bitcoin` crate, grounded on the original
//! prototype's `WalletManager` (`bitcoin_utils.py`): key generation,
//! WIF-to-address derivation, and single-input sweep transaction signing.

use std::str::FromStr;

use bitcoin::secp256k1::{rand, All, Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{
    absolute::LockTime, Address, OutPoint, PrivateKey, ScriptBuf, Sequence, Transaction, TxIn,
    TxOut, Txid, Witness,
};
use fibrelay_core::Network as FrNetwork;
use thiserror::Error;

fn to_btc_network(network: FrNetwork) -> bitcoin::Network {
    match network {
        FrNetwork::Testnet => bitcoin::Network::Testnet,
        FrNetwork::Mainnet => bitcoin::Network::Bitcoin,
    }
}

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("insufficient balance: have {available} sats, need more than {fee} sats fee")]
    InsufficientBalance { available: u64, fee: u64 },
    #[error("signing failed: {0}")]
    SigningFailed(String),
}

pub struct KeyPair {
    pub address: String,
    pub wif: String,
}

/// One spendable output to sweep, supplied by the engine after it reads
/// the hop's confirmed UTXOs from a `ChainClient`.
pub struct SweepInput {
    pub txid: String,
    pub vout: u32,
    pub value_sats: u64,
}

pub struct SignedSweep {
    pub tx_hex: String,
    pub txid: String,
    pub amount_sats: u64,
}

/// Abstract over address generation and transaction signing, matching
/// the original's `WalletManager.generate_key_pair` /
/// `get_address_from_wif` / `create_transaction`.
pub trait BitcoinSigner: Send + Sync {
    fn generate_keypair(&self, network: FrNetwork) -> Result<KeyPair, SignerError>;
    fn address_from_wif(&self, wif: &str, network: FrNetwork) -> Result<String, SignerError>;
    fn sign_sweep(
        &self,
        wif: &str,
        network: FrNetwork,
        inputs: &[SweepInput],
        to_address: &str,
        fee_sats: u64,
    ) -> Result<SignedSweep, SignerError>;
}

/// The reference implementation: single-sig P2WPKH, one key per hop.
pub struct Secp256k1Signer {
    secp: Secp256k1<All>,
}

impl Default for Secp256k1Signer {
    fn default() -> Self {
        Self::new()
    }
}

impl Secp256k1Signer {
    pub fn new() -> Self {
        Self { secp: Secp256k1::new() }
    }
}

impl BitcoinSigner for Secp256k1Signer {
    fn generate_keypair(&self, network: FrNetwork) -> Result<KeyPair, SignerError> {
        let btc_network = to_btc_network(network);
        let secret_key = bitcoin::secp256k1::SecretKey::new(&mut rand::thread_rng());
        let privkey = PrivateKey::new(secret_key, btc_network);
        let pubkey = privkey.public_key(&self.secp);
        let address =
            Address::p2wpkh(&pubkey, btc_network).map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        Ok(KeyPair {
            address: address.to_string(),
            wif: privkey.to_wif(),
        })
    }

    fn address_from_wif(&self, wif: &str, network: FrNetwork) -> Result<String, SignerError> {
        let privkey = PrivateKey::from_wif(wif).map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        let pubkey = privkey.public_key(&self.secp);
        let address = Address::p2wpkh(&pubkey, to_btc_network(network))
            .map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        Ok(address.to_string())
    }

    fn sign_sweep(
        &self,
        wif: &str,
        network: FrNetwork,
        inputs: &[SweepInput],
        to_address: &str,
        fee_sats: u64,
    ) -> Result<SignedSweep, SignerError> {
        let btc_network = to_btc_network(network);
        let privkey = PrivateKey::from_wif(wif).map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        let pubkey = privkey.public_key(&self.secp);
        let to_addr = Address::from_str(to_address)
            .map_err(|e| SignerError::InvalidAddress(e.to_string()))?
            .require_network(btc_network)
            .map_err(|e| SignerError::InvalidAddress(e.to_string()))?;

        let total_in: u64 = inputs.iter().map(|i| i.value_sats).sum();
        if total_in <= fee_sats {
            return Err(SignerError::InsufficientBalance { available: total_in, fee: fee_sats });
        }
        let amount_sats = total_in - fee_sats;

        let tx_ins = inputs
            .iter()
            .map(|i| {
                let txid = Txid::from_str(&i.txid).map_err(|e| SignerError::InvalidKey(e.to_string()))?;
                Ok(TxIn {
                    previous_output: OutPoint::new(txid, i.vout),
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::new(),
                })
            })
            .collect::<Result<Vec<TxIn>, SignerError>>()?;

        let mut tx = Transaction {
            version: 2,
            lock_time: LockTime::ZERO,
            input: tx_ins,
            output: vec![TxOut {
                value: amount_sats,
                script_pubkey: to_addr.script_pubkey(),
            }],
        };

        let script_code = ScriptBuf::new_p2pkh(&pubkey.pubkey_hash());
        {
            let mut sighasher = SighashCache::new(&mut tx);
            for (i, input) in inputs.iter().enumerate() {
                let sighash = sighasher
                    .segwit_signature_hash(i, &script_code, input.value_sats, EcdsaSighashType::All)
                    .map_err(|e| SignerError::SigningFailed(e.to_string()))?;
                let message = Message::from_slice(&sighash[..])
                    .map_err(|e| SignerError::SigningFailed(e.to_string()))?;
                let signature = self.secp.sign_ecdsa(&message, &privkey.inner);
                let mut sig_bytes = signature.serialize_der().to_vec();
                sig_bytes.push(EcdsaSighashType::All as u8);
                *sighasher
                    .witness_mut(i)
                    .ok_or_else(|| SignerError::SigningFailed("missing witness slot".into()))? =
                    Witness::from_slice(&[sig_bytes, pubkey.to_bytes()]);
            }
        }

        let tx_hex = bitcoin::consensus::encode::serialize_hex(&tx);
        let txid = tx.txid().to_string();
        Ok(SignedSweep { tx_hex, txid, amount_sats })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keypair_roundtrips_through_wif() {
        let signer = Secp256k1Signer::new();
        let pair = signer.generate_keypair(FrNetwork::Testnet).unwrap();
        assert!(pair.address.starts_with("tb1"));
        let recovered = signer.address_from_wif(&pair.wif, FrNetwork::Testnet).unwrap();
        assert_eq!(recovered, pair.address);
    }

    #[test]
    fn sweep_rejects_insufficient_balance() {
        let signer = Secp256k1Signer::new();
        let pair = signer.generate_keypair(FrNetwork::Testnet).unwrap();
        let inputs = vec![SweepInput {
            txid: "00".repeat(32),
            vout: 0,
            value_sats: 100,
        }];
        let err = signer
            .sign_sweep(&pair.wif, FrNetwork::Testnet, &inputs, &pair.address, 200)
            .unwrap_err();
        assert!(matches!(err, SignerError::InsufficientBalance { .. }));
    }
}
