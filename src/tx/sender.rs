//! Payout execution: builds, signs and broadcasts maker transfers

use super::gas::GasPricer;
use super::queue::{SendBackend, SendFailure, SendOutcome, SendRequest, SentTransfer};
use crate::chain::{erc20, ChainAdapter, ChainBackend, ChainProfile, ChainRegistry, RollupClient, RollupTransfer};
use crate::codec::closest_packable_amount;
use crate::config::MakerConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::pool::parse_address;
use crate::retry::{PollStatus, Poller};

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, TransactionRequest, U256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Signing keys of the makers this instance pays out for
#[derive(Debug, Default)]
pub struct MakerKeys {
    wallets: HashMap<Address, LocalWallet>,
}

impl MakerKeys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load keys from the environment variables named in `makers`.
    ///
    /// Makers whose variable is unset are skipped with a warning; payouts for
    /// them fail until the key is provided.
    pub fn from_configs(makers: &[MakerConfig]) -> RelayerResult<Self> {
        let mut keys = Self::new();

        for maker in makers {
            let address = parse_address(&maker.address)?;
            let key = match std::env::var(&maker.private_key_env) {
                Ok(key) => key,
                Err(_) => {
                    warn!(
                        "No private key in {} for maker {:?}",
                        maker.private_key_env, address
                    );
                    continue;
                }
            };

            let wallet = key
                .trim()
                .parse::<LocalWallet>()
                .map_err(|e| RelayerError::Wallet(format!("Invalid private key for {:?}: {}", address, e)))?;
            if wallet.address() != address {
                return Err(RelayerError::Wallet(format!(
                    "Key in {} belongs to {:?}, not {:?}",
                    maker.private_key_env,
                    wallet.address(),
                    address
                )));
            }

            info!("Loaded signing key for maker {:?}", address);
            keys.insert(wallet);
        }

        Ok(keys)
    }

    pub fn insert(&mut self, wallet: LocalWallet) {
        self.wallets.insert(wallet.address(), wallet);
    }

    pub fn get(&self, maker: Address) -> RelayerResult<&LocalWallet> {
        self.wallets
            .get(&maker)
            .ok_or_else(|| RelayerError::Wallet(format!("No signing key for maker {:?}", maker)))
    }

    pub fn len(&self) -> usize {
        self.wallets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wallets.is_empty()
    }
}

/// Sends payouts on EVM chains and zk-rollups
pub struct SettlementExecutor {
    registry: Arc<ChainRegistry>,
    keys: MakerKeys,
    gas: GasPricer,
    poller: Poller,
}

impl SettlementExecutor {
    pub fn new(registry: Arc<ChainRegistry>, keys: MakerKeys, poller: Poller) -> Self {
        Self {
            registry,
            keys,
            gas: GasPricer::new(),
            poller,
        }
    }

    async fn send_evm(
        &self,
        profile: &ChainProfile,
        adapter: &dyn ChainAdapter,
        request: &SendRequest,
        nonce: u64,
    ) -> SendOutcome {
        let chain_id = profile.chain_id;
        let wallet = self
            .keys
            .get(request.maker)
            .map_err(SendFailure::before_broadcast)?;

        self.check_balance(adapter, request)
            .await
            .map_err(SendFailure::before_broadcast)?;

        let gas_price = self
            .gas
            .gas_price(&profile.gas, adapter)
            .await
            .map_err(SendFailure::before_broadcast)?;

        let tx = build_transfer(profile, request, nonce, gas_price);

        let signature = wallet
            .clone()
            .with_chain_id(profile.network_id)
            .sign_transaction(&tx)
            .await
            .map_err(|e| {
                SendFailure::at_broadcast(RelayerError::Wallet(format!("Signing failed: {}", e)), nonce)
            })?;
        let raw = tx.rlp_signed(&signature);

        match adapter.send_raw_transaction(raw).await {
            Ok(hash) => {
                info!(
                    "Payout for {} sent on chain {}: {:?} (nonce {})",
                    request.identity, chain_id, hash, nonce
                );
                Ok(SentTransfer {
                    tx_hash: format!("{:?}", hash),
                    amount: request.amount,
                    nonce,
                })
            }
            Err(e @ RelayerError::InsufficientBalance { .. }) => Err(SendFailure::before_broadcast(e)),
            Err(e) => Err(SendFailure::at_broadcast(e, nonce)),
        }
    }

    /// The maker must hold more than the payout, and anything at all
    async fn check_balance(
        &self,
        adapter: &dyn ChainAdapter,
        request: &SendRequest,
    ) -> RelayerResult<()> {
        let balance = if request.token.is_zero() {
            adapter.get_balance(request.maker).await?
        } else {
            adapter.get_token_balance(request.token, request.maker).await?
        };

        if balance.is_zero() || balance < request.amount {
            warn!(
                "Maker {:?} balance {} on chain {} cannot cover {}",
                request.maker, balance, request.chain_id, request.amount
            );
            return Err(RelayerError::InsufficientBalance {
                chain_id: request.chain_id,
                have: balance.to_string(),
                need: request.amount.to_string(),
            });
        }
        Ok(())
    }

    async fn send_rollup(
        &self,
        client: &dyn RollupClient,
        request: &SendRequest,
        nonce: u64,
    ) -> SendOutcome {
        let amount = closest_packable_amount(request.amount);
        if amount != request.amount {
            debug!(
                "Payout for {} packed from {} to {}",
                request.identity, request.amount, amount
            );
        }

        let transfer = RollupTransfer {
            from: request.maker,
            to: request.recipient,
            token: request.token,
            amount,
            nonce,
        };

        match client.transfer(transfer).await {
            Ok(tx_hash) => {
                info!(
                    "Payout for {} sent on rollup {}: {} (nonce {})",
                    request.identity, request.chain_id, tx_hash, nonce
                );
                Ok(SentTransfer {
                    tx_hash,
                    amount,
                    nonce,
                })
            }
            Err(e) => Err(SendFailure::at_broadcast(e, nonce)),
        }
    }

    /// Register the maker's rollup signing key if it has none yet
    async fn ensure_signing_key(&self, client: &dyn RollupClient, maker: Address) -> RelayerResult<()> {
        let chain_id = client.chain_id();
        if client.is_signing_key_set(maker).await? {
            return Ok(());
        }
        if client.account_id(maker).await?.is_none() {
            return Err(RelayerError::Rollup {
                chain_id,
                message: format!("Unknown account {:?}", maker),
            });
        }

        let hash = client.set_signing_key(maker).await?;
        info!("Setting signing key for {:?} on rollup {}: {}", maker, chain_id, hash);

        let label = format!("signing key registration {} on chain {}", hash, chain_id);
        let hash = hash.as_str();
        self.poller
            .poll_until(&label, || async move {
                Ok(match client.tx_receipt(hash).await? {
                    Some(receipt) if receipt.is_confirmed() => PollStatus::Ready(()),
                    _ => PollStatus::Pending,
                })
            })
            .await
    }
}

/// Legacy transfer of `request.amount` to the recipient, native or ERC-20
fn build_transfer(
    profile: &ChainProfile,
    request: &SendRequest,
    nonce: u64,
    gas_price: U256,
) -> TypedTransaction {
    let tx = TransactionRequest::new()
        .from(request.maker)
        .nonce(nonce)
        .gas(profile.gas.gas_limit)
        .gas_price(gas_price)
        .chain_id(profile.network_id);

    let tx = if request.token.is_zero() {
        tx.to(request.recipient).value(request.amount)
    } else {
        tx.to(request.token)
            .data(erc20::transfer_calldata(request.recipient, request.amount))
    };

    TypedTransaction::Legacy(tx)
}

#[async_trait]
impl SendBackend for SettlementExecutor {
    async fn prepare(&self, request: &SendRequest) -> RelayerResult<()> {
        match &self.registry.get(request.chain_id)?.backend {
            ChainBackend::Rollup(client) => self.ensure_signing_key(client.as_ref(), request.maker).await,
            ChainBackend::Evm(_) => Ok(()),
        }
    }

    async fn live_nonce(&self, chain_id: u64, maker: Address) -> RelayerResult<u64> {
        match &self.registry.get(chain_id)?.backend {
            ChainBackend::Evm(adapter) => adapter.get_transaction_count(maker).await,
            ChainBackend::Rollup(client) => client.committed_nonce(maker).await,
        }
    }

    async fn send(&self, request: &SendRequest, nonce: u64) -> SendOutcome {
        let entry = self
            .registry
            .get(request.chain_id)
            .map_err(SendFailure::before_broadcast)?;

        let outcome = match &entry.backend {
            ChainBackend::Evm(adapter) => {
                self.send_evm(&entry.profile, adapter.as_ref(), request, nonce)
                    .await
            }
            ChainBackend::Rollup(client) => self.send_rollup(client.as_ref(), request, nonce).await,
        };

        match &outcome {
            Ok(_) => crate::metrics::record_tx_submitted(request.chain_id),
            Err(failure) => crate::metrics::record_tx_failed(request.chain_id, failure.error.kind()),
        }
        outcome
    }
}
