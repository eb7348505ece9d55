//! The per-chain capability interface.
//!
//! One [`ChainAdapter`] implementation exists per supported chain and is
//! supplied by the host process at engine start. The engine core never talks
//! to an RPC endpoint directly; everything it needs — deposit listing,
//! submission, confirmations, fee data, the optional on-chain broker — goes
//! through this trait.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::deal::EscrowDeposit;

/// An escrow address together with the opaque handle of its signing key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowRef {
    pub address: String,
    pub key_handle: String,
}

/// Submission options. Account-based chains use the nonce and fee fields;
/// UTXO chains ignore all of them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub nonce: Option<i64>,
    pub gas_price: Option<u64>,
    pub max_fee_per_gas: Option<u64>,
    pub max_priority_fee_per_gas: Option<u64>,
}

/// Current fee data as reported by the chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeeData {
    pub gas_price: Option<u64>,
    pub max_fee_per_gas: Option<u64>,
    pub max_priority_fee_per_gas: Option<u64>,
}

/// What a transaction occupies on its chain: a nonce slot on account-based
/// chains, a set of spent inputs on UTXO chains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NonceOrInputs {
    Nonce { nonce: i64 },
    Inputs { inputs: Vec<String> },
}

impl NonceOrInputs {
    #[must_use]
    pub fn nonce(&self) -> Option<i64> {
        match self {
            Self::Nonce { nonce } => Some(*nonce),
            Self::Inputs { .. } => None,
        }
    }

    /// Canonical key used for collision detection.
    #[must_use]
    pub fn collision_key(&self) -> String {
        match self {
            Self::Nonce { nonce } => format!("nonce:{nonce}"),
            Self::Inputs { inputs } => {
                let mut sorted = inputs.clone();
                sorted.sort();
                format!("inputs:{}", sorted.join(","))
            }
        }
    }
}

/// A successfully broadcast transaction.
#[derive(Debug, Clone)]
pub struct SentTx {
    pub txid: String,
    pub submitted_at: DateTime<Utc>,
    pub nonce_or_inputs: NonceOrInputs,
    pub gas_price: Option<u64>,
    /// Extra transactions when a UTXO payment had to be split.
    pub additional_txids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DepositListing {
    pub deposits: Vec<EscrowDeposit>,
    pub total_confirmed: Decimal,
}

/// Result of the idempotency probe: an equivalent transfer already on-chain.
#[derive(Debug, Clone)]
pub struct ExistingTransfer {
    pub txid: String,
    pub block_number: u64,
}

#[derive(Debug, Clone)]
pub struct GasReceipt {
    pub gas_used: u64,
    pub effective_gas_price: u64,
}

/// Parameters of an atomic broker-contract settlement (swap, revert or
/// refund). The contract splits the amount into payout, commission and
/// surplus internally.
#[derive(Debug, Clone)]
pub struct BrokerSettlement {
    pub escrow: EscrowRef,
    pub asset: String,
    pub amount: Decimal,
    pub payback: String,
    pub recipient: String,
    pub fee_recipient: String,
    pub fees: Decimal,
}

#[async_trait]
pub trait ChainAdapter: Send + Sync + 'static {
    fn chain_id(&self) -> &str;

    fn is_utxo(&self) -> bool;

    /// Confirmations required before a submitted transaction completes.
    fn confirmation_threshold(&self) -> u32;

    /// Confirmations required before a deposit counts towards a lock.
    fn collect_confirms(&self) -> u32;

    fn operator_address(&self) -> String;

    /// The gas-tank wallet, when one is configured for this chain.
    fn tank_address(&self) -> Option<String> {
        None
    }

    fn is_broker_available(&self) -> bool {
        false
    }

    async fn managed_address(&self, escrow: &EscrowRef) -> anyhow::Result<String> {
        Ok(escrow.address.clone())
    }

    /// List deposits to `address` of `asset` with at least `min_confirms`
    /// confirmations, together with the confirmed total.
    async fn list_confirmed_deposits(
        &self,
        asset: &str,
        address: &str,
        min_confirms: u32,
    ) -> anyhow::Result<DepositListing>;

    async fn get_balance(&self, asset: &str, address: &str) -> anyhow::Result<Decimal>;

    async fn send(
        &self,
        asset: &str,
        from: &EscrowRef,
        to: &str,
        amount: Decimal,
        options: SendOptions,
    ) -> anyhow::Result<SentTx>;

    /// `-1` when the transaction is no longer visible (dropped or reorged),
    /// `0` while in the mempool, `k > 0` once mined with `k` confirmations.
    async fn get_tx_confirmations(&self, txid: &str) -> anyhow::Result<i64>;

    /// Account-based chains only.
    async fn get_current_nonce(&self, _address: &str) -> anyhow::Result<i64> {
        bail!("chain {} does not track account nonces", self.chain_id())
    }

    /// Account-based chains only.
    async fn get_current_gas_price(&self) -> anyhow::Result<FeeData> {
        Ok(FeeData::default())
    }

    /// Account-based chains only.
    async fn is_transaction_stuck(&self, _txid: &str) -> anyhow::Result<bool> {
        Ok(false)
    }

    /// Idempotency probe: has an equivalent transfer already been mined?
    async fn check_existing_transfer(
        &self,
        from: &str,
        to: &str,
        asset: &str,
        amount: Decimal,
    ) -> anyhow::Result<Option<ExistingTransfer>>;

    /// Receipt lookup for gas reimbursement.
    async fn get_tx_gas(&self, _txid: &str) -> anyhow::Result<Option<GasReceipt>> {
        Ok(None)
    }

    /// USD rate of the native token, when the adapter has a price source.
    async fn native_usd_rate(&self) -> anyhow::Result<Option<Decimal>> {
        Ok(None)
    }

    /// USD rate of an arbitrary token, when the adapter has a price source.
    async fn token_usd_rate(&self, _asset: &str) -> anyhow::Result<Option<Decimal>> {
        Ok(None)
    }

    async fn swap_via_broker(&self, _params: BrokerSettlement) -> anyhow::Result<SentTx> {
        bail!("no broker contract on chain {}", self.chain_id())
    }

    async fn revert_via_broker(&self, _params: BrokerSettlement) -> anyhow::Result<SentTx> {
        bail!("no broker contract on chain {}", self.chain_id())
    }

    async fn refund_via_broker(&self, _params: BrokerSettlement) -> anyhow::Result<SentTx> {
        bail!("no broker contract on chain {}", self.chain_id())
    }
}

/// Lookup from chain id to adapter, built once at engine start.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ChainAdapter>>,
}

impl AdapterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, adapter: Arc<dyn ChainAdapter>) {
        self.adapters
            .insert(adapter.chain_id().to_owned(), adapter);
    }

    pub fn get(&self, chain_id: &str) -> anyhow::Result<Arc<dyn ChainAdapter>> {
        self.adapters
            .get(chain_id)
            .cloned()
            .ok_or_else(|| anyhow!("no chain adapter registered for {chain_id}"))
    }

    #[must_use]
    pub fn contains(&self, chain_id: &str) -> bool {
        self.adapters.contains_key(chain_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collision_key_is_order_independent_for_inputs() {
        let a = NonceOrInputs::Inputs {
            inputs: vec!["txa:0".into(), "txb:1".into()],
        };
        let b = NonceOrInputs::Inputs {
            inputs: vec!["txb:1".into(), "txa:0".into()],
        };

        assert_eq!(a.collision_key(), b.collision_key());
    }

    #[test]
    fn collision_key_distinguishes_nonces() {
        let a = NonceOrInputs::Nonce { nonce: 7 };
        let b = NonceOrInputs::Nonce { nonce: 8 };

        assert_ne!(a.collision_key(), b.collision_key());
        assert_eq!(a.nonce(), Some(7));
    }
}
