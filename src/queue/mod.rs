//! Queue items: one row per planned outgoing transaction.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::chain::{EscrowRef, NonceOrInputs};

pub mod confirmations;
pub mod processor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Purpose {
    SwapPayout,
    OpCommission,
    SurplusRefund,
    TimeoutRefund,
    GasRefundToTank,
    GasReimbursement,
    BrokerSwap,
    BrokerRevert,
    BrokerRefund,
}

impl Purpose {
    /// Broker purposes are handed to the adapter's broker-submit call and
    /// bypass nonce reservation.
    #[must_use]
    pub fn is_broker(self) -> bool {
        matches!(
            self,
            Self::BrokerSwap | Self::BrokerRevert | Self::BrokerRefund
        )
    }

    /// Purposes that pay out the counter-party's trade.
    #[must_use]
    pub fn is_swap_payout(self) -> bool {
        matches!(self, Self::SwapPayout | Self::BrokerSwap)
    }
}

impl From<Purpose> for &str {
    fn from(purpose: Purpose) -> Self {
        match purpose {
            Purpose::SwapPayout => "SWAP_PAYOUT",
            Purpose::OpCommission => "OP_COMMISSION",
            Purpose::SurplusRefund => "SURPLUS_REFUND",
            Purpose::TimeoutRefund => "TIMEOUT_REFUND",
            Purpose::GasRefundToTank => "GAS_REFUND_TO_TANK",
            Purpose::GasReimbursement => "GAS_REIMBURSEMENT",
            Purpose::BrokerSwap => "BROKER_SWAP",
            Purpose::BrokerRevert => "BROKER_REVERT",
            Purpose::BrokerRefund => "BROKER_REFUND",
        }
    }
}

impl FromStr for Purpose {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SWAP_PAYOUT" => Ok(Self::SwapPayout),
            "OP_COMMISSION" => Ok(Self::OpCommission),
            "SURPLUS_REFUND" => Ok(Self::SurplusRefund),
            "TIMEOUT_REFUND" => Ok(Self::TimeoutRefund),
            "GAS_REFUND_TO_TANK" => Ok(Self::GasRefundToTank),
            "GAS_REIMBURSEMENT" => Ok(Self::GasReimbursement),
            "BROKER_SWAP" => Ok(Self::BrokerSwap),
            "BROKER_REVERT" => Ok(Self::BrokerRevert),
            "BROKER_REFUND" => Ok(Self::BrokerRefund),
            _ => Err(format!("unknown queue purpose {s}")),
        }
    }
}

impl std::fmt::Display for Purpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", <&str>::from(*self))
    }
}

/// UTXO ordering constraint. Phase N+1 items may not submit until every
/// phase-N item of the deal is COMPLETED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Phase1Swap,
    Phase2Commission,
    Phase3Refund,
}

impl Phase {
    #[must_use]
    pub fn as_i16(self) -> i16 {
        match self {
            Self::Phase1Swap => 1,
            Self::Phase2Commission => 2,
            Self::Phase3Refund => 3,
        }
    }

    #[must_use]
    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            1 => Some(Self::Phase1Swap),
            2 => Some(Self::Phase2Commission),
            3 => Some(Self::Phase3Refund),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    Pending,
    Submitted,
    Completed,
}

impl From<ItemStatus> for &str {
    fn from(status: ItemStatus) -> Self {
        match status {
            ItemStatus::Pending => "PENDING",
            ItemStatus::Submitted => "SUBMITTED",
            ItemStatus::Completed => "COMPLETED",
        }
    }
}

impl FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "SUBMITTED" => Ok(Self::Submitted),
            "COMPLETED" => Ok(Self::Completed),
            _ => Err(format!("unknown queue item status {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxStatus {
    Pending,
    Confirmed,
    Dropped,
    Replaced,
}

/// Reference to a broadcast transaction, persisted with the queue item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxRef {
    pub chain: String,
    pub txid: String,
    pub submitted_at: DateTime<Utc>,
    pub confirms: i64,
    pub required_confirms: u32,
    pub status: TxStatus,
    pub nonce_or_inputs: NonceOrInputs,
    /// UTXO multi-input split: every constituent must confirm.
    #[serde(default)]
    pub additional_txids: Vec<String>,
    pub gas_used: Option<u64>,
    pub gas_price: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub id: i64,
    pub deal_id: String,
    pub chain: String,
    pub from: EscrowRef,
    pub to: String,
    pub asset: String,
    pub amount: Decimal,
    pub purpose: Purpose,
    pub phase: Option<Phase>,
    /// Strictly increasing per `(deal_id, from.address)`, assigned at
    /// enqueue.
    pub seq: i64,
    pub status: ItemStatus,
    pub payback: Option<String>,
    pub recipient: Option<String>,
    pub fee_recipient: Option<String>,
    pub fees: Option<Decimal>,
    pub submitted_tx: Option<TxRef>,
    pub gas_bump_attempts: i32,
    pub last_submit_at: Option<DateTime<Utc>>,
    pub original_nonce: Option<i64>,
    pub last_gas_price: Option<u64>,
    pub payout_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for [`crate::database::methods::DbMethods::enqueue_item`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewQueueItem {
    pub deal_id: String,
    pub chain: String,
    pub from: EscrowRef,
    pub to: String,
    pub asset: String,
    pub amount: Decimal,
    pub purpose: Purpose,
    pub phase: Option<Phase>,
    pub payback: Option<String>,
    pub recipient: Option<String>,
    pub fee_recipient: Option<String>,
    pub fees: Option<Decimal>,
    pub payout_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayoutStatus {
    Pending,
    Confirmed,
}

/// Aggregates the queue items that together fulfil one logical payment
/// (UTXO multi-transaction payouts only).
#[derive(Debug, Clone, PartialEq)]
pub struct Payout {
    pub id: i64,
    pub deal_id: String,
    pub chain: String,
    pub required_confirms: u32,
    pub status: PayoutStatus,
    pub created_at: DateTime<Utc>,
}

/// Group PENDING items by `(chain, sender)` keeping ascending `seq` order
/// within each group.
#[must_use]
pub fn group_pending(items: Vec<QueueItem>) -> BTreeMap<(String, String), Vec<QueueItem>> {
    let mut groups: BTreeMap<(String, String), Vec<QueueItem>> = BTreeMap::new();
    for item in items {
        groups
            .entry((item.chain.clone(), item.from.address.clone()))
            .or_default()
            .push(item);
    }
    for group in groups.values_mut() {
        group.sort_by_key(|item| item.seq);
    }
    groups
}

/// Queue-integrity check over the nonces of SUBMITTED (non-REPLACED) items.
///
/// Duplicates are always a violation. A gap — either between the submitted
/// nonces themselves or between the last confirmed nonce and the lowest
/// submitted one — means an earlier submission was lost and the account
/// state must be re-synced from the chain.
#[must_use]
pub fn validate_nonce_sequence(submitted: &[i64], last_confirmed: Option<i64>) -> bool {
    if submitted.is_empty() {
        return true;
    }

    let mut sorted = submitted.to_vec();
    sorted.sort_unstable();

    for pair in sorted.windows(2) {
        if pair[0] == pair[1] {
            return false;
        }
        if pair[1] - pair[0] != 1 {
            return false;
        }
    }

    match last_confirmed {
        Some(confirmed) => sorted[0] <= confirmed + 1,
        None => true,
    }
}

/// The nonce the next reservation must hand out for the queue to stay
/// contiguous.
#[must_use]
pub fn expected_nonce(highest_queued: Option<i64>, next_nonce: i64) -> i64 {
    match highest_queued {
        Some(highest) => (highest + 1).max(next_nonce),
        None => next_nonce,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(chain: &str, sender: &str, seq: i64) -> QueueItem {
        QueueItem {
            id: seq,
            deal_id: "deal-1".into(),
            chain: chain.into(),
            from: EscrowRef {
                address: sender.into(),
                key_handle: "key".into(),
            },
            to: "to".into(),
            asset: "ETH.ETH".into(),
            amount: Decimal::ONE,
            purpose: Purpose::SwapPayout,
            phase: None,
            seq,
            status: ItemStatus::Pending,
            payback: None,
            recipient: None,
            fee_recipient: None,
            fees: None,
            submitted_tx: None,
            gas_bump_attempts: 0,
            last_submit_at: None,
            original_nonce: None,
            last_gas_price: None,
            payout_id: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn grouping_is_per_sender_and_seq_ordered() {
        let items = vec![
            item("ETH", "0xaa", 2),
            item("ETH", "0xbb", 0),
            item("ETH", "0xaa", 0),
            item("UNICITY", "u1", 1),
            item("ETH", "0xaa", 1),
        ];

        let groups = group_pending(items);

        assert_eq!(groups.len(), 3);
        let seqs: Vec<_> = groups[&("ETH".to_string(), "0xaa".to_string())]
            .iter()
            .map(|item| item.seq)
            .collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn nonce_sequence_accepts_contiguous_runs() {
        assert!(validate_nonce_sequence(&[], None));
        assert!(validate_nonce_sequence(&[5], None));
        assert!(validate_nonce_sequence(&[5, 6, 7], Some(4)));
        assert!(validate_nonce_sequence(&[7, 5, 6], Some(6)));
    }

    #[test]
    fn nonce_sequence_rejects_duplicates_and_gaps() {
        assert!(!validate_nonce_sequence(&[5, 5], None));
        assert!(!validate_nonce_sequence(&[5, 7], None));
        // confirmed 3, lowest submitted 5: nonce 4 went missing
        assert!(!validate_nonce_sequence(&[5, 6], Some(3)));
    }

    #[test]
    fn expected_nonce_prefers_the_queue_head() {
        assert_eq!(expected_nonce(None, 9), 9);
        assert_eq!(expected_nonce(Some(11), 9), 12);
        assert_eq!(expected_nonce(Some(5), 9), 9);
    }

    #[test]
    fn purpose_round_trips_through_str() {
        for purpose in [
            Purpose::SwapPayout,
            Purpose::OpCommission,
            Purpose::SurplusRefund,
            Purpose::TimeoutRefund,
            Purpose::GasRefundToTank,
            Purpose::GasReimbursement,
            Purpose::BrokerSwap,
            Purpose::BrokerRevert,
            Purpose::BrokerRefund,
        ] {
            let s: &str = purpose.into();
            assert_eq!(s.parse::<Purpose>().unwrap(), purpose);
        }
    }

    #[test]
    fn phases_order_and_convert() {
        assert!(Phase::Phase1Swap < Phase::Phase2Commission);
        assert!(Phase::Phase2Commission < Phase::Phase3Refund);
        for phase in [
            Phase::Phase1Swap,
            Phase::Phase2Commission,
            Phase::Phase3Refund,
        ] {
            assert_eq!(Phase::from_i16(phase.as_i16()), Some(phase));
        }
        assert_eq!(Phase::from_i16(4), None);
    }
}
