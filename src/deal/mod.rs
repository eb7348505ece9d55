//! The deal aggregate and its satellite types.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::chain::EscrowRef;

pub mod invariants;
pub mod machine;
pub mod planner;

/// Lifecycle stage of a deal. Legal transitions form a directed graph, see
/// [`invariants::valid_transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Created,
    Collection,
    Waiting,
    Swap,
    Reverted,
    Closed,
}

impl From<Stage> for &str {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Created => "CREATED",
            Stage::Collection => "COLLECTION",
            Stage::Waiting => "WAITING",
            Stage::Swap => "SWAP",
            Stage::Reverted => "REVERTED",
            Stage::Closed => "CLOSED",
        }
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(Self::Created),
            "COLLECTION" => Ok(Self::Collection),
            "WAITING" => Ok(Self::Waiting),
            "SWAP" => Ok(Self::Swap),
            "REVERTED" => Ok(Self::Reverted),
            "CLOSED" => Ok(Self::Closed),
            _ => Err(format!("unknown deal stage {s}")),
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", <&str>::from(*self))
    }
}

/// One of the two parties' escrows. Side A belongs to Alice, side B to Bob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    A,
    B,
}

impl Side {
    pub const BOTH: [Self; 2] = [Self::A, Self::B];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "a",
            Self::B => "b",
        }
    }

    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "a" => Ok(Self::A),
            "b" => Ok(Self::B),
            _ => Err(format!("unknown deal side {s}")),
        }
    }
}

/// What one party brings to the table. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideSpec {
    pub chain: String,
    /// Canonical asset code (`SYMBOL.CHAIN`).
    pub asset: String,
    pub amount: Decimal,
}

/// Addresses supplied by a party once it commits to the deal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyDetails {
    /// Receives refunds and surplus.
    pub payback_address: String,
    /// Receives the counter-party's asset on a successful swap.
    pub recipient_address: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommissionMode {
    PercentBps,
    FixedUsdNative,
}

/// Per-side commission requirement, frozen at deal creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommissionRequirement {
    pub mode: CommissionMode,
    /// Basis points, `PercentBps` only.
    pub bps: Option<u32>,
    /// The native (or 1:1 stablecoin) amount frozen at creation,
    /// `FixedUsdNative` only.
    pub fixed_amount: Option<Decimal>,
    /// Canonical code of the asset the commission is collected in.
    pub asset: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommissionPlan {
    pub side_a: CommissionRequirement,
    pub side_b: CommissionRequirement,
}

/// A deposit observed on an escrow address, unique by `(txid, index)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscrowDeposit {
    pub txid: String,
    /// UTXO vout or log index; absent for balance-derived deposits.
    pub index: Option<u32>,
    pub amount: Decimal,
    /// Canonical asset code.
    pub asset: String,
    pub block_height: Option<u64>,
    pub block_time: Option<DateTime<Utc>>,
    pub confirms: u32,
    /// Balance-derived pseudo-deposit emitted by account-based adapters.
    #[serde(default)]
    pub synthetic: bool,
}

/// The two lock timestamps that certify a side has accumulated enough
/// confirmed funds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideLocks {
    pub trade_locked_at: Option<DateTime<Utc>>,
    pub commission_locked_at: Option<DateTime<Utc>>,
}

impl SideLocks {
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.trade_locked_at.is_some() && self.commission_locked_at.is_some()
    }

    pub fn set(&mut self, now: DateTime<Utc>) {
        self.trade_locked_at.get_or_insert(now);
        self.commission_locked_at.get_or_insert(now);
    }

    pub fn clear(&mut self) {
        self.trade_locked_at = None;
        self.commission_locked_at = None;
    }
}

/// Mutable per-side state. Deposits live in their own table and are loaded
/// alongside the deal each tick; they are not part of the persisted JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SideState {
    #[serde(skip)]
    pub deposits: Vec<EscrowDeposit>,
    /// Canonical asset code to collected amount, per the stage-dependent
    /// collection rule.
    #[serde(default)]
    pub collected_by_asset: HashMap<String, Decimal>,
    #[serde(default)]
    pub locks: SideLocks,
}

impl SideState {
    #[must_use]
    pub fn collected(&self, asset: &str) -> Decimal {
        self.collected_by_asset
            .get(asset)
            .copied()
            .unwrap_or_default()
    }

    /// Insert or update by `(txid, index)`; confirmations only move forward
    /// except when the chain reports a reorg.
    pub fn upsert_deposit(&mut self, deposit: EscrowDeposit) {
        match self
            .deposits
            .iter_mut()
            .find(|existing| existing.txid == deposit.txid && existing.index == deposit.index)
        {
            Some(existing) => *existing = deposit,
            None => self.deposits.push(deposit),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GasReimbursementStatus {
    PendingCalculation,
    Calculated,
    Queued,
    Completed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GasCalculation {
    pub actual_gas_used: u64,
    pub gas_price: u64,
    pub estimated_total_gas: u64,
    pub native_cost_wei: Decimal,
    pub native_usd_value: Decimal,
    pub native_usd_rate: Decimal,
    pub token_usd_rate: Decimal,
    pub token_amount: Decimal,
    pub calculated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GasReimbursement {
    pub status: GasReimbursementStatus,
    pub calculation: Option<GasCalculation>,
    pub skip_reason: Option<String>,
}

impl Default for GasReimbursement {
    fn default() -> Self {
        Self {
            status: GasReimbursementStatus::PendingCalculation,
            calculation: None,
            skip_reason: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl From<Severity> for &str {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INFO" => Ok(Self::Info),
            "WARNING" => Ok(Self::Warning),
            "CRITICAL" => Ok(Self::Critical),
            _ => Err(format!("unknown severity {s}")),
        }
    }
}

/// An entry of the append-only per-deal message log.
#[derive(Debug, Clone, PartialEq)]
pub struct DealEvent {
    pub deal_id: String,
    pub severity: Severity,
    pub stage: Option<Stage>,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// The root aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct Deal {
    pub deal_id: String,
    pub stage: Stage,
    pub created_at: DateTime<Utc>,
    pub timeout_seconds: i64,
    /// Set on entering COLLECTION, cleared permanently on entering SWAP.
    pub expires_at: Option<DateTime<Utc>>,
    pub alice_spec: SideSpec,
    pub bob_spec: SideSpec,
    pub commission_plan: CommissionPlan,
    pub escrow_a: Option<EscrowRef>,
    pub escrow_b: Option<EscrowRef>,
    pub alice_details: Option<PartyDetails>,
    pub bob_details: Option<PartyDetails>,
    pub side_a: SideState,
    pub side_b: SideState,
    pub gas_reimbursement: GasReimbursement,
    pub last_stage_at: DateTime<Utc>,
}

impl Deal {
    #[must_use]
    pub fn spec(&self, side: Side) -> &SideSpec {
        match side {
            Side::A => &self.alice_spec,
            Side::B => &self.bob_spec,
        }
    }

    #[must_use]
    pub fn commission(&self, side: Side) -> &CommissionRequirement {
        match side {
            Side::A => &self.commission_plan.side_a,
            Side::B => &self.commission_plan.side_b,
        }
    }

    #[must_use]
    pub fn side(&self, side: Side) -> &SideState {
        match side {
            Side::A => &self.side_a,
            Side::B => &self.side_b,
        }
    }

    pub fn side_mut(&mut self, side: Side) -> &mut SideState {
        match side {
            Side::A => &mut self.side_a,
            Side::B => &mut self.side_b,
        }
    }

    #[must_use]
    pub fn escrow(&self, side: Side) -> Option<&EscrowRef> {
        match side {
            Side::A => self.escrow_a.as_ref(),
            Side::B => self.escrow_b.as_ref(),
        }
    }

    #[must_use]
    pub fn details(&self, side: Side) -> Option<&PartyDetails> {
        match side {
            Side::A => self.alice_details.as_ref(),
            Side::B => self.bob_details.as_ref(),
        }
    }

    /// Who receives the payout leaving this side's escrow: the
    /// counter-party's recipient address.
    #[must_use]
    pub fn swap_recipient(&self, side: Side) -> Option<&str> {
        self.details(side.opposite())
            .map(|details| details.recipient_address.as_str())
    }

    /// Who receives refunds and surplus leaving this side's escrow.
    #[must_use]
    pub fn payback(&self, side: Side) -> Option<&str> {
        self.details(side)
            .map(|details| details.payback_address.as_str())
    }

    #[must_use]
    pub fn both_sides_locked(&self) -> bool {
        self.side_a.locks.is_locked() && self.side_b.locks.is_locked()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_round_trips_through_str() {
        for stage in [
            Stage::Created,
            Stage::Collection,
            Stage::Waiting,
            Stage::Swap,
            Stage::Reverted,
            Stage::Closed,
        ] {
            let s: &str = stage.into();
            assert_eq!(s.parse::<Stage>().unwrap(), stage);
        }

        assert!("SETTLED".parse::<Stage>().is_err());
    }

    #[test]
    fn upsert_deposit_replaces_by_txid_and_index() {
        let mut state = SideState::default();

        let deposit = EscrowDeposit {
            txid: "0xaa".into(),
            index: Some(0),
            amount: Decimal::new(15, 1),
            asset: "ETH.ETH".into(),
            block_height: Some(100),
            block_time: None,
            confirms: 0,
            synthetic: false,
        };

        state.upsert_deposit(deposit.clone());
        state.upsert_deposit(EscrowDeposit {
            confirms: 3,
            ..deposit.clone()
        });
        state.upsert_deposit(EscrowDeposit {
            index: Some(1),
            ..deposit
        });

        assert_eq!(state.deposits.len(), 2);
        assert_eq!(state.deposits[0].confirms, 3);
    }

    #[test]
    fn locks_set_is_sticky() {
        let mut locks = SideLocks::default();
        let t1 = Utc::now();
        locks.set(t1);
        let t2 = t1 + chrono::Duration::seconds(30);
        locks.set(t2);

        assert_eq!(locks.trade_locked_at, Some(t1));
        assert!(locks.is_locked());

        locks.clear();
        assert!(!locks.is_locked());
    }

    #[test]
    fn swap_recipient_crosses_sides() {
        let deal = test_support::deal_with_details();

        assert_eq!(deal.swap_recipient(Side::A), Some("bob-recv"));
        assert_eq!(deal.swap_recipient(Side::B), Some("alice-recv"));
        assert_eq!(deal.payback(Side::A), Some("alice-back"));
    }
}

#[cfg(test)]
pub mod test_support {
    use std::str::FromStr;

    use super::*;

    /// A two-sided ETH/USDC deal with details and escrows filled in.
    #[must_use]
    pub fn deal_with_details() -> Deal {
        let now = Utc::now();

        Deal {
            deal_id: "deal-1".into(),
            stage: Stage::Created,
            created_at: now,
            timeout_seconds: 3600,
            expires_at: None,
            alice_spec: SideSpec {
                chain: "ETH".into(),
                asset: "ETH.ETH".into(),
                amount: Decimal::from_str("1.5").unwrap(),
            },
            bob_spec: SideSpec {
                chain: "ETH".into(),
                asset: "USDC.ETH".into(),
                amount: Decimal::from_str("3000").unwrap(),
            },
            commission_plan: CommissionPlan {
                side_a: CommissionRequirement {
                    mode: CommissionMode::PercentBps,
                    bps: Some(30),
                    fixed_amount: None,
                    asset: "ETH.ETH".into(),
                },
                side_b: CommissionRequirement {
                    mode: CommissionMode::PercentBps,
                    bps: Some(30),
                    fixed_amount: None,
                    asset: "USDC.ETH".into(),
                },
            },
            escrow_a: Some(EscrowRef {
                address: "escrow-a".into(),
                key_handle: "key-a".into(),
            }),
            escrow_b: Some(EscrowRef {
                address: "escrow-b".into(),
                key_handle: "key-b".into(),
            }),
            alice_details: Some(PartyDetails {
                payback_address: "alice-back".into(),
                recipient_address: "alice-recv".into(),
            }),
            bob_details: Some(PartyDetails {
                payback_address: "bob-back".into(),
                recipient_address: "bob-recv".into(),
            }),
            side_a: SideState::default(),
            side_b: SideState::default(),
            gas_reimbursement: GasReimbursement::default(),
            last_stage_at: now,
        }
    }
}
