//! Stateless predicates over deals and deposits.
//!
//! Everything in this module is a pure function; the stage machine and the
//! planner own all side effects.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::decimal::{clamp_non_negative, floor_dp};
use crate::deal::{CommissionMode, CommissionRequirement, Deal, EscrowDeposit, Stage};

/// The legal stage graph.
///
/// `WAITING -> COLLECTION` and `SWAP -> COLLECTION` are the reorg rollbacks;
/// everything else moves forward. `CLOSED` is terminal.
#[must_use]
pub fn valid_transition(from: Stage, to: Stage) -> bool {
    matches!(
        (from, to),
        (Stage::Created, Stage::Collection)
            | (Stage::Collection, Stage::Waiting | Stage::Reverted)
            | (Stage::Waiting, Stage::Swap | Stage::Collection)
            | (Stage::Swap, Stage::Closed | Stage::Collection)
            | (Stage::Reverted, Stage::Closed)
    )
}

/// Deposits that count towards a lock: confirmed deeply enough, and mined
/// no later than the deal expiry. Deposits without a known block time pass
/// the time filter.
#[must_use]
pub fn eligible_deposits(
    deposits: &[EscrowDeposit],
    min_confirms: u32,
    expires_at: Option<DateTime<Utc>>,
) -> Vec<EscrowDeposit> {
    deposits
        .iter()
        .filter(|deposit| deposit.confirms >= min_confirms)
        .filter(|deposit| match (deposit.block_time, expires_at) {
            (Some(block_time), Some(expiry)) => block_time <= expiry,
            _ => true,
        })
        .cloned()
        .collect()
}

/// Sum deposit amounts per canonical asset code.
#[must_use]
pub fn sum_by_asset(deposits: &[EscrowDeposit]) -> HashMap<String, Decimal> {
    let mut sums: HashMap<String, Decimal> = HashMap::new();
    for deposit in deposits {
        *sums.entry(deposit.asset.clone()).or_default() += deposit.amount;
    }
    sums
}

#[derive(Debug, Clone, PartialEq)]
pub struct LockEvaluation {
    pub trade_locked: bool,
    pub commission_locked: bool,
    pub trade_collected: Decimal,
    pub commission_collected: Decimal,
    pub eligible: Vec<EscrowDeposit>,
}

impl LockEvaluation {
    #[must_use]
    pub fn fully_locked(&self) -> bool {
        self.trade_locked && self.commission_locked
    }
}

/// Evaluate one side's lock state over its deposits.
///
/// When the commission is collected in the trade asset it must be funded on
/// top of the trade amount — the commission never comes out of the trade
/// amount itself.
#[must_use]
#[allow(clippy::too_many_arguments)]
pub fn check_locks(
    deposits: &[EscrowDeposit],
    trade_asset: &str,
    trade_amount: Decimal,
    commission_asset: &str,
    commission_amount: Decimal,
    min_confirms: u32,
    expires_at: Option<DateTime<Utc>>,
) -> LockEvaluation {
    let eligible = eligible_deposits(deposits, min_confirms, expires_at);
    let sums = sum_by_asset(&eligible);

    let trade_collected = sums.get(trade_asset).copied().unwrap_or_default();
    let trade_locked = trade_collected >= trade_amount;

    let (commission_collected, commission_locked) = if commission_asset == trade_asset {
        (
            trade_collected,
            trade_collected >= trade_amount + commission_amount,
        )
    } else {
        let collected = sums.get(commission_asset).copied().unwrap_or_default();
        (collected, collected >= commission_amount)
    };

    LockEvaluation {
        trade_locked,
        commission_locked,
        trade_collected,
        commission_collected,
        eligible,
    }
}

/// What remains for the payback address after trade (and, same-asset,
/// commission) are taken out. Never negative.
#[must_use]
pub fn calculate_surplus(
    collected: Decimal,
    trade: Decimal,
    commission: Decimal,
    same_asset: bool,
) -> Decimal {
    let required = if same_asset { trade + commission } else { trade };
    clamp_non_negative(collected - required)
}

/// The operator commission owed for a trade amount, rounded down to the
/// asset's declared decimals.
#[must_use]
pub fn compute_commission(
    trade_amount: Decimal,
    requirement: &CommissionRequirement,
    asset_decimals: u32,
    fixed_fee: Option<Decimal>,
) -> Decimal {
    match requirement.mode {
        CommissionMode::PercentBps => {
            let bps = Decimal::from(requirement.bps.unwrap_or_default());
            let percentage = floor_dp(
                trade_amount * bps / Decimal::from(10_000),
                asset_decimals,
            );
            percentage + fixed_fee.unwrap_or_default()
        }
        CommissionMode::FixedUsdNative => requirement.fixed_amount.unwrap_or_default(),
    }
}

/// Structural validation run before a deal is advanced. A failing deal is
/// held in place and surfaced as a CRITICAL event.
pub fn validate_deal(deal: &Deal) -> Result<(), Vec<String>> {
    let mut violations = Vec::new();

    if deal.alice_spec.amount <= Decimal::ZERO {
        violations.push("side a trade amount must be positive".to_owned());
    }
    if deal.bob_spec.amount <= Decimal::ZERO {
        violations.push("side b trade amount must be positive".to_owned());
    }
    if deal.timeout_seconds <= 0 {
        violations.push("timeout must be positive".to_owned());
    }

    match deal.stage {
        Stage::Collection => {
            if deal.expires_at.is_none() {
                violations.push("COLLECTION deal has no expiry".to_owned());
            }
        }
        Stage::Waiting | Stage::Swap => {
            if deal.alice_details.is_none() || deal.bob_details.is_none() {
                violations.push(format!("{} deal is missing party details", deal.stage));
            }
            if deal.escrow_a.is_none() || deal.escrow_b.is_none() {
                violations.push(format!("{} deal is missing escrow addresses", deal.stage));
            }
            if deal.stage == Stage::Swap {
                if deal.expires_at.is_some() {
                    violations.push("SWAP deal still has an expiry".to_owned());
                }
                if !deal.both_sides_locked() {
                    violations.push("SWAP deal is not locked on both sides".to_owned());
                }
            }
        }
        Stage::Created | Stage::Reverted | Stage::Closed => {}
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use chrono::Duration;
    use test_case::test_case;

    use super::*;
    use crate::deal::test_support::deal_with_details;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn deposit(txid: &str, asset: &str, amount: &str, confirms: u32) -> EscrowDeposit {
        EscrowDeposit {
            txid: txid.into(),
            index: None,
            amount: d(amount),
            asset: asset.into(),
            block_height: Some(100),
            block_time: None,
            confirms,
            synthetic: false,
        }
    }

    const ALL_STAGES: [Stage; 6] = [
        Stage::Created,
        Stage::Collection,
        Stage::Waiting,
        Stage::Swap,
        Stage::Reverted,
        Stage::Closed,
    ];

    #[test]
    fn transition_graph_is_exact() {
        let legal = [
            (Stage::Created, Stage::Collection),
            (Stage::Collection, Stage::Waiting),
            (Stage::Collection, Stage::Reverted),
            (Stage::Waiting, Stage::Swap),
            (Stage::Waiting, Stage::Collection),
            (Stage::Swap, Stage::Closed),
            (Stage::Swap, Stage::Collection),
            (Stage::Reverted, Stage::Closed),
        ];

        for from in ALL_STAGES {
            for to in ALL_STAGES {
                assert_eq!(
                    valid_transition(from, to),
                    legal.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn closed_is_terminal() {
        for to in ALL_STAGES {
            assert!(!valid_transition(Stage::Closed, to));
        }
    }

    #[test]
    fn eligibility_needs_confirmations() {
        let deposits = vec![
            deposit("a", "ETH.ETH", "1", 3),
            deposit("b", "ETH.ETH", "1", 2),
        ];

        let eligible = eligible_deposits(&deposits, 3, None);
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].txid, "a");

        // min_confirms = 0 admits everything
        assert_eq!(eligible_deposits(&deposits, 0, None).len(), 2);
    }

    #[test]
    fn eligibility_time_boundary_is_inclusive() {
        let expiry = Utc::now();

        let at_expiry = EscrowDeposit {
            block_time: Some(expiry),
            ..deposit("a", "ETH.ETH", "1", 6)
        };
        let after_expiry = EscrowDeposit {
            block_time: Some(expiry + Duration::seconds(1)),
            ..deposit("b", "ETH.ETH", "1", 6)
        };
        let unknown_time = deposit("c", "ETH.ETH", "1", 6);

        let eligible = eligible_deposits(
            &[at_expiry, after_expiry, unknown_time],
            1,
            Some(expiry),
        );

        let txids: Vec<_> = eligible.iter().map(|dep| dep.txid.as_str()).collect();
        assert_eq!(txids, vec!["a", "c"]);
    }

    #[test]
    fn same_asset_commission_must_not_eat_the_trade() {
        // 3000 USDC trade + 9 USDC commission in the same asset:
        // exactly 3000 locks the trade but not the commission.
        let deposits = vec![deposit("a", "USDC.ETH", "3000", 6)];

        let eval = check_locks(&deposits, "USDC.ETH", d("3000"), "USDC.ETH", d("9"), 3, None);
        assert!(eval.trade_locked);
        assert!(!eval.commission_locked);
        assert_eq!(eval.trade_collected, d("3000"));

        let deposits = vec![
            deposit("a", "USDC.ETH", "3000", 6),
            deposit("b", "USDC.ETH", "9", 6),
        ];
        let eval = check_locks(&deposits, "USDC.ETH", d("3000"), "USDC.ETH", d("9"), 3, None);
        assert!(eval.fully_locked());
    }

    #[test]
    fn foreign_asset_commission_is_checked_separately() {
        let deposits = vec![
            deposit("a", "USDC.ETH", "3000", 6),
            deposit("b", "ETH.ETH", "0.01", 6),
        ];

        let eval = check_locks(
            &deposits,
            "USDC.ETH",
            d("3000"),
            "ETH.ETH",
            d("0.005"),
            3,
            None,
        );

        assert!(eval.fully_locked());
        assert_eq!(eval.commission_collected, d("0.01"));

        let eval = check_locks(
            &deposits,
            "USDC.ETH",
            d("3000"),
            "ETH.ETH",
            d("0.02"),
            3,
            None,
        );
        assert!(eval.trade_locked);
        assert!(!eval.commission_locked);
    }

    #[test_case("3009", "3000", "9", true, "0" ; "exact same asset")]
    #[test_case("3020", "3000", "9", true, "11" ; "surplus same asset")]
    #[test_case("3000", "3000", "9", true, "0" ; "shortfall clamps to zero")]
    #[test_case("3100", "3000", "9", false, "100" ; "foreign commission ignored")]
    fn surplus_math(collected: &str, trade: &str, commission: &str, same: bool, expected: &str) {
        assert_eq!(
            calculate_surplus(d(collected), d(trade), d(commission), same),
            d(expected)
        );
    }

    #[test]
    fn percent_commission_rounds_down_to_asset_decimals() {
        let requirement = CommissionRequirement {
            mode: CommissionMode::PercentBps,
            bps: Some(30),
            fixed_amount: None,
            asset: "USDC.ETH".into(),
        };

        // 0.3% of 3000 USDC
        assert_eq!(compute_commission(d("3000"), &requirement, 6, None), d("9"));
        // 0.3% of 1.5 ETH
        let requirement = CommissionRequirement {
            asset: "ETH.ETH".into(),
            ..requirement
        };
        assert_eq!(
            compute_commission(d("1.5"), &requirement, 18, None),
            d("0.0045")
        );

        // A 6-decimal asset truncates: 0.3% of 1234.5678 = 3.7037034
        assert_eq!(
            compute_commission(d("1234.5678"), &requirement, 6, None),
            d("3.703703")
        );
    }

    #[test]
    fn erc20_fixed_fee_adds_to_percentage() {
        let requirement = CommissionRequirement {
            mode: CommissionMode::PercentBps,
            bps: Some(30),
            fixed_amount: None,
            asset: "USDC.ETH".into(),
        };

        assert_eq!(
            compute_commission(d("3000"), &requirement, 6, Some(d("1"))),
            d("10")
        );
    }

    #[test]
    fn fixed_usd_commission_uses_frozen_amount() {
        let requirement = CommissionRequirement {
            mode: CommissionMode::FixedUsdNative,
            bps: None,
            fixed_amount: Some(d("0.002")),
            asset: "ETH.ETH".into(),
        };

        assert_eq!(
            compute_commission(d("999"), &requirement, 18, None),
            d("0.002")
        );
    }

    #[test]
    fn structural_validation_flags_inconsistent_swap() {
        let mut deal = deal_with_details();
        deal.stage = Stage::Swap;
        deal.expires_at = Some(Utc::now());

        let violations = validate_deal(&deal).unwrap_err();
        assert!(violations.iter().any(|v| v.contains("expiry")));
        assert!(violations.iter().any(|v| v.contains("locked")));

        deal.expires_at = None;
        deal.side_a.locks.set(Utc::now());
        deal.side_b.locks.set(Utc::now());
        assert!(validate_deal(&deal).is_ok());
    }

    #[test]
    fn structural_validation_accepts_fresh_deal() {
        let deal = deal_with_details();
        assert!(validate_deal(&deal).is_ok());
    }
}
