//! Builds the ordered set of outgoing transfers for a swap or a revert.
//!
//! Two execution paths exist per side. Chains with a working broker contract
//! settle in a single atomic call that internally splits payout, commission
//! and surplus. Everywhere else the plan is composed of separate queue items
//! submitted in strict order: payout, commission, (gas reimbursement is
//! attached later by the calculator), surplus.

use std::collections::HashMap;

use anyhow::{anyhow, Context};
use rust_decimal::Decimal;

use crate::asset::AssetRegistry;
use crate::chain::EscrowRef;
use crate::deal::{invariants, Deal, Side};
use crate::decimal::{floor_dp, is_dust};
use crate::queue::{NewQueueItem, Phase, Purpose};

/// The slice of per-chain behaviour the planner needs.
#[derive(Debug, Clone)]
pub struct ChainContext {
    pub chain_id: String,
    pub utxo: bool,
    pub broker_available: bool,
    pub operator_address: String,
    pub tank_address: Option<String>,
    pub dust_threshold: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedTransfer {
    pub purpose: Purpose,
    pub from: EscrowRef,
    pub to: String,
    pub asset: String,
    pub amount: Decimal,
    pub phase: Option<Phase>,
    pub payback: Option<String>,
    pub recipient: Option<String>,
    pub fee_recipient: Option<String>,
    pub fees: Option<Decimal>,
}

impl PlannedTransfer {
    #[must_use]
    pub fn into_queue_item(self, deal_id: &str, chain: &str) -> NewQueueItem {
        NewQueueItem {
            deal_id: deal_id.to_owned(),
            chain: chain.to_owned(),
            from: self.from,
            to: self.to,
            asset: self.asset,
            amount: self.amount,
            purpose: self.purpose,
            phase: self.phase,
            payback: self.payback,
            recipient: self.recipient,
            fee_recipient: self.fee_recipient,
            fees: self.fees,
            payout_id: None,
        }
    }
}

/// The commission owed by one side, from the plan frozen at creation.
pub fn commission_for_side(
    deal: &Deal,
    side: Side,
    registry: &AssetRegistry,
) -> anyhow::Result<Decimal> {
    let spec = deal.spec(side);
    let requirement = deal.commission(side);
    let asset = registry.require_asset(&requirement.asset)?;

    // The per-token fixed fee applies only when the commission is collected
    // in the (non-native) trade token itself.
    let fixed_fee = if requirement.asset == spec.asset && asset.contract.is_some() {
        asset.fixed_fee
    } else {
        None
    };

    Ok(invariants::compute_commission(
        spec.amount,
        requirement,
        asset.decimals,
        fixed_fee,
    ))
}

/// Whether this side's commission is embedded into the broker payout rather
/// than funded on top. Only possible when the broker contract settles the
/// side and the commission is collected in the trade asset.
#[must_use]
pub fn commission_is_embedded(deal: &Deal, side: Side, ctx: &ChainContext) -> bool {
    ctx.broker_available && deal.commission(side).asset == deal.spec(side).asset
}

/// The commission amount a side must have *funded* for its locks — zero when
/// the broker deducts it from the payout instead.
pub fn lock_commission_amount(
    deal: &Deal,
    side: Side,
    ctx: &ChainContext,
    registry: &AssetRegistry,
) -> anyhow::Result<Decimal> {
    if commission_is_embedded(deal, side, ctx) {
        Ok(Decimal::ZERO)
    } else {
        commission_for_side(deal, side, registry)
    }
}

fn phase(ctx: &ChainContext, phase: Phase) -> Option<Phase> {
    ctx.utxo.then_some(phase)
}

/// Plan the outgoing transfers for one side of a successful swap.
pub fn plan_swap_side(
    deal: &Deal,
    side: Side,
    ctx: &ChainContext,
    registry: &AssetRegistry,
) -> anyhow::Result<Vec<PlannedTransfer>> {
    let spec = deal.spec(side);
    let requirement = deal.commission(side);
    let escrow = deal
        .escrow(side)
        .with_context(|| format!("side {} has no escrow", side.as_str()))?
        .clone();
    let recipient = deal
        .swap_recipient(side)
        .ok_or_else(|| anyhow!("missing counter-party details"))?
        .to_owned();
    let payback = deal
        .payback(side)
        .ok_or_else(|| anyhow!("missing party details"))?
        .to_owned();

    let commission = commission_for_side(deal, side, registry)?;

    if commission_is_embedded(deal, side, ctx) {
        // One indivisible on-chain call; the contract pays the recipient
        // (amount - fees), the operator the fees and the payback any surplus.
        return Ok(vec![PlannedTransfer {
            purpose: Purpose::BrokerSwap,
            from: escrow,
            to: recipient.clone(),
            asset: spec.asset.clone(),
            amount: spec.amount,
            phase: None,
            payback: Some(payback),
            recipient: Some(recipient),
            fee_recipient: Some(ctx.operator_address.clone()),
            fees: Some(commission),
        }]);
    }

    let mut plan = vec![PlannedTransfer {
        purpose: Purpose::SwapPayout,
        from: escrow.clone(),
        to: recipient.clone(),
        asset: spec.asset.clone(),
        amount: spec.amount,
        phase: phase(ctx, Phase::Phase1Swap),
        payback: None,
        recipient: Some(recipient),
        fee_recipient: None,
        fees: None,
    }];

    if commission > Decimal::ZERO {
        plan.push(PlannedTransfer {
            purpose: Purpose::OpCommission,
            from: escrow.clone(),
            to: ctx.operator_address.clone(),
            asset: requirement.asset.clone(),
            amount: commission,
            phase: phase(ctx, Phase::Phase2Commission),
            payback: None,
            recipient: None,
            fee_recipient: Some(ctx.operator_address.clone()),
            fees: None,
        });
    }

    // Anything above trade + commission goes back where it came from,
    // per asset.
    let mut assets: Vec<&String> = deal.side(side).collected_by_asset.keys().collect();
    assets.sort();
    for asset_code in assets {
        let collected = deal.side(side).collected(asset_code);
        let mut required = Decimal::ZERO;
        if *asset_code == spec.asset {
            required += spec.amount;
        }
        if *asset_code == requirement.asset {
            required += commission;
        }

        let decimals = registry.decimals(asset_code).unwrap_or(18);
        let surplus = floor_dp(
            invariants::calculate_surplus(collected, required, Decimal::ZERO, false),
            decimals,
        );
        if !is_dust(surplus, ctx.dust_threshold) {
            plan.push(PlannedTransfer {
                purpose: Purpose::SurplusRefund,
                from: escrow.clone(),
                to: payback.clone(),
                asset: asset_code.clone(),
                amount: surplus,
                phase: phase(ctx, Phase::Phase3Refund),
                payback: Some(payback.clone()),
                recipient: None,
                fee_recipient: None,
                fees: None,
            });
        }
    }

    Ok(plan)
}

/// Plan refunds for one side of a reverted deal. `confirmed` carries the
/// per-asset sums of confirmed deposits — unconfirmed money is never
/// refunded, it is picked up later by the late-deposit watcher once it
/// confirms.
pub fn plan_revert_side(
    deal: &Deal,
    side: Side,
    ctx: &ChainContext,
    registry: &AssetRegistry,
    confirmed: &HashMap<String, Decimal>,
) -> anyhow::Result<Vec<PlannedTransfer>> {
    let spec = deal.spec(side);
    let Some(escrow) = deal.escrow(side).cloned() else {
        return Ok(Vec::new());
    };
    let Some(payback) = deal.payback(side).map(ToOwned::to_owned) else {
        if confirmed.values().any(|amount| *amount > Decimal::ZERO) {
            return Err(anyhow!(
                "side {} holds funds but supplied no payback address",
                side.as_str()
            ));
        }
        return Ok(Vec::new());
    };

    if ctx.broker_available {
        let trade_collected = confirmed.get(&spec.asset).copied().unwrap_or_default();
        if trade_collected <= ctx.dust_threshold {
            return Ok(Vec::new());
        }

        // The contract refunds the payback address and keeps the operator
        // commission when the side had locked it in.
        let fees = if deal.side(side).locks.commission_locked_at.is_some() {
            commission_for_side(deal, side, registry)?
        } else {
            Decimal::ZERO
        };

        return Ok(vec![PlannedTransfer {
            purpose: Purpose::BrokerRevert,
            from: escrow,
            to: payback.clone(),
            asset: spec.asset.clone(),
            amount: trade_collected,
            phase: None,
            payback: Some(payback),
            recipient: None,
            fee_recipient: Some(ctx.operator_address.clone()),
            fees: Some(fees),
        }]);
    }

    let mut assets: Vec<&String> = confirmed.keys().collect();
    assets.sort();

    let mut plan = Vec::new();
    for asset_code in assets {
        let amount = confirmed.get(asset_code).copied().unwrap_or_default();
        let decimals = registry.decimals(asset_code).unwrap_or(18);
        let amount = floor_dp(amount, decimals);
        if is_dust(amount, ctx.dust_threshold) {
            continue;
        }

        plan.push(PlannedTransfer {
            purpose: Purpose::TimeoutRefund,
            from: escrow.clone(),
            to: payback.clone(),
            asset: asset_code.clone(),
            amount,
            phase: phase(ctx, Phase::Phase3Refund),
            payback: Some(payback.clone()),
            recipient: None,
            fee_recipient: None,
            fees: None,
        });
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::deal::test_support::deal_with_details;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn registry() -> AssetRegistry {
        let config: crate::config::Config = toml::from_str(indoc::indoc! {r#"
            [database]
            database = "postgres://localhost/broker"

            [chains.ETH]
            confirmation_threshold = 3
            collect_confirms = 3
            native_asset = "ETH"

            [chains.UNICITY]
            utxo = true
            native_asset = "ALPHA"

            [[assets]]
            code = "ETH"
            chain = "ETH"
            decimals = 18
            native = true

            [[assets]]
            code = "USDC"
            chain = "ETH"
            decimals = 6
            contract = "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48"

            [[assets]]
            code = "ALPHA"
            chain = "UNICITY"
            decimals = 8
            native = true
        "#})
        .unwrap();

        AssetRegistry::from_config(&config).unwrap()
    }

    fn ctx(broker: bool, utxo: bool) -> ChainContext {
        ChainContext {
            chain_id: if utxo { "UNICITY".into() } else { "ETH".into() },
            utxo,
            broker_available: broker,
            operator_address: "operator".into(),
            tank_address: Some("tank".into()),
            dust_threshold: d("0.000001"),
        }
    }

    #[test]
    fn broker_path_is_one_atomic_item() {
        let deal = deal_with_details();

        // Side B pays out 3000 USDC; 0.3% commission in the same asset is
        // embedded into the broker call.
        let plan = plan_swap_side(&deal, Side::B, &ctx(true, false), &registry()).unwrap();

        assert_eq!(plan.len(), 1);
        let item = &plan[0];
        assert_eq!(item.purpose, Purpose::BrokerSwap);
        assert_eq!(item.amount, d("3000"));
        assert_eq!(item.fees, Some(d("9")));
        assert_eq!(item.to, "alice-recv");
        assert_eq!(item.recipient.as_deref(), Some("alice-recv"));
        assert_eq!(item.payback.as_deref(), Some("bob-back"));
        assert_eq!(item.fee_recipient.as_deref(), Some("operator"));
        // Implied by the contract split: the recipient receives 2991 USDC.
        assert_eq!(item.amount - item.fees.unwrap(), d("2991"));
    }

    #[test]
    fn broker_path_side_a_math() {
        let deal = deal_with_details();

        let plan = plan_swap_side(&deal, Side::A, &ctx(true, false), &registry()).unwrap();

        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].amount, d("1.5"));
        assert_eq!(plan[0].fees, Some(d("0.0045")));
        assert_eq!(plan[0].amount - plan[0].fees.unwrap(), d("1.4955"));
        assert_eq!(plan[0].to, "bob-recv");
    }

    #[test]
    fn fallback_path_orders_payout_commission_surplus() {
        let mut deal = deal_with_details();
        deal.side_b
            .collected_by_asset
            .insert("USDC.ETH".into(), d("3020"));

        let plan = plan_swap_side(&deal, Side::B, &ctx(false, false), &registry()).unwrap();

        let purposes: Vec<_> = plan.iter().map(|item| item.purpose).collect();
        assert_eq!(
            purposes,
            vec![
                Purpose::SwapPayout,
                Purpose::OpCommission,
                Purpose::SurplusRefund
            ]
        );

        assert_eq!(plan[0].amount, d("3000"));
        assert_eq!(plan[0].to, "alice-recv");
        assert_eq!(plan[1].amount, d("9"));
        assert_eq!(plan[1].to, "operator");
        // 3020 - 3000 - 9
        assert_eq!(plan[2].amount, d("11"));
        assert_eq!(plan[2].to, "bob-back");
        assert!(plan.iter().all(|item| item.phase.is_none()));
    }

    #[test]
    fn utxo_items_carry_phases() {
        let mut deal = deal_with_details();
        deal.alice_spec.chain = "UNICITY".into();
        deal.alice_spec.asset = "ALPHA.UNICITY".into();
        deal.alice_spec.amount = d("10");
        deal.commission_plan.side_a.asset = "ALPHA.UNICITY".into();
        deal.side_a
            .collected_by_asset
            .insert("ALPHA.UNICITY".into(), d("10.5"));

        let plan = plan_swap_side(&deal, Side::A, &ctx(false, true), &registry()).unwrap();

        assert_eq!(plan[0].phase, Some(Phase::Phase1Swap));
        assert_eq!(plan[1].phase, Some(Phase::Phase2Commission));
        assert_eq!(plan[2].phase, Some(Phase::Phase3Refund));
    }

    #[test]
    fn zero_commission_is_skipped_at_enqueue() {
        let mut deal = deal_with_details();
        deal.commission_plan.side_b.bps = Some(0);
        deal.side_b
            .collected_by_asset
            .insert("USDC.ETH".into(), d("3000"));

        let plan = plan_swap_side(&deal, Side::B, &ctx(false, false), &registry()).unwrap();

        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].purpose, Purpose::SwapPayout);
    }

    #[test]
    fn dust_surplus_is_not_refunded() {
        let mut deal = deal_with_details();
        deal.side_b
            .collected_by_asset
            .insert("USDC.ETH".into(), d("3009.0000005"));

        let plan = plan_swap_side(&deal, Side::B, &ctx(false, false), &registry()).unwrap();

        assert!(plan
            .iter()
            .all(|item| item.purpose != Purpose::SurplusRefund));
    }

    #[test]
    fn revert_refunds_each_confirmed_asset_in_full() {
        let deal = deal_with_details();

        let confirmed_a = maplit::hashmap! { "ETH.ETH".to_string() => d("1.5") };
        let plan =
            plan_revert_side(&deal, Side::A, &ctx(false, false), &registry(), &confirmed_a)
                .unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].purpose, Purpose::TimeoutRefund);
        assert_eq!(plan[0].amount, d("1.5"));
        assert_eq!(plan[0].to, "alice-back");

        let confirmed_b = maplit::hashmap! { "USDC.ETH".to_string() => d("1000") };
        let plan =
            plan_revert_side(&deal, Side::B, &ctx(false, false), &registry(), &confirmed_b)
                .unwrap();
        assert_eq!(plan[0].amount, d("1000"));
        assert_eq!(plan[0].to, "bob-back");
    }

    #[test]
    fn revert_via_broker_keeps_commission_only_when_locked() {
        let mut deal = deal_with_details();
        let confirmed = maplit::hashmap! { "USDC.ETH".to_string() => d("3009") };

        let plan =
            plan_revert_side(&deal, Side::B, &ctx(true, false), &registry(), &confirmed).unwrap();
        assert_eq!(plan[0].purpose, Purpose::BrokerRevert);
        assert_eq!(plan[0].fees, Some(Decimal::ZERO));

        deal.side_b.locks.set(chrono::Utc::now());
        let plan =
            plan_revert_side(&deal, Side::B, &ctx(true, false), &registry(), &confirmed).unwrap();
        assert_eq!(plan[0].fees, Some(d("9")));
    }

    #[test]
    fn revert_with_no_confirmed_funds_is_empty() {
        let deal = deal_with_details();
        let plan = plan_revert_side(
            &deal,
            Side::A,
            &ctx(false, false),
            &registry(),
            &HashMap::new(),
        )
        .unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn lock_commission_is_zero_when_embedded() {
        let deal = deal_with_details();
        let registry = registry();

        assert_eq!(
            lock_commission_amount(&deal, Side::B, &ctx(true, false), &registry).unwrap(),
            Decimal::ZERO
        );
        assert_eq!(
            lock_commission_amount(&deal, Side::B, &ctx(false, false), &registry).unwrap(),
            d("9")
        );
    }
}
