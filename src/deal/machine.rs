//! The per-deal stage machine, driven once per tick for every active deal.
//!
//! Each handler reads the persisted deal, refreshes deposits through the
//! chain adapter, evaluates the pure predicates from
//! [`crate::deal::invariants`] and commits any stage change together with its
//! queue writes in a single database transaction. A deal whose processing
//! fails is left untouched and retried on the next tick.

use std::collections::{HashMap, HashSet};

use anyhow::Context;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use tracing::{info, instrument, warn};

use crate::app::App;
use crate::database::methods::DbMethods as _;
use crate::deal::planner::{self, ChainContext};
use crate::deal::{invariants, Deal, Severity, Side, Stage};
use crate::decimal::{floor_dp, is_dust};
use crate::queue::{NewQueueItem, Phase, Purpose};
use crate::retry_tx;

#[instrument(level = "debug", skip(app))]
pub async fn tick_deal(app: &App, deal_id: &str) -> anyhow::Result<()> {
    let Some(mut deal) = app.database.get_deal(deal_id).await? else {
        warn!(deal_id, "active deal disappeared");
        return Ok(());
    };

    if let Err(violations) = invariants::validate_deal(&deal) {
        // Structurally corrupt deals are held in place, never advanced.
        app.database
            .add_deal_event(
                deal_id,
                Severity::Critical,
                Some(deal.stage),
                &format!("deal failed structural validation: {}", violations.join("; ")),
            )
            .await?;
        return Ok(());
    }

    match deal.stage {
        Stage::Created => on_created(app, &mut deal).await,
        Stage::Collection => on_collection(app, &mut deal).await,
        Stage::Waiting => on_waiting(app, &mut deal).await,
        Stage::Swap => on_swap(app, &mut deal).await,
        Stage::Reverted => on_reverted(app, &mut deal).await,
        Stage::Closed => Ok(()),
    }
}

/// The slice of adapter behaviour the planner and lock rules need.
pub(crate) fn chain_context(app: &App, chain_id: &str) -> anyhow::Result<ChainContext> {
    let adapter = app.chains.get(chain_id)?;
    let dust_threshold = app
        .assets
        .dust_threshold(chain_id)
        .unwrap_or(app.config.app.dust_threshold);

    Ok(ChainContext {
        chain_id: chain_id.to_owned(),
        utxo: adapter.is_utxo(),
        broker_available: adapter.is_broker_available(),
        operator_address: adapter.operator_address(),
        tank_address: adapter.tank_address(),
        dust_threshold,
    })
}

async fn on_created(app: &App, deal: &mut Deal) -> anyhow::Result<()> {
    refresh_deposits(app, deal).await?;
    evaluate_locks(app, deal).await?;

    let committed = deal.alice_details.is_some()
        && deal.bob_details.is_some()
        && deal.escrow_a.is_some()
        && deal.escrow_b.is_some();

    if committed {
        deal.expires_at = Some(Utc::now() + Duration::seconds(deal.timeout_seconds));
        transition(app, deal, Stage::Collection, "both parties committed, collecting deposits")
            .await?;
        return Ok(());
    }

    persist(app, deal).await
}

async fn on_collection(app: &App, deal: &mut Deal) -> anyhow::Result<()> {
    refresh_deposits(app, deal).await?;
    evaluate_locks(app, deal).await?;

    let mut funded = true;
    for side in Side::BOTH {
        funded &= raw_sufficient(app, deal, side).await?;
    }

    if funded {
        // Timer is suspended, not cleared: the preserved expiry is the
        // fall-back if a reorg sends us back here.
        transition(
            app,
            deal,
            Stage::Waiting,
            "both sides funded, waiting for confirmations",
        )
        .await?;
        return Ok(());
    }

    let expired = deal
        .expires_at
        .is_some_and(|expires_at| Utc::now() > expires_at);
    if expired {
        revert_deal(app, deal, "collection window expired").await?;
        return Ok(());
    }

    persist(app, deal).await
}

async fn on_waiting(app: &App, deal: &mut Deal) -> anyhow::Result<()> {
    refresh_deposits(app, deal).await?;
    evaluate_locks(app, deal).await?;

    let mut funded = true;
    for side in Side::BOTH {
        funded &= raw_sufficient(app, deal, side).await?;
    }

    if !funded {
        rollback_to_collection(app, deal).await?;
        return Ok(());
    }

    if deal.both_sides_locked() {
        enter_swap(app, deal).await?;
        return Ok(());
    }

    persist(app, deal).await
}

async fn on_swap(app: &App, deal: &mut Deal) -> anyhow::Result<()> {
    // Funds decrease as payouts land; sufficiency is deliberately not
    // re-evaluated here.
    let total = app.database.count_items(&deal.deal_id).await?;
    let incomplete = app.database.count_incomplete_items(&deal.deal_id).await?;

    if total == 0 {
        app.database
            .add_deal_event(
                &deal.deal_id,
                Severity::Warning,
                Some(Stage::Swap),
                "deal in SWAP with no planned transfers",
            )
            .await?;
        return Ok(());
    }

    if incomplete == 0 {
        transition(app, deal, Stage::Closed, "all transfers completed, deal closed").await?;
    }

    Ok(())
}

async fn on_reverted(app: &App, deal: &mut Deal) -> anyhow::Result<()> {
    let incomplete = app.database.count_incomplete_items(&deal.deal_id).await?;

    if incomplete == 0 {
        transition(app, deal, Stage::Closed, "all refunds completed, deal closed").await?;
    }

    Ok(())
}

/// Merge fresh chain listings into the side states and recompute
/// `collected_by_asset` under the stage's collection rule.
async fn refresh_deposits(app: &App, deal: &mut Deal) -> anyhow::Result<()> {
    for side in Side::BOTH {
        let spec = deal.spec(side).clone();
        let Some(escrow) = deal.escrow(side).cloned() else {
            continue;
        };
        let adapter = app.chains.get(&spec.chain)?;

        // Pending deposits are shown while collecting; from WAITING on, only
        // the chain's threshold matters.
        let listing_confirms = match deal.stage {
            Stage::Created | Stage::Collection => 0,
            _ => adapter.confirmation_threshold(),
        };

        let mut assets = vec![spec.asset.clone()];
        let commission_asset = deal.commission(side).asset.clone();
        if commission_asset != spec.asset {
            assets.push(commission_asset);
        }

        deal.side_mut(side).deposits = app.database.get_deposits(&deal.deal_id, side).await?;

        let mut seen: HashSet<(String, Option<u32>)> = HashSet::new();
        for asset in &assets {
            let listing = adapter
                .list_confirmed_deposits(asset, &escrow.address, listing_confirms)
                .await
                .with_context(|| format!("listing {asset} deposits for side {}", side.as_str()))?;

            for deposit in listing.deposits {
                seen.insert((deposit.txid.clone(), deposit.index));
                app.database
                    .upsert_deposit(&deal.deal_id, side, &spec.chain, &escrow.address, &deposit)
                    .await?;
                deal.side_mut(side).upsert_deposit(deposit);
            }
        }

        // A previously recorded deposit missing from the listing either has
        // too few confirmations now or was reorged out entirely.
        let stale: Vec<_> = deal
            .side(side)
            .deposits
            .iter()
            .filter(|deposit| assets.contains(&deposit.asset))
            .filter(|deposit| !seen.contains(&(deposit.txid.clone(), deposit.index)))
            .cloned()
            .collect();

        for mut deposit in stale {
            let confirms = adapter.get_tx_confirmations(&deposit.txid).await?;
            if confirms < 0 {
                app.database
                    .delete_deposit(&deal.deal_id, side, &deposit.txid, deposit.index)
                    .await?;
                deal.side_mut(side)
                    .deposits
                    .retain(|d| !(d.txid == deposit.txid && d.index == deposit.index));
                app.database
                    .add_deal_event(
                        &deal.deal_id,
                        Severity::Warning,
                        Some(deal.stage),
                        &format!("deposit {} disappeared from chain", deposit.txid),
                    )
                    .await?;
            } else {
                deposit.confirms = confirms as u32;
                app.database
                    .upsert_deposit(&deal.deal_id, side, &spec.chain, &escrow.address, &deposit)
                    .await?;
                deal.side_mut(side).upsert_deposit(deposit);
            }
        }

        let collect_confirms = adapter.collect_confirms();
        let collected = match deal.stage {
            Stage::Created | Stage::Collection => {
                invariants::sum_by_asset(&deal.side(side).deposits)
            }
            _ => invariants::sum_by_asset(&invariants::eligible_deposits(
                &deal.side(side).deposits,
                collect_confirms,
                deal.expires_at,
            )),
        };
        deal.side_mut(side).collected_by_asset = collected;
    }

    Ok(())
}

/// The dual-sided lock decision: locks are set for both sides or neither.
/// In WAITING, locks already held are kept through transient drops — reorg
/// handling decides rollbacks at the stage level.
async fn evaluate_locks(app: &App, deal: &mut Deal) -> anyhow::Result<()> {
    let mut locked = [false; 2];

    for (i, side) in Side::BOTH.into_iter().enumerate() {
        let spec = deal.spec(side).clone();
        let requirement = deal.commission(side).clone();
        let adapter = app.chains.get(&spec.chain)?;
        let ctx = chain_context(app, &spec.chain)?;
        let commission = planner::lock_commission_amount(deal, side, &ctx, &app.assets)?;

        let evaluation = invariants::check_locks(
            &deal.side(side).deposits,
            &spec.asset,
            spec.amount,
            &requirement.asset,
            commission,
            adapter.collect_confirms(),
            deal.expires_at,
        );
        locked[i] = evaluation.fully_locked();
    }

    let now = Utc::now();
    if locked[0] && locked[1] {
        deal.side_a.locks.set(now);
        deal.side_b.locks.set(now);
    } else if deal.stage != Stage::Waiting {
        deal.side_a.locks.clear();
        deal.side_b.locks.clear();
    }

    Ok(())
}

/// Sufficiency over everything the chain currently shows, pending deposits
/// included. This is the COLLECTION entry/exit criterion and the WAITING
/// reorg test.
async fn raw_sufficient(app: &App, deal: &Deal, side: Side) -> anyhow::Result<bool> {
    let ctx = chain_context(app, &deal.spec(side).chain)?;
    let commission = planner::lock_commission_amount(deal, side, &ctx, &app.assets)?;
    let sums = invariants::sum_by_asset(&deal.side(side).deposits);

    Ok(sufficient_in(deal, side, commission, &sums))
}

/// Pure core of the sufficiency test.
fn sufficient_in(
    deal: &Deal,
    side: Side,
    commission: Decimal,
    sums: &HashMap<String, Decimal>,
) -> bool {
    let spec = deal.spec(side);
    let requirement = deal.commission(side);
    let collected = sums.get(&spec.asset).copied().unwrap_or_default();

    if requirement.asset == spec.asset {
        collected >= spec.amount + commission
    } else {
        let commission_collected = sums.get(&requirement.asset).copied().unwrap_or_default();
        collected >= spec.amount && commission_collected >= commission
    }
}

/// WAITING -> COLLECTION after a reorg took a side below sufficiency.
async fn rollback_to_collection(app: &App, deal: &mut Deal) -> anyhow::Result<()> {
    deal.side_a.locks.clear();
    deal.side_b.locks.clear();

    // Timer resumes from the preserved expiry; a deal that somehow lost it
    // restarts the full window.
    if deal.expires_at.is_none() {
        deal.expires_at = Some(Utc::now() + Duration::seconds(deal.timeout_seconds));
    }

    deal.stage = Stage::Collection;
    deal.last_stage_at = Utc::now();

    let pool = &app.database.pool;
    let cleared: u64 = retry_tx!(pool, tx, {
        let cleared = tx.delete_pending_swap_items(&deal.deal_id).await?;
        tx.update_deal_runtime(deal).await?;
        tx.add_deal_event(
            &deal.deal_id,
            Severity::Warning,
            Some(Stage::Collection),
            "reorg detected, rolled back to collection",
        )
        .await?;
        Ok::<_, crate::database::Error>(cleared)
    })
    .await?;

    info!(deal_id = %deal.deal_id, cleared, "deal rolled back to collection");
    Ok(())
}

/// WAITING -> SWAP: clear the timer permanently, build both transfer plans
/// and enqueue them atomically with the stage change.
async fn enter_swap(app: &App, deal: &mut Deal) -> anyhow::Result<()> {
    if !invariants::valid_transition(deal.stage, Stage::Swap) {
        refuse(app, deal, &format!("Illegal transition {} -> SWAP", deal.stage)).await?;
        return Ok(());
    }

    // Timeouts never trigger from SWAP onward.
    deal.expires_at = None;
    deal.stage = Stage::Swap;
    deal.last_stage_at = Utc::now();

    let mut plan = Vec::new();
    for side in Side::BOTH {
        let chain = deal.spec(side).chain.clone();
        let ctx = chain_context(app, &chain)?;
        for transfer in planner::plan_swap_side(deal, side, &ctx, &app.assets)? {
            plan.push(transfer.into_queue_item(&deal.deal_id, &chain));
        }
        if let Some(item) = plan_gas_refund(app, deal, side, &ctx).await? {
            plan.push(item);
        }
    }

    let pool = &app.database.pool;
    retry_tx!(pool, tx, {
        for item in &plan {
            tx.enqueue_item(item).await?;
        }
        tx.update_deal_runtime(deal).await?;
        tx.add_deal_event(
            &deal.deal_id,
            Severity::Info,
            Some(Stage::Swap),
            &format!("both sides locked, swap started with {} transfers", plan.len()),
        )
        .await?;
        Ok::<_, crate::database::Error>(())
    })
    .await?;

    info!(deal_id = %deal.deal_id, transfers = plan.len(), "deal entered swap");
    Ok(())
}

/// Revert a deal that failed to fund, refunding all confirmed deposits.
///
/// Returns `false` when the revert is refused. Every refusal is a CRITICAL
/// event: reverting a deal whose swap is underway is a double-spend path.
pub async fn revert_deal(app: &App, deal: &mut Deal, reason: &str) -> anyhow::Result<bool> {
    if !matches!(deal.stage, Stage::Created | Stage::Collection) {
        refuse(app, deal, &format!("Blocked revert in {} stage", deal.stage)).await?;
        return Ok(false);
    }

    if deal.both_sides_locked() {
        refuse(
            app,
            deal,
            "Blocked revert: both sides locked, swap must complete",
        )
        .await?;
        return Ok(false);
    }

    if app.database.has_submitted_swap_payout(&deal.deal_id).await? {
        refuse(app, deal, "Blocked revert: swap payout already submitted").await?;
        return Ok(false);
    }

    let mut plan = Vec::new();
    for side in Side::BOTH {
        let chain = deal.spec(side).chain.clone();
        let adapter = app.chains.get(&chain)?;
        let ctx = chain_context(app, &chain)?;

        // Only confirmed money is refunded now; anything still pending is
        // picked up by the late-deposit watcher once it confirms.
        let confirmed = invariants::sum_by_asset(&invariants::eligible_deposits(
            &deal.side(side).deposits,
            adapter.collect_confirms(),
            None,
        ));

        for transfer in planner::plan_revert_side(deal, side, &ctx, &app.assets, &confirmed)? {
            plan.push(transfer.into_queue_item(&deal.deal_id, &chain));
        }
        if let Some(item) = plan_gas_refund(app, deal, side, &ctx).await? {
            plan.push(item);
        }
    }

    deal.stage = Stage::Reverted;
    deal.last_stage_at = Utc::now();

    let pool = &app.database.pool;
    retry_tx!(pool, tx, {
        for item in &plan {
            tx.enqueue_item(item).await?;
        }
        tx.update_deal_runtime(deal).await?;
        tx.add_deal_event(
            &deal.deal_id,
            Severity::Info,
            Some(Stage::Reverted),
            &format!("deal reverted ({reason}), {} refunds queued", plan.len()),
        )
        .await?;
        Ok::<_, crate::database::Error>(())
    })
    .await?;

    info!(deal_id = %deal.deal_id, reason, refunds = plan.len(), "deal reverted");
    Ok(true)
}

/// When the tank wallet topped up an escrow with gas, whatever native
/// balance remains (up to the funded amount) is returned to the tank as part
/// of the settlement plan.
async fn plan_gas_refund(
    app: &App,
    deal: &Deal,
    side: Side,
    ctx: &ChainContext,
) -> anyhow::Result<Option<NewQueueItem>> {
    let Some(escrow) = deal.escrow(side) else {
        return Ok(None);
    };
    let Some(tank) = ctx.tank_address.clone() else {
        return Ok(None);
    };

    let chain = &deal.spec(side).chain;
    let Some(funding) = app
        .database
        .get_gas_funding(&deal.deal_id, chain, &escrow.address)
        .await?
    else {
        return Ok(None);
    };

    let adapter = app.chains.get(chain)?;
    let native = app.assets.require_chain(chain)?.native_asset.clone();
    let decimals = app.assets.decimals(&native).unwrap_or(18);

    let balance = adapter.get_balance(&native, &escrow.address).await?;
    let amount = floor_dp(funding.amount.min(balance), decimals);
    if is_dust(amount, ctx.dust_threshold) {
        return Ok(None);
    }

    Ok(Some(NewQueueItem {
        deal_id: deal.deal_id.clone(),
        chain: chain.clone(),
        from: escrow.clone(),
        to: tank,
        asset: native,
        amount,
        purpose: Purpose::GasRefundToTank,
        phase: ctx.utxo.then_some(Phase::Phase3Refund),
        payback: None,
        recipient: None,
        fee_recipient: None,
        fees: None,
        payout_id: None,
    }))
}

/// Validate, apply and persist a plain stage change with its event.
async fn transition(app: &App, deal: &mut Deal, to: Stage, message: &str) -> anyhow::Result<()> {
    if !invariants::valid_transition(deal.stage, to) {
        refuse(app, deal, &format!("Illegal transition {} -> {to}", deal.stage)).await?;
        return Ok(());
    }

    let from = deal.stage;
    deal.stage = to;
    deal.last_stage_at = Utc::now();

    let pool = &app.database.pool;
    retry_tx!(pool, tx, {
        tx.update_deal_runtime(deal).await?;
        tx.add_deal_event(&deal.deal_id, Severity::Info, Some(to), message)
            .await?;
        Ok::<_, crate::database::Error>(())
    })
    .await?;

    info!(deal_id = %deal.deal_id, %from, %to, "deal stage changed");
    Ok(())
}

/// Persist side states without a stage change.
async fn persist(app: &App, deal: &Deal) -> anyhow::Result<()> {
    app.database.update_deal_runtime(deal).await?;
    Ok(())
}

async fn refuse(app: &App, deal: &Deal, message: &str) -> anyhow::Result<()> {
    warn!(deal_id = %deal.deal_id, message, "operation refused");
    app.database
        .add_deal_event(&deal.deal_id, Severity::Critical, Some(deal.stage), message)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use maplit::hashmap;

    use super::*;
    use crate::deal::test_support::deal_with_details;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn sufficiency_with_same_asset_commission() {
        let deal = deal_with_details();

        // Side B: 3000 USDC trade + 9 USDC commission in the same asset.
        let sums = hashmap! { "USDC.ETH".to_string() => d("3000") };
        assert!(!sufficient_in(&deal, Side::B, d("9"), &sums));

        let sums = hashmap! { "USDC.ETH".to_string() => d("3009") };
        assert!(sufficient_in(&deal, Side::B, d("9"), &sums));

        // Embedded (broker) commission: funding the trade alone suffices.
        let sums = hashmap! { "USDC.ETH".to_string() => d("3000") };
        assert!(sufficient_in(&deal, Side::B, Decimal::ZERO, &sums));
    }

    #[test]
    fn sufficiency_with_foreign_asset_commission() {
        let mut deal = deal_with_details();
        deal.commission_plan.side_b.asset = "ETH.ETH".into();

        let sums = hashmap! { "USDC.ETH".to_string() => d("3000") };
        assert!(!sufficient_in(&deal, Side::B, d("0.005"), &sums));

        let sums = hashmap! {
            "USDC.ETH".to_string() => d("3000"),
            "ETH.ETH".to_string() => d("0.005"),
        };
        assert!(sufficient_in(&deal, Side::B, d("0.005"), &sums));
    }
}
