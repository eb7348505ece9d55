use std::sync::Arc;

use chrono::Utc;
use tokio::time::{self, MissedTickBehavior};
use tracing::{info, warn};

use crate::app::App;
use crate::database::methods::DbMethods as _;
use crate::deal::{machine, Deal, Severity, Side};
use crate::decimal::{floor_dp, is_dust};
use crate::queue::{ItemStatus, NewQueueItem, Phase, Purpose};
use crate::retry_tx;

/// Watches settled (CLOSED or REVERTED) deals for residual escrow balances.
///
/// For up to `late_deposit_window` after the last stage transition, any
/// non-dust balance found on an escrow is refunded to the side's payback
/// address. Refund items are filed under a synthesized tracking id so the
/// settled deal itself is never reopened.
pub async fn watch_late_deposits(app: Arc<App>) -> anyhow::Result<()> {
    tracing::info!("Starting late-deposit watcher.");

    let mut timer = time::interval(app.config.app.tick_interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        timer.tick().await;

        let now = Utc::now();
        let window = chrono::Duration::from_std(app.config.app.late_deposit_window)?;
        // Leave freshly settled escrows alone: an in-flight payout must not
        // be mistaken for a late deposit.
        let settle_delay = chrono::Duration::from_std(app.config.app.residual_settle_delay)?;

        let deal_ids = app
            .database
            .get_settled_deal_ids(now - window, now - settle_delay)
            .await?;

        for deal_id in &deal_ids {
            if let Err(error) = check_deal(&app, deal_id).await {
                warn!(%deal_id, ?error, "late-deposit check failed");
            }
        }
    }
}

/// The tracking id late refunds are filed under. Not a real deal id on
/// purpose.
fn tracking_id(deal: &Deal, side: Side) -> String {
    format!("{}~late~{}", deal.deal_id, side.as_str())
}

async fn check_deal(app: &App, deal_id: &str) -> anyhow::Result<()> {
    let Some(deal) = app.database.get_deal(deal_id).await? else {
        return Ok(());
    };

    for side in Side::BOTH {
        let Some(escrow) = deal.escrow(side).cloned() else {
            continue;
        };
        let Some(payback) = deal.payback(side).map(ToOwned::to_owned) else {
            continue;
        };

        let spec = deal.spec(side);
        let adapter = app.chains.get(&spec.chain)?;
        let ctx = machine::chain_context(app, &spec.chain)?;

        let mut assets = vec![spec.asset.clone()];
        let commission_asset = deal.commission(side).asset.clone();
        if commission_asset != spec.asset {
            assets.push(commission_asset);
        }

        let tracking = tracking_id(&deal, side);
        let existing = app.database.get_items_by_deal(&tracking).await?;

        for asset in assets {
            let balance = adapter.get_balance(&asset, &escrow.address).await?;
            let decimals = app.assets.decimals(&asset).unwrap_or(18);
            let amount = floor_dp(balance, decimals);
            if is_dust(amount, ctx.dust_threshold) {
                continue;
            }

            // A refund for this asset already on its way covers the balance.
            let in_flight = existing
                .iter()
                .any(|item| item.asset == asset && item.status != ItemStatus::Completed);
            if in_flight {
                continue;
            }

            let (purpose, fee_recipient, fees) = if ctx.broker_available {
                (
                    Purpose::BrokerRefund,
                    Some(ctx.operator_address.clone()),
                    Some(rust_decimal::Decimal::ZERO),
                )
            } else {
                (Purpose::TimeoutRefund, None, None)
            };

            let item = NewQueueItem {
                deal_id: tracking.clone(),
                chain: spec.chain.clone(),
                from: escrow.clone(),
                to: payback.clone(),
                asset: asset.clone(),
                amount,
                purpose,
                phase: ctx.utxo.then_some(Phase::Phase3Refund),
                payback: Some(payback.clone()),
                recipient: None,
                fee_recipient,
                fees,
                payout_id: None,
            };

            let pool = &app.database.pool;
            retry_tx!(pool, tx_db, {
                tx_db.enqueue_item(&item).await?;
                tx_db
                    .add_deal_event(
                        &deal.deal_id,
                        Severity::Info,
                        None,
                        &format!(
                            "late deposit of {amount} {asset} on side {}, refund queued",
                            side.as_str()
                        ),
                    )
                    .await?;
                Ok::<_, crate::database::Error>(())
            })
            .await?;

            info!(
                deal_id = %deal.deal_id,
                side = side.as_str(),
                %amount,
                %asset,
                "late deposit refund queued"
            );
        }
    }

    Ok(())
}
