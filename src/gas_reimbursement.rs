//! Converts the gas spent on a confirmed swap payout into an owed token
//! amount and queues the reimbursement to the tank wallet.
//!
//! The calculator runs at most once per deal; the
//! [`crate::deal::GasReimbursementStatus`] machine
//! (PENDING_CALCULATION -> CALCULATED -> QUEUED -> COMPLETED | SKIPPED)
//! makes the trigger idempotent across ticks and restarts.

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{info, instrument};

use crate::app::App;
use crate::chain::GasReceipt;
use crate::database::methods::DbMethods as _;
use crate::deal::{Deal, GasCalculation, GasReimbursementStatus, Severity};
use crate::decimal::floor_dp;
use crate::queue::{NewQueueItem, Purpose, QueueItem, TxRef};
use crate::retry_tx;

/// Invoked when a SWAP_PAYOUT first reaches one confirmation.
#[instrument(level = "debug", skip(app, item, tx), fields(deal_id = %item.deal_id))]
pub async fn on_swap_payout_confirmed(
    app: &App,
    item: &QueueItem,
    tx: &TxRef,
) -> anyhow::Result<()> {
    // Late-refund tracking ids have no deal row; nothing to reimburse.
    let Some(mut deal) = app.database.get_deal(&item.deal_id).await? else {
        return Ok(());
    };
    if deal.gas_reimbursement.status != GasReimbursementStatus::PendingCalculation {
        return Ok(());
    }

    if !app.config.gas_reimbursement.enabled {
        return skip(app, &mut deal, "reimbursement disabled").await;
    }

    let adapter = app.chains.get(&item.chain)?;
    if adapter.is_utxo() {
        return skip(app, &mut deal, "gas reimbursement unsupported on this chain").await;
    }

    let Some(tank) = adapter.tank_address() else {
        return skip(app, &mut deal, "tank address unavailable").await;
    };
    let Some(receipt) = adapter.get_tx_gas(&tx.txid).await? else {
        return skip(app, &mut deal, "gas receipt unavailable").await;
    };
    let Some(native_rate) = adapter.native_usd_rate().await? else {
        return skip(app, &mut deal, "native price unavailable").await;
    };

    let chain = app.assets.require_chain(&item.chain)?;
    let token = chain.reimbursement_asset.clone();
    let native_decimals = app.assets.decimals(&chain.native_asset).unwrap_or(18);
    let token_decimals = app.assets.decimals(&token).unwrap_or(18);

    let Some(token_rate) = adapter.token_usd_rate(&token).await? else {
        return skip(app, &mut deal, "token price unavailable").await;
    };
    if token_rate.is_zero() {
        return skip(app, &mut deal, "token price unavailable").await;
    }

    let (native_cost_wei, native_usd_value, token_amount) = convert_receipt(
        &receipt,
        native_decimals,
        native_rate,
        token_rate,
        token_decimals,
    );

    if token_amount <= Decimal::ZERO {
        return skip(app, &mut deal, "gas cost below reimbursement precision").await;
    }

    let balance = adapter.get_balance(&token, &item.from.address).await?;
    if balance < token_amount {
        return skip(
            app,
            &mut deal,
            "insufficient escrow balance of reimbursement token",
        )
        .await;
    }

    deal.gas_reimbursement.calculation = Some(GasCalculation {
        actual_gas_used: receipt.gas_used,
        gas_price: receipt.effective_gas_price,
        estimated_total_gas: receipt.gas_used,
        native_cost_wei,
        native_usd_value,
        native_usd_rate: native_rate,
        token_usd_rate: token_rate,
        token_amount,
        calculated_at: Utc::now(),
    });
    deal.gas_reimbursement.status = GasReimbursementStatus::Queued;

    let reimbursement = NewQueueItem {
        deal_id: deal.deal_id.clone(),
        chain: item.chain.clone(),
        from: item.from.clone(),
        to: tank,
        asset: token.clone(),
        amount: token_amount,
        purpose: Purpose::GasReimbursement,
        phase: None,
        payback: None,
        recipient: None,
        fee_recipient: None,
        fees: None,
        payout_id: None,
    };

    let pool = &app.database.pool;
    retry_tx!(pool, tx_db, {
        tx_db.enqueue_item(&reimbursement).await?;
        tx_db.update_deal_runtime(&deal).await?;
        tx_db
            .add_deal_event(
                &deal.deal_id,
                Severity::Info,
                None,
                &format!("gas reimbursement of {token_amount} {token} queued"),
            )
            .await?;
        Ok::<_, crate::database::Error>(())
    })
    .await?;

    info!(deal_id = %deal.deal_id, %token_amount, %token, "gas reimbursement queued");
    Ok(())
}

/// The reimbursement item confirmed; close out the status machine.
pub async fn mark_completed(app: &App, deal_id: &str) -> anyhow::Result<()> {
    let Some(mut deal) = app.database.get_deal(deal_id).await? else {
        return Ok(());
    };
    if deal.gas_reimbursement.status != GasReimbursementStatus::Queued {
        return Ok(());
    }

    deal.gas_reimbursement.status = GasReimbursementStatus::Completed;
    app.database.update_deal_runtime(&deal).await?;
    Ok(())
}

async fn skip(app: &App, deal: &mut Deal, reason: &str) -> anyhow::Result<()> {
    deal.gas_reimbursement.status = GasReimbursementStatus::Skipped;
    deal.gas_reimbursement.skip_reason = Some(reason.to_owned());

    let pool = &app.database.pool;
    retry_tx!(pool, tx_db, {
        tx_db.update_deal_runtime(deal).await?;
        tx_db
            .add_deal_event(
                &deal.deal_id,
                Severity::Info,
                None,
                &format!("gas reimbursement skipped: {reason}"),
            )
            .await?;
        Ok::<_, crate::database::Error>(())
    })
    .await?;

    Ok(())
}

/// Pure conversion: receipt -> (native cost in wei, USD value, token amount
/// floored to the token's decimals).
fn convert_receipt(
    receipt: &GasReceipt,
    native_decimals: u32,
    native_usd_rate: Decimal,
    token_usd_rate: Decimal,
    token_decimals: u32,
) -> (Decimal, Decimal, Decimal) {
    let native_cost_wei =
        Decimal::from(receipt.gas_used) * Decimal::from(receipt.effective_gas_price);
    // Scale wei down to whole native tokens.
    let native_amount = native_cost_wei * Decimal::new(1, native_decimals);
    let native_usd_value = native_amount * native_usd_rate;
    let token_amount = floor_dp(native_usd_value / token_usd_rate, token_decimals);

    (native_cost_wei, native_usd_value, token_amount)
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn receipt_converts_to_token_amount() {
        // 100k gas at 20 gwei = 0.002 ETH; at $2500/ETH that is $5,
        // reimbursed as 5 USDC at $1.
        let receipt = GasReceipt {
            gas_used: 100_000,
            effective_gas_price: 20_000_000_000,
        };

        let (wei, usd, token) = convert_receipt(&receipt, 18, d("2500"), d("1"), 6);

        assert_eq!(wei, d("2000000000000000"));
        assert_eq!(usd, d("5.000"));
        assert_eq!(token, d("5"));
    }

    #[test]
    fn token_amount_rounds_down() {
        let receipt = GasReceipt {
            gas_used: 123_456,
            effective_gas_price: 31_000_000_000,
        };

        let (_, usd, token) = convert_receipt(&receipt, 18, d("2650"), d("0.9997"), 6);

        // Down to six decimals, never up.
        assert!(token <= usd / d("0.9997"));
        assert_eq!(token, floor_dp(usd / d("0.9997"), 6));
    }

    #[test]
    fn native_reimbursement_uses_native_decimals() {
        let receipt = GasReceipt {
            gas_used: 21_000,
            effective_gas_price: 10_000_000_000,
        };

        // Reimbursed in the native token itself (rate 1:1 in USD terms).
        let (_, _, token) = convert_receipt(&receipt, 18, d("2000"), d("2000"), 18);

        assert_eq!(token, d("0.00021"));
    }
}
