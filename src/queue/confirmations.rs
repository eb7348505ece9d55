//! Advances SUBMITTED queue items as their transactions confirm.
//!
//! Runs inside the tick driver. A transaction the chain no longer knows
//! about returns its item to PENDING for resubmission; a UTXO payment split
//! over several transactions confirms at the minimum across the whole set.

use tracing::{info, instrument, warn};

use crate::app::App;
use crate::database::methods::DbMethods as _;
use crate::deal::Severity;
use crate::gas_reimbursement;
use crate::queue::{ItemStatus, Purpose, QueueItem, TxStatus};
use crate::retry_tx;

#[instrument(level = "debug", skip_all)]
pub async fn monitor_submitted(app: &App) -> anyhow::Result<()> {
    let submitted = app.database.get_submitted_items().await?;

    for item in submitted {
        if let Err(error) = check_item(app, &item).await {
            warn!(item = item.id, deal_id = %item.deal_id, ?error, "confirmation check failed");
            app.database
                .add_deal_event(
                    &item.deal_id,
                    Severity::Warning,
                    None,
                    &format!("confirmation check failed: {error:#}"),
                )
                .await
                .ok();
        }
    }

    Ok(())
}

async fn check_item(app: &App, item: &QueueItem) -> anyhow::Result<()> {
    let Some(mut tx) = item.submitted_tx.clone() else {
        return Ok(());
    };
    let adapter = app.chains.get(&item.chain)?;

    let mut confirms = adapter.get_tx_confirmations(&tx.txid).await?;
    if confirms >= 0 {
        // Multi-transaction payments confirm at the weakest link.
        for txid in &tx.additional_txids {
            let extra = adapter.get_tx_confirmations(txid).await?;
            confirms = confirms.min(extra);
        }
    }

    if confirms < 0 {
        // Dropped or reorged away. Back to PENDING; the next processor pass
        // resubmits under a fresh reservation.
        tx.status = TxStatus::Dropped;
        tx.confirms = 0;

        let pool = &app.database.pool;
        retry_tx!(pool, tx_db, {
            tx_db.update_item_tx(item.id, &tx).await?;
            tx_db
                .update_item_status(item.id, ItemStatus::Pending)
                .await?;
            tx_db
                .add_deal_event(
                    &item.deal_id,
                    Severity::Warning,
                    None,
                    &format!("{} {} disappeared from chain, requeued", item.purpose, tx.txid),
                )
                .await?;
            Ok::<_, crate::database::Error>(())
        })
        .await?;

        warn!(item = item.id, txid = %tx.txid, "submitted transaction dropped, item requeued");
        return Ok(());
    }

    let previous = tx.confirms;
    tx.confirms = confirms;

    // The first confirmation of a swap payout is the gas calculator's cue;
    // the reimbursement status machine keeps it single-shot.
    if item.purpose == Purpose::SwapPayout && previous == 0 && confirms >= 1 {
        gas_reimbursement::on_swap_payout_confirmed(app, item, &tx).await?;
    }

    if confirms >= i64::from(tx.required_confirms) {
        tx.status = TxStatus::Confirmed;

        let pool = &app.database.pool;
        retry_tx!(pool, tx_db, {
            tx_db.update_item_tx(item.id, &tx).await?;
            tx_db
                .update_item_status(item.id, ItemStatus::Completed)
                .await?;
            tx_db
                .add_deal_event(
                    &item.deal_id,
                    Severity::Info,
                    None,
                    &format!("{} {} confirmed ({confirms} confirmations)", item.purpose, tx.txid),
                )
                .await?;
            Ok::<_, crate::database::Error>(())
        })
        .await?;

        if let Some(nonce) = item.original_nonce {
            app.database
                .update_last_confirmed_nonce(&item.chain, &item.from.address, nonce)
                .await?;
        }

        if let Some(payout_id) = item.payout_id {
            if app.database.payout_is_confirmed(payout_id).await? {
                app.database
                    .update_payout_status(payout_id, crate::queue::PayoutStatus::Confirmed)
                    .await?;
            }
        }

        if item.purpose == Purpose::GasReimbursement {
            gas_reimbursement::mark_completed(app, &item.deal_id).await?;
        }

        info!(item = item.id, txid = %tx.txid, "transfer completed");
    } else {
        app.database.update_item_tx(item.id, &tx).await?;
    }

    Ok(())
}
