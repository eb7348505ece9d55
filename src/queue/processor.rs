//! Drains the PENDING queue, one `(chain, sender)` group at a time.
//!
//! Per sender, items submit in strict `seq` order with a short pause between
//! broadcasts. Account-based chains go through atomic nonce reservation with
//! a collision guard; UTXO chains rely on phase gates instead. Recovery is
//! always idempotent across passes: nothing here raises on an anomaly, it
//! resets the account's nonce bookkeeping and lets the next pass retry.

use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::app::App;
use crate::chain::{BrokerSettlement, ChainAdapter, FeeData, SendOptions, SentTx};
use crate::database::methods::DbMethods as _;
use crate::deal::{Severity, Stage};
use crate::queue::{self, ItemStatus, Purpose, QueueItem, TxRef, TxStatus};
use crate::retry_tx;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Submitted,
    Completed,
    Skipped,
}

/// One full processor pass: recover stuck transactions, then drain the
/// queue.
#[instrument(level = "debug", skip_all)]
pub async fn run_pass(app: &App) -> anyhow::Result<()> {
    handle_stuck_transactions(app).await?;

    let pending = app.database.get_pending_items().await?;
    let groups = queue::group_pending(pending);

    for ((chain_id, sender), items) in groups {
        let adapter = match app.chains.get(&chain_id) {
            Ok(adapter) => adapter,
            Err(error) => {
                warn!(%chain_id, ?error, "skipping queue group without adapter");
                continue;
            }
        };

        let mut submitted_any = false;
        for item in items {
            if submitted_any {
                // Give the RPC a moment between broadcasts from one sender,
                // ordering races are real.
                tokio::time::sleep(app.config.app.sender_pause).await;
            }

            match process_item(app, adapter.as_ref(), &item).await {
                Ok(ItemOutcome::Submitted) => submitted_any = true,
                Ok(ItemOutcome::Completed) => {}
                // Strict per-sender order: nothing later may overtake a
                // gated item.
                Ok(ItemOutcome::Skipped) => break,
                Err(error) => {
                    let message = format!("{error:#}");
                    warn!(item = item.id, deal_id = %item.deal_id, %message, "submission failed");
                    app.database
                        .add_deal_event(
                            &item.deal_id,
                            Severity::Warning,
                            None,
                            &format!("submission failed: {message}"),
                        )
                        .await
                        .ok();
                    if message.to_lowercase().contains("nonce") {
                        app.database.reset_nonce(&chain_id, &sender).await.ok();
                    }
                    break;
                }
            }
        }
    }

    Ok(())
}

async fn process_item(
    app: &App,
    adapter: &dyn ChainAdapter,
    item: &QueueItem,
) -> anyhow::Result<ItemOutcome> {
    // Policy gate: a refund must never race an incomplete swap payout.
    if item.purpose == Purpose::TimeoutRefund {
        if let Some(deal) = app.database.get_deal(&item.deal_id).await? {
            if deal.stage != Stage::Closed
                && app.database.has_incomplete_swap_payout(&item.deal_id).await?
            {
                return Ok(ItemOutcome::Skipped);
            }
        }
    }

    // Phase gate (UTXO): earlier waves must be fully confirmed.
    if let Some(phase) = item.phase {
        if app
            .database
            .earlier_phase_incomplete(&item.deal_id, phase)
            .await?
        {
            return Ok(ItemOutcome::Skipped);
        }
    }

    if item.amount.is_zero() {
        app.database.update_item_status(item.id, ItemStatus::Completed).await?;
        app.database
            .add_deal_event(
                &item.deal_id,
                Severity::Info,
                None,
                &format!("zero-value {} completed without submission", item.purpose),
            )
            .await?;
        return Ok(ItemOutcome::Completed);
    }

    if item.purpose.is_broker() {
        return submit_broker(app, adapter, item).await;
    }

    if adapter.is_utxo() {
        return submit_utxo(app, adapter, item).await;
    }

    submit_account(app, adapter, item).await
}

fn make_tx_ref(chain: &str, required_confirms: u32, sent: &SentTx) -> TxRef {
    TxRef {
        chain: chain.to_owned(),
        txid: sent.txid.clone(),
        submitted_at: sent.submitted_at,
        confirms: 0,
        required_confirms,
        status: TxStatus::Pending,
        nonce_or_inputs: sent.nonce_or_inputs.clone(),
        additional_txids: sent.additional_txids.clone(),
        gas_used: None,
        gas_price: sent.gas_price,
    }
}

/// Broker items bypass nonce reservation: the adapter owns the submission.
async fn submit_broker(
    app: &App,
    adapter: &dyn ChainAdapter,
    item: &QueueItem,
) -> anyhow::Result<ItemOutcome> {
    let params = BrokerSettlement {
        escrow: item.from.clone(),
        asset: item.asset.clone(),
        amount: item.amount,
        payback: item.payback.clone().unwrap_or_default(),
        recipient: item.recipient.clone().unwrap_or_default(),
        fee_recipient: item.fee_recipient.clone().unwrap_or_default(),
        fees: item.fees.unwrap_or_default(),
    };

    let sent = match item.purpose {
        Purpose::BrokerSwap => adapter.swap_via_broker(params).await?,
        Purpose::BrokerRevert => adapter.revert_via_broker(params).await?,
        Purpose::BrokerRefund => adapter.refund_via_broker(params).await?,
        _ => unreachable!("non-broker purpose in submit_broker"),
    };

    let tx = make_tx_ref(&item.chain, adapter.confirmation_threshold(), &sent);
    let key = sent.nonce_or_inputs.collision_key();
    app.database
        .record_submission(item.id, &tx, &key, sent.nonce_or_inputs.nonce(), sent.gas_price)
        .await?;
    app.database
        .add_deal_event(
            &item.deal_id,
            Severity::Info,
            None,
            &format!("{} submitted as {}", item.purpose, tx.txid),
        )
        .await?;

    info!(item = item.id, txid = %tx.txid, "broker settlement submitted");
    Ok(ItemOutcome::Submitted)
}

async fn submit_utxo(
    app: &App,
    adapter: &dyn ChainAdapter,
    item: &QueueItem,
) -> anyhow::Result<ItemOutcome> {
    let sent = adapter
        .send(
            &item.asset,
            &item.from,
            &item.to,
            item.amount,
            SendOptions::default(),
        )
        .await?;

    let tx = make_tx_ref(&item.chain, adapter.confirmation_threshold(), &sent);
    let key = sent.nonce_or_inputs.collision_key();

    let pool = &app.database.pool;
    let deal_id = item.deal_id.clone();
    let chain = item.chain.clone();
    let required = adapter.confirmation_threshold();
    retry_tx!(pool, tx_db, {
        // A split payment is tracked as one logical payout over all of its
        // transactions.
        if !sent.additional_txids.is_empty() {
            let payout_id = tx_db.insert_payout(&deal_id, &chain, required).await?;
            tx_db.set_item_payout(item.id, payout_id).await?;
        }
        tx_db
            .record_submission(item.id, &tx, &key, None, None)
            .await?;
        tx_db
            .add_deal_event(
                &deal_id,
                Severity::Info,
                None,
                &format!("{} submitted as {}", item.purpose, tx.txid),
            )
            .await?;
        Ok::<_, crate::database::Error>(())
    })
    .await?;

    info!(item = item.id, txid = %tx.txid, "utxo transfer submitted");
    Ok(ItemOutcome::Submitted)
}

async fn submit_account(
    app: &App,
    adapter: &dyn ChainAdapter,
    item: &QueueItem,
) -> anyhow::Result<ItemOutcome> {
    let chain = item.chain.as_str();
    let sender = item.from.address.as_str();

    // Queue integrity first: duplicates or gaps in the submitted set mean
    // the bookkeeping can no longer be trusted.
    let nonces = app.database.submitted_nonces(chain, sender).await?;
    let state = app.database.get_nonce_state(chain, sender).await?;
    let last_confirmed = state.and_then(|state| state.last_confirmed_nonce);
    if !queue::validate_nonce_sequence(&nonces, last_confirmed) {
        warn!(chain, sender, ?nonces, "nonce sequence validation failed, resetting account");
        app.database.reset_nonce(chain, sender).await?;
        app.database
            .add_deal_event(
                &item.deal_id,
                Severity::Warning,
                None,
                "nonce sequence validation failed, account reset",
            )
            .await?;
        return Ok(ItemOutcome::Skipped);
    }

    let Some(nonce) = reserve_nonce(app, adapter, chain, sender).await? else {
        app.database.reset_nonce(chain, sender).await?;
        app.database
            .add_deal_event(
                &item.deal_id,
                Severity::Warning,
                None,
                "nonce reservation kept diverging, account reset",
            )
            .await?;
        return Ok(ItemOutcome::Skipped);
    };

    // Idempotency: an equivalent transfer already on-chain means a crashed
    // pass got further than its bookkeeping shows.
    if matches!(item.purpose, Purpose::SwapPayout | Purpose::OpCommission) {
        if let Some(existing) = adapter
            .check_existing_transfer(sender, &item.to, &item.asset, item.amount)
            .await?
        {
            let tx = TxRef {
                chain: chain.to_owned(),
                txid: existing.txid.clone(),
                submitted_at: Utc::now(),
                confirms: i64::from(adapter.confirmation_threshold()),
                required_confirms: adapter.confirmation_threshold(),
                status: TxStatus::Confirmed,
                nonce_or_inputs: crate::chain::NonceOrInputs::Inputs { inputs: vec![] },
                additional_txids: vec![],
                gas_used: None,
                gas_price: None,
            };
            let key = format!("external:{}", existing.txid);

            let pool = &app.database.pool;
            retry_tx!(pool, tx_db, {
                tx_db
                    .record_submission(item.id, &tx, &key, None, None)
                    .await?;
                tx_db
                    .update_item_status(item.id, ItemStatus::Completed)
                    .await?;
                tx_db
                    .add_deal_event(
                        &item.deal_id,
                        Severity::Info,
                        None,
                        &format!(
                            "{} matched existing transfer {}, submission skipped",
                            item.purpose, existing.txid
                        ),
                    )
                    .await?;
                Ok::<_, crate::database::Error>(())
            })
            .await?;

            return Ok(ItemOutcome::Completed);
        }
    }

    let options = SendOptions {
        nonce: Some(nonce),
        ..SendOptions::default()
    };
    let sent = adapter
        .send(&item.asset, &item.from, &item.to, item.amount, options)
        .await?;

    // Collision guard: another live item occupying the same nonce slot means
    // a concurrent pass won the reservation race.
    let key = sent.nonce_or_inputs.collision_key();
    if let Some(conflict) = app
        .database
        .find_nonce_conflict(chain, sender, &key, item.id)
        .await?
    {
        warn!(item = item.id, conflict, chain, sender, "nonce collision detected");
        app.database.reset_nonce(chain, sender).await?;
        app.database
            .insert_alert(
                "nonce_collision",
                &format!(
                    "items {} and {conflict} collided on {key} for {chain}:{sender}",
                    item.id
                ),
            )
            .await?;
        app.database
            .add_deal_event(
                &item.deal_id,
                Severity::Warning,
                None,
                "nonce collision detected, account reset for retry",
            )
            .await?;
        return Ok(ItemOutcome::Skipped);
    }

    let tx = make_tx_ref(chain, adapter.confirmation_threshold(), &sent);
    app.database
        .record_submission(
            item.id,
            &tx,
            &key,
            sent.nonce_or_inputs.nonce().or(Some(nonce)),
            sent.gas_price,
        )
        .await?;
    app.database
        .add_deal_event(
            &item.deal_id,
            Severity::Info,
            None,
            &format!("{} submitted as {} (nonce {nonce})", item.purpose, tx.txid),
        )
        .await?;

    info!(item = item.id, txid = %tx.txid, nonce, "transfer submitted");
    Ok(ItemOutcome::Submitted)
}

/// Reserve the next nonce, retrying with exponential backoff while the
/// reservation disagrees with the expected value. `None` after the attempt
/// cap means the caller resets the account and skips this pass.
async fn reserve_nonce(
    app: &App,
    adapter: &dyn ChainAdapter,
    chain: &str,
    sender: &str,
) -> anyhow::Result<Option<i64>> {
    for attempt in 0..app.config.app.nonce_retry_attempts {
        let state = app.database.get_nonce_state(chain, sender).await?;

        let (initial, expected) = match state {
            None => {
                // First reservation for this account: seed from the chain.
                let current = adapter.get_current_nonce(sender).await?;
                (current, current)
            }
            Some(state) => {
                let highest = app.database.get_highest_queued_nonce(chain, sender).await?;
                (0, queue::expected_nonce(highest, state.next_nonce))
            }
        };

        let reserved = app
            .database
            .reserve_next_nonce(chain, sender, initial)
            .await?;

        if reserved == expected {
            return Ok(Some(reserved));
        }

        warn!(
            chain,
            sender, reserved, expected, attempt, "nonce reservation mismatch"
        );
        let backoff = app.config.app.nonce_retry_base * 5u32.pow(attempt);
        tokio::time::sleep(backoff).await;
    }

    Ok(None)
}

/// Scan SUBMITTED items for transactions sitting unmined past the stuck
/// threshold and fee-bump them with the same nonce. After the bump cap the
/// item is force-completed and handed to the operator.
async fn handle_stuck_transactions(app: &App) -> anyhow::Result<()> {
    let threshold = chrono::Duration::from_std(app.config.app.stuck_threshold)?;
    let submitted = app.database.get_submitted_items().await?;

    for item in submitted {
        if let Err(error) = check_stuck_item(app, &item, threshold).await {
            warn!(item = item.id, ?error, "stuck-transaction check failed");
            app.database
                .add_deal_event(
                    &item.deal_id,
                    Severity::Warning,
                    None,
                    &format!("stuck-transaction check failed: {error:#}"),
                )
                .await
                .ok();
        }
    }

    Ok(())
}

async fn check_stuck_item(
    app: &App,
    item: &QueueItem,
    threshold: chrono::Duration,
) -> anyhow::Result<()> {
    let Some(tx) = &item.submitted_tx else {
        return Ok(());
    };
    if tx.confirms != 0 {
        return Ok(());
    }
    let Some(last_submit_at) = item.last_submit_at else {
        return Ok(());
    };
    if Utc::now() - last_submit_at <= threshold {
        return Ok(());
    }

    let adapter = app.chains.get(&item.chain)?;
    if adapter.is_utxo() {
        return Ok(());
    }
    if !adapter.is_transaction_stuck(&tx.txid).await? {
        return Ok(());
    }

    if item.gas_bump_attempts >= app.config.app.max_gas_bump_attempts as i32 {
        // Out of bumps: hand over to the operator rather than spinning.
        let pool = &app.database.pool;
        retry_tx!(pool, tx_db, {
            tx_db
                .update_item_status(item.id, ItemStatus::Completed)
                .await?;
            tx_db
                .add_deal_event(
                    &item.deal_id,
                    Severity::Critical,
                    None,
                    &format!(
                        "{} {} stuck after {} gas bumps, force-completed for operator review",
                        item.purpose, tx.txid, item.gas_bump_attempts
                    ),
                )
                .await?;
            tx_db
                .insert_alert(
                    "gas_bump_exhausted",
                    &format!("item {} ({}) requires manual intervention", item.id, tx.txid),
                )
                .await?;
            Ok::<_, crate::database::Error>(())
        })
        .await?;
        return Ok(());
    }

    let Some(nonce) = item.original_nonce else {
        return Ok(());
    };

    let fees = adapter.get_current_gas_price().await?;
    let options = bump_gas_options(nonce, item.last_gas_price.or(tx.gas_price), &fees);
    let bumped_price = options.gas_price.or(options.max_fee_per_gas);

    let sent = adapter
        .send(&item.asset, &item.from, &item.to, item.amount, options)
        .await?;

    let new_tx = make_tx_ref(&item.chain, tx.required_confirms, &sent);
    let attempts = item.gas_bump_attempts + 1;
    app.database
        .record_gas_bump(item.id, &new_tx, attempts, sent.gas_price.or(bumped_price))
        .await?;
    app.database
        .add_deal_event(
            &item.deal_id,
            Severity::Warning,
            None,
            &format!(
                "{} resubmitted as {} with bumped gas (attempt {attempts})",
                item.purpose, new_tx.txid
            ),
        )
        .await?;

    info!(item = item.id, txid = %new_tx.txid, attempts, "stuck transaction gas-bumped");
    Ok(())
}

fn bump(value: u64) -> u64 {
    // x1.2, integer arithmetic
    value.saturating_mul(12) / 10
}

/// New fee options for a same-nonce replacement: prior price x1.2, but never
/// below what the network currently asks.
fn bump_gas_options(nonce: i64, last_gas_price: Option<u64>, current: &FeeData) -> SendOptions {
    let mut options = SendOptions {
        nonce: Some(nonce),
        ..SendOptions::default()
    };

    if current.max_fee_per_gas.is_some() || current.max_priority_fee_per_gas.is_some() {
        let prior = last_gas_price.map(bump).unwrap_or_default();
        options.max_fee_per_gas = Some(prior.max(current.max_fee_per_gas.unwrap_or_default()));
        options.max_priority_fee_per_gas = current.max_priority_fee_per_gas.map(bump);
    } else {
        let prior = last_gas_price.map(bump).unwrap_or_default();
        options.gas_price = Some(prior.max(current.gas_price.unwrap_or_default()));
    }

    options
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_bump_multiplies_by_one_point_two() {
        let current = FeeData {
            gas_price: Some(10_000_000_000),
            ..FeeData::default()
        };

        let options = bump_gas_options(7, Some(100_000_000_000), &current);

        assert_eq!(options.nonce, Some(7));
        assert_eq!(options.gas_price, Some(120_000_000_000));
        assert_eq!(options.max_fee_per_gas, None);
    }

    #[test]
    fn bump_never_drops_below_network_price() {
        let current = FeeData {
            gas_price: Some(500_000_000_000),
            ..FeeData::default()
        };

        let options = bump_gas_options(7, Some(100_000_000_000), &current);

        assert_eq!(options.gas_price, Some(500_000_000_000));
    }

    #[test]
    fn eip1559_bump_uses_fee_caps() {
        let current = FeeData {
            gas_price: None,
            max_fee_per_gas: Some(80_000_000_000),
            max_priority_fee_per_gas: Some(2_000_000_000),
        };

        let options = bump_gas_options(3, Some(100_000_000_000), &current);

        assert_eq!(options.gas_price, None);
        assert_eq!(options.max_fee_per_gas, Some(120_000_000_000));
        assert_eq!(options.max_priority_fee_per_gas, Some(2_400_000_000));
    }
}
