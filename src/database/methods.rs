use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::{Acquire, Postgres, Row};
use tracing::instrument;

use crate::database::types::{
    deal_from_row, deposit_from_row, event_from_row, gas_funding_from_row, payout_from_row,
    queue_item_from_row, AccountNonceState, GasFunding,
};
use crate::database::Error;
use crate::deal::{Deal, DealEvent, EscrowDeposit, Severity, Side, Stage};
use crate::queue::{ItemStatus, NewQueueItem, Payout, PayoutStatus, Phase, QueueItem, TxRef};

/// This trait provides the individual and composable queries to the
/// database. Each method is a single atomic query and can be composed
/// within a transaction.
#[async_trait]
pub trait DbMethods<'c>: Acquire<'c, Database = Postgres> + Sized + Send {
    // ---- deals ----

    #[instrument(skip(self, deal), level = "debug")]
    async fn insert_deal(self, deal: &Deal) -> Result<(), Error> {
        let mut conn = self.acquire().await?;

        sqlx::query(
            r#"
            INSERT INTO deals (
                deal_id, stage, created_at, timeout_seconds, expires_at,
                alice_spec, bob_spec, commission_plan,
                escrow_a, escrow_b, alice_details, bob_details,
                side_a, side_b, gas_reimbursement, last_stage_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(&deal.deal_id)
        .bind(<&str>::from(deal.stage))
        .bind(deal.created_at)
        .bind(deal.timeout_seconds)
        .bind(deal.expires_at)
        .bind(Json(&deal.alice_spec))
        .bind(Json(&deal.bob_spec))
        .bind(Json(&deal.commission_plan))
        .bind(deal.escrow_a.as_ref().map(Json))
        .bind(deal.escrow_b.as_ref().map(Json))
        .bind(deal.alice_details.as_ref().map(Json))
        .bind(deal.bob_details.as_ref().map(Json))
        .bind(Json(&deal.side_a))
        .bind(Json(&deal.side_b))
        .bind(Json(&deal.gas_reimbursement))
        .bind(deal.last_stage_at)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_deal(self, deal_id: &str) -> Result<Option<Deal>, Error> {
        let mut conn = self.acquire().await?;

        let row = sqlx::query(
            r#"
            SELECT * FROM deals WHERE deal_id = $1
            "#,
        )
        .bind(deal_id)
        .fetch_optional(&mut *conn)
        .await?;

        row.as_ref().map(deal_from_row).transpose()
    }

    /// Every deal the tick driver must advance: all stages except CLOSED.
    async fn get_active_deal_ids(self) -> Result<Vec<String>, Error> {
        let mut conn = self.acquire().await?;

        let rows = sqlx::query(
            r#"
            SELECT deal_id FROM deals
            WHERE stage <> 'CLOSED'
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&mut *conn)
        .await?;

        Ok(rows.into_iter().map(|row| row.get("deal_id")).collect())
    }

    /// CLOSED and REVERTED deals inside the late-deposit window whose last
    /// stage transition is old enough that in-flight transactions cannot be
    /// mistaken for late deposits.
    async fn get_settled_deal_ids(
        self,
        settled_after: DateTime<Utc>,
        settled_before: DateTime<Utc>,
    ) -> Result<Vec<String>, Error> {
        let mut conn = self.acquire().await?;

        let rows = sqlx::query(
            r#"
            SELECT deal_id FROM deals
            WHERE stage IN ('CLOSED', 'REVERTED')
            AND   last_stage_at >= $1
            AND   last_stage_at <= $2
            ORDER BY last_stage_at ASC
            "#,
        )
        .bind(settled_after)
        .bind(settled_before)
        .fetch_all(&mut *conn)
        .await?;

        Ok(rows.into_iter().map(|row| row.get("deal_id")).collect())
    }

    /// Persist the mutable runtime state of a deal: stage, expiry, side
    /// states and the gas reimbursement record.
    #[instrument(skip(self, deal), level = "debug")]
    async fn update_deal_runtime(self, deal: &Deal) -> Result<(), Error> {
        let mut conn = self.acquire().await?;

        let result = sqlx::query(
            r#"
            UPDATE deals
            SET stage = $2,
                expires_at = $3,
                side_a = $4,
                side_b = $5,
                gas_reimbursement = $6,
                last_stage_at = $7,
                updated_at = CURRENT_TIMESTAMP
            WHERE deal_id = $1
            "#,
        )
        .bind(&deal.deal_id)
        .bind(<&str>::from(deal.stage))
        .bind(deal.expires_at)
        .bind(Json(&deal.side_a))
        .bind(Json(&deal.side_b))
        .bind(Json(&deal.gas_reimbursement))
        .bind(deal.last_stage_at)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::MissingDeal {
                deal_id: deal.deal_id.clone(),
            });
        }

        Ok(())
    }

    async fn add_deal_event(
        self,
        deal_id: &str,
        severity: Severity,
        stage: Option<Stage>,
        message: &str,
    ) -> Result<(), Error> {
        let mut conn = self.acquire().await?;

        sqlx::query(
            r#"
            INSERT INTO deal_events (deal_id, severity, stage, message)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(deal_id)
        .bind(<&str>::from(severity))
        .bind(stage.map(<&str>::from))
        .bind(message)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    async fn get_deal_events(self, deal_id: &str) -> Result<Vec<DealEvent>, Error> {
        let mut conn = self.acquire().await?;

        let rows = sqlx::query(
            r#"
            SELECT * FROM deal_events WHERE deal_id = $1 ORDER BY id ASC
            "#,
        )
        .bind(deal_id)
        .fetch_all(&mut *conn)
        .await?;

        rows.iter().map(event_from_row).collect()
    }

    // ---- deposits ----

    #[instrument(skip(self, deposit), level = "debug")]
    async fn upsert_deposit(
        self,
        deal_id: &str,
        side: Side,
        chain: &str,
        escrow_address: &str,
        deposit: &EscrowDeposit,
    ) -> Result<(), Error> {
        let mut conn = self.acquire().await?;

        sqlx::query(
            r#"
            INSERT INTO deposits (
                deal_id, side, chain, escrow_address, txid, tx_index,
                amount, asset, block_height, block_time, confirms, synthetic
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (deal_id, side, txid, tx_index)
            DO UPDATE SET
                amount = EXCLUDED.amount,
                block_height = EXCLUDED.block_height,
                block_time = EXCLUDED.block_time,
                confirms = EXCLUDED.confirms,
                synthetic = EXCLUDED.synthetic,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(deal_id)
        .bind(side.as_str())
        .bind(chain)
        .bind(escrow_address)
        .bind(&deposit.txid)
        .bind(deposit.index.map_or(-1, i64::from))
        .bind(deposit.amount.to_string())
        .bind(&deposit.asset)
        .bind(deposit.block_height.map(|height| height as i64))
        .bind(deposit.block_time)
        .bind(i64::from(deposit.confirms))
        .bind(deposit.synthetic)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Remove a deposit the chain no longer knows about (reorged away).
    async fn delete_deposit(
        self,
        deal_id: &str,
        side: Side,
        txid: &str,
        tx_index: Option<u32>,
    ) -> Result<(), Error> {
        let mut conn = self.acquire().await?;

        sqlx::query(
            r#"
            DELETE FROM deposits
            WHERE deal_id = $1 AND side = $2 AND txid = $3 AND tx_index = $4
            "#,
        )
        .bind(deal_id)
        .bind(side.as_str())
        .bind(txid)
        .bind(tx_index.map_or(-1, i64::from))
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    async fn get_deposits(self, deal_id: &str, side: Side) -> Result<Vec<EscrowDeposit>, Error> {
        let mut conn = self.acquire().await?;

        let rows = sqlx::query(
            r#"
            SELECT * FROM deposits
            WHERE deal_id = $1 AND side = $2
            ORDER BY id ASC
            "#,
        )
        .bind(deal_id)
        .bind(side.as_str())
        .fetch_all(&mut *conn)
        .await?;

        rows.iter().map(deposit_from_row).collect()
    }

    // ---- queue ----

    /// Insert a PENDING item, assigning the next `seq` for its
    /// `(deal_id, sender)` pair.
    #[instrument(skip(self, item), level = "debug")]
    async fn enqueue_item(self, item: &NewQueueItem) -> Result<i64, Error> {
        let mut conn = self.acquire().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO queue_items (
                deal_id, chain, from_address, from_key_handle, to_address,
                asset, amount, purpose, phase, seq,
                payback, recipient, fee_recipient, fees, payout_id
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9,
                (
                    SELECT COALESCE(MAX(seq) + 1, 0) FROM queue_items
                    WHERE deal_id = $1 AND from_address = $3
                ),
                $10, $11, $12, $13, $14
            )
            RETURNING id
            "#,
        )
        .bind(&item.deal_id)
        .bind(&item.chain)
        .bind(&item.from.address)
        .bind(&item.from.key_handle)
        .bind(&item.to)
        .bind(&item.asset)
        .bind(item.amount.to_string())
        .bind(<&str>::from(item.purpose))
        .bind(item.phase.map(Phase::as_i16))
        .bind(item.payback.as_deref())
        .bind(item.recipient.as_deref())
        .bind(item.fee_recipient.as_deref())
        .bind(item.fees.map(|fees| fees.to_string()))
        .bind(item.payout_id)
        .fetch_one(&mut *conn)
        .await?;

        Ok(row.get("id"))
    }

    async fn get_items_by_deal(self, deal_id: &str) -> Result<Vec<QueueItem>, Error> {
        let mut conn = self.acquire().await?;

        let rows = sqlx::query(
            r#"
            SELECT * FROM queue_items WHERE deal_id = $1 ORDER BY seq ASC
            "#,
        )
        .bind(deal_id)
        .fetch_all(&mut *conn)
        .await?;

        rows.iter().map(queue_item_from_row).collect()
    }

    async fn get_pending_items(self) -> Result<Vec<QueueItem>, Error> {
        let mut conn = self.acquire().await?;

        let rows = sqlx::query(
            r#"
            SELECT * FROM queue_items
            WHERE status = 'PENDING'
            ORDER BY chain ASC, from_address ASC, seq ASC
            "#,
        )
        .fetch_all(&mut *conn)
        .await?;

        rows.iter().map(queue_item_from_row).collect()
    }

    async fn get_submitted_items(self) -> Result<Vec<QueueItem>, Error> {
        let mut conn = self.acquire().await?;

        let rows = sqlx::query(
            r#"
            SELECT * FROM queue_items
            WHERE status = 'SUBMITTED'
            ORDER BY chain ASC, from_address ASC, seq ASC
            "#,
        )
        .fetch_all(&mut *conn)
        .await?;

        rows.iter().map(queue_item_from_row).collect()
    }

    async fn update_item_status(self, id: i64, status: ItemStatus) -> Result<(), Error> {
        let mut conn = self.acquire().await?;

        sqlx::query(
            r#"
            UPDATE queue_items SET status = $2 WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(<&str>::from(status))
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Record a broadcast: item becomes SUBMITTED and carries the tx
    /// reference plus the submission metadata used by stuck-tx recovery.
    #[instrument(skip(self, tx), level = "debug")]
    async fn record_submission(
        self,
        id: i64,
        tx: &TxRef,
        nonce_key: &str,
        original_nonce: Option<i64>,
        last_gas_price: Option<u64>,
    ) -> Result<(), Error> {
        let mut conn = self.acquire().await?;

        sqlx::query(
            r#"
            UPDATE queue_items
            SET status = 'SUBMITTED',
                submitted_tx = $2,
                nonce_key = $3,
                original_nonce = $4,
                last_gas_price = $5,
                last_submit_at = CURRENT_TIMESTAMP
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(Json(tx))
        .bind(nonce_key)
        .bind(original_nonce)
        .bind(last_gas_price.map(|price| price as i64))
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Refresh the stored tx reference (confirmation counts, status).
    async fn update_item_tx(self, id: i64, tx: &TxRef) -> Result<(), Error> {
        let mut conn = self.acquire().await?;

        sqlx::query(
            r#"
            UPDATE queue_items SET submitted_tx = $2 WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(Json(tx))
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Record a same-nonce gas-bump resubmission.
    async fn record_gas_bump(
        self,
        id: i64,
        tx: &TxRef,
        gas_bump_attempts: i32,
        last_gas_price: Option<u64>,
    ) -> Result<(), Error> {
        let mut conn = self.acquire().await?;

        sqlx::query(
            r#"
            UPDATE queue_items
            SET submitted_tx = $2,
                gas_bump_attempts = $3,
                last_gas_price = $4,
                last_submit_at = CURRENT_TIMESTAMP
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(Json(tx))
        .bind(gas_bump_attempts)
        .bind(last_gas_price.map(|price| price as i64))
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Drop the not-yet-submitted swap payouts of a deal (reorg rollback).
    async fn delete_pending_swap_items(self, deal_id: &str) -> Result<u64, Error> {
        let mut conn = self.acquire().await?;

        let result = sqlx::query(
            r#"
            DELETE FROM queue_items
            WHERE deal_id = $1
            AND   status = 'PENDING'
            AND   purpose IN ('SWAP_PAYOUT', 'BROKER_SWAP')
            "#,
        )
        .bind(deal_id)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected())
    }

    async fn count_items(self, deal_id: &str) -> Result<i64, Error> {
        let mut conn = self.acquire().await?;

        let row = sqlx::query(
            r#"
            SELECT COUNT(*) FROM queue_items WHERE deal_id = $1
            "#,
        )
        .bind(deal_id)
        .fetch_one(&mut *conn)
        .await?;

        Ok(row.get::<i64, _>(0))
    }

    async fn count_incomplete_items(self, deal_id: &str) -> Result<i64, Error> {
        let mut conn = self.acquire().await?;

        let row = sqlx::query(
            r#"
            SELECT COUNT(*) FROM queue_items
            WHERE deal_id = $1 AND status <> 'COMPLETED'
            "#,
        )
        .bind(deal_id)
        .fetch_one(&mut *conn)
        .await?;

        Ok(row.get::<i64, _>(0))
    }

    /// Any swap payout of the deal that has not completed yet — refunds must
    /// never race one.
    async fn has_incomplete_swap_payout(self, deal_id: &str) -> Result<bool, Error> {
        let mut conn = self.acquire().await?;

        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM queue_items
                WHERE deal_id = $1
                AND   purpose IN ('SWAP_PAYOUT', 'BROKER_SWAP')
                AND   status <> 'COMPLETED'
            )
            "#,
        )
        .bind(deal_id)
        .fetch_one(&mut *conn)
        .await?;

        Ok(row.get::<bool, _>(0))
    }

    /// Has any swap payout already reached the chain? Guards `revert_deal`.
    async fn has_submitted_swap_payout(self, deal_id: &str) -> Result<bool, Error> {
        let mut conn = self.acquire().await?;

        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM queue_items
                WHERE deal_id = $1
                AND   purpose IN ('SWAP_PAYOUT', 'BROKER_SWAP')
                AND   status IN ('SUBMITTED', 'COMPLETED')
            )
            "#,
        )
        .bind(deal_id)
        .fetch_one(&mut *conn)
        .await?;

        Ok(row.get::<bool, _>(0))
    }

    /// UTXO phase gate: any earlier-phase item of the deal not COMPLETED.
    async fn earlier_phase_incomplete(self, deal_id: &str, phase: Phase) -> Result<bool, Error> {
        let mut conn = self.acquire().await?;

        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM queue_items
                WHERE deal_id = $1
                AND   phase IS NOT NULL
                AND   phase < $2
                AND   status <> 'COMPLETED'
            )
            "#,
        )
        .bind(deal_id)
        .bind(phase.as_i16())
        .fetch_one(&mut *conn)
        .await?;

        Ok(row.get::<bool, _>(0))
    }

    /// Nonces of SUBMITTED (non-REPLACED) items for one sender.
    async fn submitted_nonces(self, chain: &str, from_address: &str) -> Result<Vec<i64>, Error> {
        let mut conn = self.acquire().await?;

        let rows = sqlx::query(
            r#"
            SELECT original_nonce FROM queue_items
            WHERE chain = $1
            AND   from_address = $2
            AND   status = 'SUBMITTED'
            AND   original_nonce IS NOT NULL
            AND   COALESCE(submitted_tx->>'status', '') <> 'REPLACED'
            ORDER BY original_nonce ASC
            "#,
        )
        .bind(chain)
        .bind(from_address)
        .fetch_all(&mut *conn)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| row.get::<i64, _>("original_nonce"))
            .collect())
    }

    async fn get_highest_queued_nonce(
        self,
        chain: &str,
        from_address: &str,
    ) -> Result<Option<i64>, Error> {
        let mut conn = self.acquire().await?;

        let row = sqlx::query(
            r#"
            SELECT MAX(original_nonce) FROM queue_items
            WHERE chain = $1 AND from_address = $2
            "#,
        )
        .bind(chain)
        .bind(from_address)
        .fetch_one(&mut *conn)
        .await?;

        Ok(row.get::<Option<i64>, _>(0))
    }

    /// Another non-PENDING item of the same sender occupying the same nonce
    /// slot (or UTXO input set).
    async fn find_nonce_conflict(
        self,
        chain: &str,
        from_address: &str,
        nonce_key: &str,
        exclude_id: i64,
    ) -> Result<Option<i64>, Error> {
        let mut conn = self.acquire().await?;

        let row = sqlx::query(
            r#"
            SELECT id FROM queue_items
            WHERE chain = $1
            AND   from_address = $2
            AND   nonce_key = $3
            AND   id <> $4
            AND   status <> 'PENDING'
            AND   COALESCE(submitted_tx->>'status', '') <> 'REPLACED'
            LIMIT 1
            "#,
        )
        .bind(chain)
        .bind(from_address)
        .bind(nonce_key)
        .bind(exclude_id)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(row.map(|row| row.get::<i64, _>("id")))
    }

    async fn count_pending_items_total(self) -> Result<i64, Error> {
        let mut conn = self.acquire().await?;

        let row = sqlx::query("SELECT COUNT(*) FROM queue_items WHERE status = 'PENDING'")
            .fetch_one(&mut *conn)
            .await?;

        Ok(row.get::<i64, _>(0))
    }

    async fn count_submitted_items_total(self) -> Result<i64, Error> {
        let mut conn = self.acquire().await?;

        let row = sqlx::query("SELECT COUNT(*) FROM queue_items WHERE status = 'SUBMITTED'")
            .fetch_one(&mut *conn)
            .await?;

        Ok(row.get::<i64, _>(0))
    }

    // ---- accounts (nonce state) ----

    /// Atomically reserve the next nonce for `(chain, address)`.
    ///
    /// When no record exists the row is seeded with `initial_nonce` (the
    /// current on-chain value) and that value is returned; otherwise the
    /// stored counter is returned and advanced. Reservation anomalies are
    /// signalled by the caller observing an unexpected return value, not by
    /// errors.
    #[instrument(skip(self), level = "debug")]
    async fn reserve_next_nonce(
        self,
        chain: &str,
        address: &str,
        initial_nonce: i64,
    ) -> Result<i64, Error> {
        let mut conn = self.acquire().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO accounts (chain, address, next_nonce)
            VALUES ($1, $2, $3 + 1)
            ON CONFLICT (chain, address)
            DO UPDATE SET
                next_nonce = accounts.next_nonce + 1,
                updated_at = CURRENT_TIMESTAMP
            RETURNING next_nonce - 1
            "#,
        )
        .bind(chain)
        .bind(address)
        .bind(initial_nonce)
        .fetch_one(&mut *conn)
        .await?;

        Ok(row.get::<i64, _>(0))
    }

    async fn get_nonce_state(
        self,
        chain: &str,
        address: &str,
    ) -> Result<Option<AccountNonceState>, Error> {
        let mut conn = self.acquire().await?;

        let row = sqlx::query(
            r#"
            SELECT next_nonce, last_confirmed_nonce FROM accounts
            WHERE chain = $1 AND address = $2
            "#,
        )
        .bind(chain)
        .bind(address)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(row.map(|row| AccountNonceState {
            next_nonce: row.get("next_nonce"),
            last_confirmed_nonce: row.get("last_confirmed_nonce"),
        }))
    }

    /// Forget the account's nonce bookkeeping; the next reservation will
    /// re-sync from the chain.
    async fn reset_nonce(self, chain: &str, address: &str) -> Result<(), Error> {
        let mut conn = self.acquire().await?;

        sqlx::query(
            r#"
            DELETE FROM accounts WHERE chain = $1 AND address = $2
            "#,
        )
        .bind(chain)
        .bind(address)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    async fn update_last_confirmed_nonce(
        self,
        chain: &str,
        address: &str,
        nonce: i64,
    ) -> Result<(), Error> {
        let mut conn = self.acquire().await?;

        sqlx::query(
            r#"
            UPDATE accounts
            SET last_confirmed_nonce = GREATEST(COALESCE(last_confirmed_nonce, -1), $3),
                updated_at = CURRENT_TIMESTAMP
            WHERE chain = $1 AND address = $2
            "#,
        )
        .bind(chain)
        .bind(address)
        .bind(nonce)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    // ---- payouts ----

    async fn insert_payout(
        self,
        deal_id: &str,
        chain: &str,
        required_confirms: u32,
    ) -> Result<i64, Error> {
        let mut conn = self.acquire().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO payouts (deal_id, chain, required_confirms)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(deal_id)
        .bind(chain)
        .bind(required_confirms as i32)
        .fetch_one(&mut *conn)
        .await?;

        Ok(row.get("id"))
    }

    async fn get_payout(self, payout_id: i64) -> Result<Option<Payout>, Error> {
        let mut conn = self.acquire().await?;

        let row = sqlx::query(
            r#"
            SELECT * FROM payouts WHERE id = $1
            "#,
        )
        .bind(payout_id)
        .fetch_optional(&mut *conn)
        .await?;

        row.as_ref().map(payout_from_row).transpose()
    }

    async fn set_item_payout(self, item_id: i64, payout_id: i64) -> Result<(), Error> {
        let mut conn = self.acquire().await?;

        sqlx::query(
            r#"
            UPDATE queue_items SET payout_id = $2 WHERE id = $1
            "#,
        )
        .bind(item_id)
        .bind(payout_id)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// A payout confirms only when every linked item is COMPLETED and the
    /// minimum confirmation count across them satisfies the requirement.
    async fn payout_is_confirmed(self, payout_id: i64) -> Result<bool, Error> {
        let mut conn = self.acquire().await?;

        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE qi.status <> 'COMPLETED') AS incomplete,
                MIN(COALESCE((qi.submitted_tx->>'confirms')::BIGINT, 0)) AS min_confirms,
                p.required_confirms
            FROM payouts p
            LEFT JOIN queue_items qi ON qi.payout_id = p.id
            WHERE p.id = $1
            GROUP BY p.required_confirms
            "#,
        )
        .bind(payout_id)
        .fetch_optional(&mut *conn)
        .await?;

        let Some(row) = row else { return Ok(false) };

        let incomplete: i64 = row.get("incomplete");
        let min_confirms: Option<i64> = row.get("min_confirms");
        let required: i32 = row.get("required_confirms");

        Ok(incomplete == 0 && min_confirms.unwrap_or(0) >= i64::from(required))
    }

    async fn update_payout_status(self, payout_id: i64, status: PayoutStatus) -> Result<(), Error> {
        let mut conn = self.acquire().await?;

        let status = match status {
            PayoutStatus::Pending => "PENDING",
            PayoutStatus::Confirmed => "CONFIRMED",
        };

        sqlx::query(
            r#"
            UPDATE payouts SET status = $2 WHERE id = $1
            "#,
        )
        .bind(payout_id)
        .bind(status)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    // ---- gas fundings ----

    async fn upsert_gas_funding(
        self,
        deal_id: &str,
        chain: &str,
        escrow_address: &str,
        amount: Decimal,
        txid: &str,
    ) -> Result<(), Error> {
        let mut conn = self.acquire().await?;

        sqlx::query(
            r#"
            INSERT INTO gas_fundings (deal_id, chain, escrow_address, amount, txid)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (deal_id, chain, escrow_address)
            DO UPDATE SET amount = EXCLUDED.amount, txid = EXCLUDED.txid
            "#,
        )
        .bind(deal_id)
        .bind(chain)
        .bind(escrow_address)
        .bind(amount.to_string())
        .bind(txid)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    async fn get_gas_funding(
        self,
        deal_id: &str,
        chain: &str,
        escrow_address: &str,
    ) -> Result<Option<GasFunding>, Error> {
        let mut conn = self.acquire().await?;

        let row = sqlx::query(
            r#"
            SELECT * FROM gas_fundings
            WHERE deal_id = $1 AND chain = $2 AND escrow_address = $3
            "#,
        )
        .bind(deal_id)
        .bind(chain)
        .bind(escrow_address)
        .fetch_optional(&mut *conn)
        .await?;

        row.as_ref().map(gas_funding_from_row).transpose()
    }

    // ---- alerts ----

    /// Operator-facing anomaly, recorded distinctly from deal events.
    async fn insert_alert(self, kind: &str, message: &str) -> Result<(), Error> {
        let mut conn = self.acquire().await?;

        sqlx::query(
            r#"
            INSERT INTO alerts (kind, message)
            VALUES ($1, $2)
            "#,
        )
        .bind(kind)
        .bind(message)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl<'c, T> DbMethods<'c> for T where T: Acquire<'c, Database = Postgres> + Sized + Send {}
