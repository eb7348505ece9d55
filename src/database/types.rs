//! Row decoding for the repository layer.
//!
//! Amounts are stored as TEXT and parsed back through `rust_decimal`; JSON
//! columns carry the serde representation of their domain types.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::Row;

use crate::chain::EscrowRef;
use crate::database::Error;
use crate::deal::{
    CommissionPlan, Deal, DealEvent, EscrowDeposit, GasReimbursement, PartyDetails, Severity,
    SideSpec, SideState, Stage,
};
use crate::queue::{ItemStatus, Payout, PayoutStatus, Phase, Purpose, QueueItem, TxRef};

/// Per `(chain, address)` nonce bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountNonceState {
    pub next_nonce: i64,
    pub last_confirmed_nonce: Option<i64>,
}

/// A recorded tank-wallet top-up of an escrow address.
#[derive(Debug, Clone, PartialEq)]
pub struct GasFunding {
    pub deal_id: String,
    pub chain: String,
    pub escrow_address: String,
    pub amount: Decimal,
    pub txid: String,
    pub created_at: DateTime<Utc>,
}

pub(crate) fn decimal_column(row: &PgRow, column: &str) -> Result<Decimal, Error> {
    let raw: &str = row.get(column);
    Decimal::from_str(raw).map_err(|e| Error::Decode(format!("bad decimal in {column}: {e}")))
}

pub(crate) fn optional_decimal_column(
    row: &PgRow,
    column: &str,
) -> Result<Option<Decimal>, Error> {
    let raw: Option<&str> = row.get(column);
    raw.map(|raw| {
        Decimal::from_str(raw).map_err(|e| Error::Decode(format!("bad decimal in {column}: {e}")))
    })
    .transpose()
}

pub(crate) fn deal_from_row(row: &PgRow) -> Result<Deal, Error> {
    let stage: Stage = row.get::<&str, _>("stage").parse().map_err(Error::Decode)?;

    Ok(Deal {
        deal_id: row.get("deal_id"),
        stage,
        created_at: row.get("created_at"),
        timeout_seconds: row.get("timeout_seconds"),
        expires_at: row.get("expires_at"),
        alice_spec: row.get::<Json<SideSpec>, _>("alice_spec").0,
        bob_spec: row.get::<Json<SideSpec>, _>("bob_spec").0,
        commission_plan: row.get::<Json<CommissionPlan>, _>("commission_plan").0,
        escrow_a: row
            .get::<Option<Json<EscrowRef>>, _>("escrow_a")
            .map(|json| json.0),
        escrow_b: row
            .get::<Option<Json<EscrowRef>>, _>("escrow_b")
            .map(|json| json.0),
        alice_details: row
            .get::<Option<Json<PartyDetails>>, _>("alice_details")
            .map(|json| json.0),
        bob_details: row
            .get::<Option<Json<PartyDetails>>, _>("bob_details")
            .map(|json| json.0),
        side_a: row.get::<Json<SideState>, _>("side_a").0,
        side_b: row.get::<Json<SideState>, _>("side_b").0,
        gas_reimbursement: row
            .get::<Json<GasReimbursement>, _>("gas_reimbursement")
            .0,
        last_stage_at: row.get("last_stage_at"),
    })
}

pub(crate) fn deposit_from_row(row: &PgRow) -> Result<EscrowDeposit, Error> {
    let tx_index: i64 = row.get("tx_index");

    Ok(EscrowDeposit {
        txid: row.get("txid"),
        index: (tx_index >= 0).then_some(tx_index as u32),
        amount: decimal_column(row, "amount")?,
        asset: row.get("asset"),
        block_height: row
            .get::<Option<i64>, _>("block_height")
            .map(|height| height as u64),
        block_time: row.get("block_time"),
        confirms: row.get::<i64, _>("confirms") as u32,
        synthetic: row.get("synthetic"),
    })
}

pub(crate) fn queue_item_from_row(row: &PgRow) -> Result<QueueItem, Error> {
    let purpose: Purpose = row
        .get::<&str, _>("purpose")
        .parse()
        .map_err(Error::Decode)?;
    let status: ItemStatus = row
        .get::<&str, _>("status")
        .parse()
        .map_err(Error::Decode)?;
    let phase = row
        .get::<Option<i16>, _>("phase")
        .map(|raw| Phase::from_i16(raw).ok_or_else(|| Error::Decode(format!("bad phase {raw}"))))
        .transpose()?;

    Ok(QueueItem {
        id: row.get("id"),
        deal_id: row.get("deal_id"),
        chain: row.get("chain"),
        from: EscrowRef {
            address: row.get("from_address"),
            key_handle: row.get("from_key_handle"),
        },
        to: row.get("to_address"),
        asset: row.get("asset"),
        amount: decimal_column(row, "amount")?,
        purpose,
        phase,
        seq: row.get("seq"),
        status,
        payback: row.get("payback"),
        recipient: row.get("recipient"),
        fee_recipient: row.get("fee_recipient"),
        fees: optional_decimal_column(row, "fees")?,
        submitted_tx: row
            .get::<Option<Json<TxRef>>, _>("submitted_tx")
            .map(|json| json.0),
        gas_bump_attempts: row.get("gas_bump_attempts"),
        last_submit_at: row.get("last_submit_at"),
        original_nonce: row.get("original_nonce"),
        last_gas_price: row
            .get::<Option<i64>, _>("last_gas_price")
            .map(|price| price as u64),
        payout_id: row.get("payout_id"),
        created_at: row.get("created_at"),
    })
}

pub(crate) fn event_from_row(row: &PgRow) -> Result<DealEvent, Error> {
    let severity: Severity = row
        .get::<&str, _>("severity")
        .parse()
        .map_err(Error::Decode)?;
    let stage = row
        .get::<Option<&str>, _>("stage")
        .map(|raw| raw.parse::<Stage>().map_err(Error::Decode))
        .transpose()?;

    Ok(DealEvent {
        deal_id: row.get("deal_id"),
        severity,
        stage,
        message: row.get("message"),
        created_at: row.get("created_at"),
    })
}

pub(crate) fn payout_from_row(row: &PgRow) -> Result<Payout, Error> {
    let status = match row.get::<&str, _>("status") {
        "PENDING" => PayoutStatus::Pending,
        "CONFIRMED" => PayoutStatus::Confirmed,
        other => return Err(Error::Decode(format!("unknown payout status {other}"))),
    };

    Ok(Payout {
        id: row.get("id"),
        deal_id: row.get("deal_id"),
        chain: row.get("chain"),
        required_confirms: row.get::<i32, _>("required_confirms") as u32,
        status,
        created_at: row.get("created_at"),
    })
}

pub(crate) fn gas_funding_from_row(row: &PgRow) -> Result<GasFunding, Error> {
    Ok(GasFunding {
        deal_id: row.get("deal_id"),
        chain: row.get("chain"),
        escrow_address: row.get("escrow_address"),
        amount: decimal_column(row, "amount")?,
        txid: row.get("txid"),
        created_at: row.get("created_at"),
    })
}
