//! Expiry sweep: reclaims bookings whose payment obligation went stale.
//!
//! Every interval, each expired Pending obligation is processed in its own
//! transaction: cancel the obligation, cancel the appointment, mark its
//! payment Failed, log the transition under the system actor, and release any
//! claimed slot.

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::domain::appointment::{AppointmentStatus, PaymentState};
use crate::domain::payment::{OBLIGATION_TTL_MINUTES, ObligationStatus};
use crate::models::{AppState, SYSTEM_ACTOR_ID};
use crate::store;

pub fn spawn(state: AppState) -> tokio::task::JoinHandle<()> {
    let interval = std::time::Duration::from_secs(state.config.sweep_interval_minutes * 60);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match run_sweep(&state.db).await {
                Ok(0) => {}
                Ok(n) => tracing::info!("payment sweep expired {n} obligation(s)"),
                Err(e) => tracing::warn!("payment sweep failed: {e}"),
            }
        }
    })
}

/// One pass. Returns the number of obligations expired.
pub async fn run_sweep(db: &PgPool) -> anyhow::Result<u64> {
    let now = Utc::now();

    // Stale: past the explicit expiry, or older than the TTL regardless.
    let ids: Vec<(Uuid,)> = sqlx::query_as(
        r#"
        SELECT obligation_id
        FROM payment_obligation
        WHERE status = $1
          AND (expires_at < $2 OR created_at < $2 - make_interval(mins => $3))
        "#,
    )
    .bind(ObligationStatus::Pending)
    .bind(now)
    .bind(OBLIGATION_TTL_MINUTES as i32)
    .fetch_all(db)
    .await?;

    let mut expired = 0u64;
    for (obligation_id,) in ids {
        match expire_one(db, obligation_id).await {
            Ok(true) => expired += 1,
            Ok(false) => {}
            Err(e) => tracing::warn!("could not expire obligation {obligation_id}: {e}"),
        }
    }
    Ok(expired)
}

/// Expire a single obligation and cascade, all inside one transaction.
/// Returns false when another writer settled it first.
async fn expire_one(db: &PgPool, obligation_id: Uuid) -> anyhow::Result<bool> {
    let mut tx = db.begin().await?;

    // Re-check under lock: the settlement callback may have won the race.
    let row: Option<(Uuid, ObligationStatus)> = sqlx::query_as(
        r#"
        SELECT appointment_id, status
        FROM payment_obligation
        WHERE obligation_id = $1
        FOR UPDATE
        "#,
    )
    .bind(obligation_id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some((appointment_id, status)) = row else {
        return Ok(false);
    };
    if status.is_terminal() {
        return Ok(false);
    }

    sqlx::query(r#"UPDATE payment_obligation SET status = $2 WHERE obligation_id = $1"#)
        .bind(obligation_id)
        .bind(ObligationStatus::Cancelled)
        .execute(&mut *tx)
        .await?;

    let appointment = store::lock_appointment(&mut *tx, appointment_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("appointment {appointment_id} missing"))?;

    sqlx::query(
        r#"
        UPDATE appointment
        SET status = $2, payment_state = $3, updated_at = now()
        WHERE appointment_id = $1
        "#,
    )
    .bind(appointment_id)
    .bind(AppointmentStatus::Cancelled)
    .bind(PaymentState::Failed)
    .execute(&mut *tx)
    .await?;

    store::append_status_history(
        &mut *tx,
        appointment_id,
        Some(appointment.status),
        AppointmentStatus::Cancelled,
        SYSTEM_ACTOR_ID,
        Some("payment obligation expired"),
    )
    .await?;
    store::append_audit(
        &mut *tx,
        SYSTEM_ACTOR_ID,
        "payment.expire",
        "payment_obligation",
        obligation_id,
        None,
    )
    .await?;
    store::release_slot(&mut *tx, appointment.slot_id).await?;

    tx.commit().await?;
    Ok(true)
}
