//! Transaction-scoped persistence helpers shared by the route layer and the
//! background sweep. Everything here takes `&mut PgConnection` so the caller
//! decides the transaction boundary.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::domain::appointment::AppointmentStatus;
use crate::domain::payment::ObligationStatus;
use crate::models::AppointmentRow;

const APPOINTMENT_COLUMNS: &str = r#"
    appointment_id, customer_id, provider_id, service_id, slot_id,
    kind, delivery_mode, status, payment_state,
    start_at, end_at, session_name,
    is_free_consultation, related_appointment_id, meeting_link, test_code,
    free_consultation_valid_until, sample_collected_at,
    deleted_at, created_at, updated_at
"#;

/// Load an appointment under a row lock for the remainder of the transaction.
pub async fn lock_appointment(
    conn: &mut PgConnection,
    appointment_id: Uuid,
) -> Result<Option<AppointmentRow>, sqlx::Error> {
    sqlx::query_as::<_, AppointmentRow>(&format!(
        r#"
        SELECT {APPOINTMENT_COLUMNS}
        FROM appointment
        WHERE appointment_id = $1
        FOR UPDATE
        "#
    ))
    .bind(appointment_id)
    .fetch_optional(conn)
    .await
}

pub async fn fetch_appointment(
    conn: &mut PgConnection,
    appointment_id: Uuid,
) -> Result<Option<AppointmentRow>, sqlx::Error> {
    sqlx::query_as::<_, AppointmentRow>(&format!(
        r#"
        SELECT {APPOINTMENT_COLUMNS}
        FROM appointment
        WHERE appointment_id = $1
        "#
    ))
    .bind(appointment_id)
    .fetch_optional(conn)
    .await
}

/// Append-only transition log; used for compliance replay, never read back
/// for control flow.
pub async fn append_status_history(
    conn: &mut PgConnection,
    appointment_id: Uuid,
    from: Option<AppointmentStatus>,
    to: AppointmentStatus,
    actor_id: Uuid,
    note: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO appointment_status_history
          (history_id, appointment_id, from_status, to_status, actor_id, note, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, now())
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(appointment_id)
    .bind(from)
    .bind(to)
    .bind(actor_id)
    .bind(note)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn append_audit(
    conn: &mut PgConnection,
    actor_id: Uuid,
    action: &str,
    entity: &str,
    entity_id: Uuid,
    note: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO audit_log (audit_id, actor_id, action, entity, entity_id, note, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, now())
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(actor_id)
    .bind(action)
    .bind(entity)
    .bind(entity_id)
    .bind(note)
    .execute(conn)
    .await?;
    Ok(())
}

/// Unclaim the slot an appointment holds, if any. Idempotent.
pub async fn release_slot(
    conn: &mut PgConnection,
    slot_id: Option<Uuid>,
) -> Result<(), sqlx::Error> {
    let Some(slot_id) = slot_id else {
        return Ok(());
    };
    sqlx::query(
        r#"
        UPDATE slot
        SET is_booked = false
        WHERE slot_id = $1
        "#,
    )
    .bind(slot_id)
    .execute(conn)
    .await?;
    Ok(())
}

/// Cancel any still-Pending obligation of an appointment. Terminal rows are
/// untouched; an obligation never leaves a terminal state.
pub async fn cancel_pending_obligations(
    conn: &mut PgConnection,
    appointment_id: Uuid,
) -> Result<u64, sqlx::Error> {
    let res = sqlx::query(
        r#"
        UPDATE payment_obligation
        SET status = $1
        WHERE appointment_id = $2
          AND status = $3
        "#,
    )
    .bind(ObligationStatus::Cancelled)
    .bind(appointment_id)
    .bind(ObligationStatus::Pending)
    .execute(conn)
    .await?;
    Ok(res.rows_affected())
}

/// Lookup a customer's notification address; None when the account is gone,
/// in which case the notification is silently skipped.
pub async fn customer_email(
    conn: &mut PgConnection,
    customer_id: Uuid,
) -> Result<Option<String>, sqlx::Error> {
    let row: Option<(String,)> =
        sqlx::query_as(r#"SELECT email FROM app_user WHERE user_id = $1"#)
            .bind(customer_id)
            .fetch_optional(conn)
            .await?;
    Ok(row.map(|(email,)| email))
}

/// Shared timestamp formatting for customer-facing notification bodies.
pub fn human_time(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M UTC").to_string()
}
