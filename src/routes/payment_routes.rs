// src/routes/payment_routes.rs
//
// Settlement webhook. The gateway retries on non-2xx, so this endpoint
// absorbs duplicates, unknown orders and malformed statuses with a 200 and
// logs internally; a processing failure must never propagate back as an
// error.

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    domain::appointment::{self, AppointmentStatus},
    domain::payment::{self, ObligationStatus},
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState, ObligationRow, OkResponse, SYSTEM_ACTOR_ID},
    store,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/payments/callback", post(settlement_callback))
        .route(
            "/appointments/{appointment_id}/payment",
            get(get_obligation),
        )
}

#[derive(Debug, Deserialize)]
pub struct SettlementCallback {
    pub order_code: i64,
    pub status: String,
}

pub async fn settlement_callback(
    State(state): State<AppState>,
    Json(payload): Json<SettlementCallback>,
) -> Json<OkResponse> {
    if let Err(e) = process_settlement(&state, &payload).await {
        tracing::warn!(
            "settlement callback for order {} not applied: {e:?}",
            payload.order_code
        );
    }
    Json(OkResponse::ok())
}

async fn process_settlement(
    state: &AppState,
    payload: &SettlementCallback,
) -> Result<(), ApiError> {
    let Some(target) = payment::map_gateway_status(&payload.status) else {
        tracing::warn!(
            "unknown gateway status {:?} for order {}",
            payload.status,
            payload.order_code
        );
        return Ok(());
    };

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    let obligation: Option<ObligationRow> = sqlx::query_as::<_, ObligationRow>(
        r#"
        SELECT obligation_id, appointment_id, order_code, amount_cents, method,
               status, created_at, expires_at
        FROM payment_obligation
        WHERE order_code = $1
        FOR UPDATE
        "#,
    )
    .bind(payload.order_code)
    .fetch_optional(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    let Some(obligation) = obligation else {
        tracing::warn!("settlement for unknown order {}", payload.order_code);
        return Ok(());
    };

    // Idempotent: a terminal obligation never transitions again, and a
    // replayed callback lands here.
    if obligation.status.is_terminal() {
        return Ok(());
    }

    sqlx::query(r#"UPDATE payment_obligation SET status = $2 WHERE obligation_id = $1"#)
        .bind(obligation.obligation_id)
        .bind(target)
        .execute(&mut *tx)
        .await
        .map_err(ApiError::db)?;

    // map_gateway_status only yields terminal targets, so this is always Some.
    let Some((payment_state, teardown)) = payment::settlement_effect(target) else {
        return Ok(());
    };
    sqlx::query(
        r#"UPDATE appointment SET payment_state = $2, updated_at = now() WHERE appointment_id = $1"#,
    )
    .bind(obligation.appointment_id)
    .bind(payment_state)
    .execute(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    // A cancelled settlement reclaims the booking in the same transaction,
    // the way the expiry sweep does: the obligation is terminal now and the
    // sweep will never revisit it.
    if teardown {
        let row = store::lock_appointment(&mut *tx, obligation.appointment_id)
            .await
            .map_err(ApiError::db)?
            .ok_or_else(|| ApiError::not_found("appointment"))?;
        if !appointment::is_terminal(row.status) {
            sqlx::query(
                r#"UPDATE appointment SET status = $2, updated_at = now() WHERE appointment_id = $1"#,
            )
            .bind(row.appointment_id)
            .bind(AppointmentStatus::Cancelled)
            .execute(&mut *tx)
            .await
            .map_err(ApiError::db)?;
            store::append_status_history(
                &mut *tx,
                row.appointment_id,
                Some(row.status),
                AppointmentStatus::Cancelled,
                SYSTEM_ACTOR_ID,
                Some("payment cancelled by gateway"),
            )
            .await
            .map_err(ApiError::db)?;
            store::release_slot(&mut *tx, row.slot_id)
                .await
                .map_err(ApiError::db)?;
        }
    }

    store::append_audit(
        &mut *tx,
        SYSTEM_ACTOR_ID,
        "payment.settle",
        "payment_obligation",
        obligation.obligation_id,
        Some(&payload.status),
    )
    .await
    .map_err(ApiError::db)?;

    tx.commit().await.map_err(ApiError::db)?;

    tracing::info!(
        "order {} settled as {:?}",
        payload.order_code,
        target
    );
    Ok(())
}

/* ============================================================
   GET /appointments/{id}/payment
   ============================================================ */

#[derive(Debug, Serialize)]
pub struct ObligationDto {
    pub obligation_id: Uuid,
    pub appointment_id: Uuid,
    pub order_code: i64,
    pub amount_cents: i64,
    pub status: ObligationStatus,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub checkout_url: Option<String>,
}

pub async fn get_obligation(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<ApiOk<ObligationDto>>, ApiError> {
    let mut conn = state.db.acquire().await.map_err(ApiError::db)?;
    let appointment = store::fetch_appointment(&mut conn, appointment_id)
        .await
        .map_err(ApiError::db)?
        .ok_or_else(|| ApiError::not_found("appointment"))?;
    if auth.role == 0 && appointment.customer_id != auth.user_id {
        return Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Customers can only view their own payments".into(),
        ));
    }

    #[derive(sqlx::FromRow)]
    struct Row {
        obligation_id: Uuid,
        appointment_id: Uuid,
        order_code: i64,
        amount_cents: i64,
        status: ObligationStatus,
        expires_at: chrono::DateTime<chrono::Utc>,
        checkout_url: Option<String>,
    }

    let row = sqlx::query_as::<_, Row>(
        r#"
        SELECT obligation_id, appointment_id, order_code, amount_cents,
               status, expires_at, checkout_url
        FROM payment_obligation
        WHERE appointment_id = $1 AND deleted_at IS NULL
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .bind(appointment_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("payment obligation"))?;

    Ok(Json(ApiOk {
        data: ObligationDto {
            obligation_id: row.obligation_id,
            appointment_id: row.appointment_id,
            order_code: row.order_code,
            amount_cents: row.amount_cents,
            status: row.status,
            expires_at: row.expires_at,
            checkout_url: row.checkout_url,
        },
    }))
}
