// src/routes/slot_routes.rs

use axum::{
    Json, Router,
    extract::{Query, State},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    domain::appointment::AppointmentStatus,
    domain::capacity::{self, DEFAULT_PROVIDER_DAILY_MAX},
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState, SlotRow},
    store,
};

fn is_admin(auth: &AuthContext) -> bool {
    auth.role == 1
}
fn is_consultant(auth: &AuthContext) -> bool {
    auth.role == 3
}

fn ensure_provider(auth: &AuthContext) -> Result<(), ApiError> {
    if is_admin(auth) || is_consultant(auth) {
        Ok(())
    } else {
        Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Only consultants/admin can publish slots".into(),
        ))
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/slots", post(create_slot))
        .route("/slots/batch", post(create_slots_batch))
        .route("/slots", get(list_slots))
}

/* ============================================================
   DTOs
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct CreateSlotRequest {
    pub service_id: Uuid,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub max_daily_appointments: Option<i32>,
    /// Admin may publish slots for a consultant.
    pub provider_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct CreateSlotsBatchRequest {
    pub slots: Vec<CreateSlotRequest>,
}

#[derive(Debug, Serialize)]
pub struct SlotDto {
    pub slot_id: Uuid,
    pub provider_id: Uuid,
    pub service_id: Uuid,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub is_booked: bool,
    pub max_daily_appointments: i32,
}

impl From<SlotRow> for SlotDto {
    fn from(r: SlotRow) -> Self {
        SlotDto {
            slot_id: r.slot_id,
            provider_id: r.provider_id,
            service_id: r.service_id,
            start_at: r.start_at,
            end_at: r.end_at,
            is_booked: r.is_booked,
            max_daily_appointments: r.max_daily_appointments,
        }
    }
}

/* ============================================================
   POST /slots, POST /slots/batch
   ============================================================ */

pub async fn create_slot(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateSlotRequest>,
) -> Result<Json<ApiOk<SlotDto>>, ApiError> {
    ensure_provider(&auth)?;

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;
    let slot_id = insert_slot(&mut tx, &auth, &req).await?;
    tx.commit().await.map_err(ApiError::db)?;

    let row = fetch_slot(&state, slot_id).await?;
    Ok(Json(ApiOk { data: row.into() }))
}

/// All-or-nothing: one overlapping window rejects the whole batch.
pub async fn create_slots_batch(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateSlotsBatchRequest>,
) -> Result<Json<ApiOk<Vec<SlotDto>>>, ApiError> {
    ensure_provider(&auth)?;

    if req.slots.is_empty() {
        return Err(ApiError::validation("slots must not be empty"));
    }

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;
    let mut ids = Vec::with_capacity(req.slots.len());
    for slot in &req.slots {
        ids.push(insert_slot(&mut tx, &auth, slot).await?);
    }
    tx.commit().await.map_err(ApiError::db)?;

    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        out.push(fetch_slot(&state, id).await?.into());
    }
    Ok(Json(ApiOk { data: out }))
}

async fn insert_slot(
    tx: &mut sqlx::PgConnection,
    auth: &AuthContext,
    req: &CreateSlotRequest,
) -> Result<Uuid, ApiError> {
    if req.end_at <= req.start_at {
        return Err(ApiError::validation("end_at must be > start_at"));
    }
    let provider_id = match req.provider_id {
        Some(id) if id != auth.user_id && !is_admin(auth) => {
            return Err(ApiError::Forbidden(
                "FORBIDDEN",
                "Consultants can only publish their own slots".into(),
            ));
        }
        Some(id) => id,
        None => auth.user_id,
    };

    // Overlap freedom per provider: no other live slot or appointment may
    // intersect this window. Checked under the provider's advisory row set
    // within the batch transaction.
    let slot_overlap: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS(
          SELECT 1 FROM slot
          WHERE provider_id = $1
            AND deleted_at IS NULL
            AND start_at < $3 AND $2 < end_at
        )
        "#,
    )
    .bind(provider_id)
    .bind(req.start_at)
    .bind(req.end_at)
    .fetch_one(&mut *tx)
    .await
    .map_err(ApiError::db)?;
    if slot_overlap {
        return Err(ApiError::Conflict(
            "SLOT_OVERLAP",
            "window overlaps an existing slot for this provider".into(),
        ));
    }

    let appointment_overlap: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS(
          SELECT 1 FROM appointment
          WHERE provider_id = $1
            AND deleted_at IS NULL
            AND status <> $2
            AND start_at < $4 AND $3 < end_at
        )
        "#,
    )
    .bind(provider_id)
    .bind(AppointmentStatus::Cancelled)
    .bind(req.start_at)
    .bind(req.end_at)
    .fetch_one(&mut *tx)
    .await
    .map_err(ApiError::db)?;
    if appointment_overlap {
        return Err(ApiError::Conflict(
            "SLOT_OVERLAP",
            "window overlaps an existing appointment for this provider".into(),
        ));
    }

    let slot_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO slot (
          slot_id, provider_id, service_id, start_at, end_at,
          is_booked, max_daily_appointments, created_at
        )
        VALUES ($1,$2,$3,$4,$5,false,$6,now())
        "#,
    )
    .bind(slot_id)
    .bind(provider_id)
    .bind(req.service_id)
    .bind(req.start_at)
    .bind(req.end_at)
    .bind(
        req.max_daily_appointments
            .unwrap_or(DEFAULT_PROVIDER_DAILY_MAX),
    )
    .execute(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    store::append_audit(&mut *tx, auth.user_id, "slot.create", "slot", slot_id, None)
        .await
        .map_err(ApiError::db)?;

    Ok(slot_id)
}

async fn fetch_slot(state: &AppState, slot_id: Uuid) -> Result<SlotRow, ApiError> {
    sqlx::query_as::<_, SlotRow>(
        r#"
        SELECT slot_id, provider_id, service_id, start_at, end_at,
               is_booked, max_daily_appointments, deleted_at, created_at
        FROM slot
        WHERE slot_id = $1
        "#,
    )
    .bind(slot_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("slot"))
}

/* ============================================================
   GET /slots
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct ListSlotsQuery {
    pub service_id: Option<Uuid>,
    pub provider_id: Option<Uuid>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// default true: only unclaimed future slots
    pub available_only: Option<bool>,
}

pub async fn list_slots(
    State(state): State<AppState>,
    _auth: AuthContext,
    Query(q): Query<ListSlotsQuery>,
) -> Result<Json<ApiOk<Vec<SlotDto>>>, ApiError> {
    let available_only = q.available_only.unwrap_or(true);
    let from = q.from.unwrap_or_else(Utc::now);
    let to = q
        .to
        .unwrap_or_else(|| from + chrono::Duration::days(capacity::MAX_BOOKING_AHEAD_DAYS));

    let rows = sqlx::query_as::<_, SlotRow>(
        r#"
        SELECT slot_id, provider_id, service_id, start_at, end_at,
               is_booked, max_daily_appointments, deleted_at, created_at
        FROM slot
        WHERE deleted_at IS NULL
          AND ($1::uuid IS NULL OR service_id = $1)
          AND ($2::uuid IS NULL OR provider_id = $2)
          AND start_at >= $3 AND start_at < $4
          AND (NOT $5 OR is_booked = false)
        ORDER BY start_at ASC
        "#,
    )
    .bind(q.service_id)
    .bind(q.provider_id)
    .bind(from)
    .bind(to)
    .bind(available_only)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk {
        data: rows.into_iter().map(SlotDto::from).collect(),
    }))
}
