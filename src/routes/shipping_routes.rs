// src/routes/shipping_routes.rs

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    domain::appointment::{AppointmentKind, AppointmentStatus, DeliveryMode},
    domain::shipping::{self, OutboundStatus, ReturnStatus},
    error::ApiError,
    external::carrier::{self, CarrierOrderRequest},
    external::notifier::notify_best_effort,
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState, OutboundShipmentRow, ReturnShipmentRow},
    store,
};

fn is_admin(auth: &AuthContext) -> bool {
    auth.role == 1
}
fn is_staff(auth: &AuthContext) -> bool {
    auth.role == 2
}
fn is_customer(auth: &AuthContext) -> bool {
    auth.role == 0
}

fn ensure_manage(auth: &AuthContext) -> Result<(), ApiError> {
    if is_admin(auth) || is_staff(auth) {
        Ok(())
    } else {
        Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Only admin/staff can manage shipments".into(),
        ))
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/appointments/{appointment_id}/shipments",
            get(get_shipments),
        )
        .route(
            "/appointments/{appointment_id}/shipments/outbound/dispatch",
            post(dispatch_outbound),
        )
        .route(
            "/appointments/{appointment_id}/shipments/return",
            post(request_return),
        )
        .route(
            "/shipments/outbound/{shipment_id}/status",
            post(advance_outbound),
        )
        .route(
            "/shipments/return/{shipment_id}/status",
            post(advance_return),
        )
}

/* ============================================================
   DTOs
   ============================================================ */

#[derive(Debug, Serialize)]
pub struct ShipmentLegDto {
    pub shipment_id: Uuid,
    pub appointment_id: Uuid,
    pub carrier_name: String,
    pub tracking_ref: Option<String>,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct ShipmentsDto {
    pub outbound: Option<ShipmentLegDto>,
    pub return_leg: Option<ShipmentLegDto>,
}

impl From<OutboundShipmentRow> for ShipmentLegDto {
    fn from(r: OutboundShipmentRow) -> Self {
        ShipmentLegDto {
            shipment_id: r.shipment_id,
            appointment_id: r.appointment_id,
            carrier_name: r.carrier_name,
            tracking_ref: r.tracking_ref,
            status: r.status.as_str().to_string(),
        }
    }
}

impl From<ReturnShipmentRow> for ShipmentLegDto {
    fn from(r: ReturnShipmentRow) -> Self {
        ShipmentLegDto {
            shipment_id: r.shipment_id,
            appointment_id: r.appointment_id,
            carrier_name: r.carrier_name,
            tracking_ref: r.tracking_ref,
            status: r.status.as_str().to_string(),
        }
    }
}

/* ============================================================
   GET /appointments/{id}/shipments
   ============================================================ */

pub async fn get_shipments(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<ApiOk<ShipmentsDto>>, ApiError> {
    let mut conn = state.db.acquire().await.map_err(ApiError::db)?;
    let appointment = store::fetch_appointment(&mut conn, appointment_id)
        .await
        .map_err(ApiError::db)?
        .ok_or_else(|| ApiError::not_found("appointment"))?;

    if is_customer(&auth) && appointment.customer_id != auth.user_id {
        return Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Customers can only view their own shipments".into(),
        ));
    }

    let outbound = fetch_outbound(&mut conn, appointment_id).await?;
    let return_leg = fetch_return(&mut conn, appointment_id).await?;

    Ok(Json(ApiOk {
        data: ShipmentsDto {
            outbound: outbound.map(Into::into),
            return_leg: return_leg.map(Into::into),
        },
    }))
}

/* ============================================================
   POST /appointments/{id}/shipments/outbound/dispatch

   Places (or retries) the external carrier order for the kit. The Pending
   shipment record is created at booking; retries here target the external
   call only.
   ============================================================ */

pub async fn dispatch_outbound(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<ApiOk<ShipmentLegDto>>, ApiError> {
    ensure_manage(&auth)?;
    dispatch_outbound_order(&state, appointment_id).await?;

    let mut conn = state.db.acquire().await.map_err(ApiError::db)?;
    let row = fetch_outbound(&mut conn, appointment_id)
        .await?
        .ok_or_else(|| ApiError::not_found("outbound shipment"))?;
    Ok(Json(ApiOk { data: row.into() }))
}

/// Carrier call with bounded retries; on success stamps the tracking ref.
/// Shared by the booking flow and the manual dispatch endpoint.
pub async fn dispatch_outbound_order(
    state: &AppState,
    appointment_id: Uuid,
) -> Result<(), ApiError> {
    let mut conn = state.db.acquire().await.map_err(ApiError::db)?;
    let row = fetch_outbound(&mut conn, appointment_id)
        .await?
        .ok_or_else(|| ApiError::not_found("outbound shipment"))?;
    drop(conn);

    let req = CarrierOrderRequest {
        origin: "lab".into(),
        destination: row.address.clone(),
        contact_name: row.contact_name.clone(),
        contact_phone: row.contact_phone.clone(),
        parcel_kind: "test-kit".into(),
    };

    let placed = carrier::ensure_order(state.carrier.as_ref(), row.tracking_ref.as_deref(), &req)
        .await
        .map_err(|e| {
            ApiError::Upstream(
                "CARRIER_FAILED",
                format!("carrier order could not be placed: {e}"),
            )
        })?;

    if let Some(order) = placed {
        sqlx::query(
            r#"
            UPDATE shipment_outbound
            SET tracking_ref = $2, updated_at = now()
            WHERE shipment_id = $1
            "#,
        )
        .bind(row.shipment_id)
        .bind(&order.tracking_ref)
        .execute(&state.db)
        .await
        .map_err(ApiError::db)?;
    }
    Ok(())
}

/* ============================================================
   POST /appointments/{id}/shipments/return
   ============================================================ */

pub async fn request_return(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<ApiOk<ShipmentLegDto>>, ApiError> {
    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    let appointment = store::lock_appointment(&mut *tx, appointment_id)
        .await
        .map_err(ApiError::db)?
        .ok_or_else(|| ApiError::not_found("appointment"))?;
    if appointment.deleted_at.is_some() {
        return Err(ApiError::not_found("appointment"));
    }
    if is_customer(&auth) && appointment.customer_id != auth.user_id {
        return Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Customers can only request returns for their own appointments".into(),
        ));
    }
    if appointment.kind != AppointmentKind::Testing
        || appointment.delivery_mode != DeliveryMode::Home
    {
        return Err(ApiError::BadRequest(
            "NOT_HOME_TESTING",
            "returns only apply to at-home testing appointments".into(),
        ));
    }

    let outbound = fetch_outbound(&mut *tx, appointment_id)
        .await?
        .ok_or_else(|| ApiError::not_found("outbound shipment"))?;

    // Policy, not hard rule: some deployments require confirmed kit delivery
    // before a pickup can be requested.
    if state.config.return_requires_delivery
        && outbound.status != OutboundStatus::DeliveredToCustomer
    {
        return Err(ApiError::BadRequest(
            "RETURN_NOT_READY",
            "kit has not been delivered yet".into(),
        ));
    }

    // Requesting twice is a no-op for the record itself, but a leg that never
    // got its carrier order still falls through to the pickup call below so a
    // failed first attempt is not stuck at PickupRequested forever.
    let (shipment_id, existing_tracking) =
        match fetch_return(&mut *tx, appointment_id).await? {
            Some(existing) => (existing.shipment_id, existing.tracking_ref),
            None => {
                let shipment_id = Uuid::new_v4();
                sqlx::query(
                    r#"
                    INSERT INTO shipment_return (
                      shipment_id, appointment_id, carrier_name,
                      contact_name, contact_phone, address,
                      status, created_at, updated_at
                    )
                    VALUES ($1,$2,$3,$4,$5,$6,$7,now(),now())
                    "#,
                )
                .bind(shipment_id)
                .bind(appointment_id)
                .bind(&outbound.carrier_name)
                .bind(&outbound.contact_name)
                .bind(&outbound.contact_phone)
                .bind(&outbound.address)
                .bind(ReturnStatus::PickupRequested)
                .execute(&mut *tx)
                .await
                .map_err(ApiError::db)?;

                store::append_audit(
                    &mut *tx,
                    auth.user_id,
                    "shipment.return.request",
                    "shipment_return",
                    shipment_id,
                    None,
                )
                .await
                .map_err(ApiError::db)?;
                (shipment_id, None)
            }
        };

    tx.commit().await.map_err(ApiError::db)?;

    // External pickup order, bounded retries, after the committed record.
    let req = CarrierOrderRequest {
        origin: outbound.address.clone(),
        destination: "lab".into(),
        contact_name: outbound.contact_name.clone(),
        contact_phone: outbound.contact_phone.clone(),
        parcel_kind: "sample-return".into(),
    };
    let placed = carrier::ensure_order(state.carrier.as_ref(), existing_tracking.as_deref(), &req)
        .await
        .map_err(|e| {
            ApiError::Upstream(
                "CARRIER_FAILED",
                format!("pickup order could not be placed: {e}"),
            )
        })?;
    if let Some(order) = placed {
        sqlx::query(
            r#"
            UPDATE shipment_return
            SET tracking_ref = $2, updated_at = now()
            WHERE shipment_id = $1
            "#,
        )
        .bind(shipment_id)
        .bind(&order.tracking_ref)
        .execute(&state.db)
        .await
        .map_err(ApiError::db)?;
    }

    let mut conn = state.db.acquire().await.map_err(ApiError::db)?;
    let row = fetch_return(&mut *conn, appointment_id)
        .await?
        .ok_or_else(|| ApiError::not_found("return shipment"))?;
    Ok(Json(ApiOk { data: row.into() }))
}

/* ============================================================
   Leg status transitions
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct AdvanceOutboundRequest {
    pub to: OutboundStatus,
}

pub async fn advance_outbound(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(shipment_id): Path<Uuid>,
    Json(req): Json<AdvanceOutboundRequest>,
) -> Result<Json<ApiOk<ShipmentLegDto>>, ApiError> {
    ensure_manage(&auth)?;

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    let row: OutboundShipmentRow = sqlx::query_as::<_, OutboundShipmentRow>(
        r#"
        SELECT shipment_id, appointment_id, carrier_name, tracking_ref,
               contact_name, contact_phone, address, status,
               deleted_at, created_at, updated_at
        FROM shipment_outbound
        WHERE shipment_id = $1
        FOR UPDATE
        "#,
    )
    .bind(shipment_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("outbound shipment"))?;
    if row.deleted_at.is_some() {
        return Err(ApiError::not_found("outbound shipment"));
    }

    shipping::validate_outbound_transition(row.status, req.to)?;

    sqlx::query(
        r#"UPDATE shipment_outbound SET status = $2, updated_at = now() WHERE shipment_id = $1"#,
    )
    .bind(shipment_id)
    .bind(req.to)
    .execute(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    store::append_audit(
        &mut *tx,
        auth.user_id,
        "shipment.outbound.status",
        "shipment_outbound",
        shipment_id,
        Some(req.to.as_str()),
    )
    .await
    .map_err(ApiError::db)?;

    tx.commit().await.map_err(ApiError::db)?;

    let mut conn = state.db.acquire().await.map_err(ApiError::db)?;
    let row = fetch_outbound(&mut *conn, row.appointment_id)
        .await?
        .ok_or_else(|| ApiError::not_found("outbound shipment"))?;
    Ok(Json(ApiOk { data: row.into() }))
}

#[derive(Debug, Deserialize)]
pub struct AdvanceReturnRequest {
    pub to: ReturnStatus,
}

pub async fn advance_return(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(shipment_id): Path<Uuid>,
    Json(req): Json<AdvanceReturnRequest>,
) -> Result<Json<ApiOk<ShipmentLegDto>>, ApiError> {
    ensure_manage(&auth)?;

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    let row: ReturnShipmentRow = sqlx::query_as::<_, ReturnShipmentRow>(
        r#"
        SELECT shipment_id, appointment_id, carrier_name, tracking_ref,
               contact_name, contact_phone, address, status,
               deleted_at, created_at, updated_at
        FROM shipment_return
        WHERE shipment_id = $1
        FOR UPDATE
        "#,
    )
    .bind(shipment_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("return shipment"))?;
    if row.deleted_at.is_some() {
        return Err(ApiError::not_found("return shipment"));
    }

    shipping::validate_return_transition(row.status, req.to)?;

    sqlx::query(
        r#"UPDATE shipment_return SET status = $2, updated_at = now() WHERE shipment_id = $1"#,
    )
    .bind(shipment_id)
    .bind(req.to)
    .execute(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    store::append_audit(
        &mut *tx,
        auth.user_id,
        "shipment.return.status",
        "shipment_return",
        shipment_id,
        Some(req.to.as_str()),
    )
    .await
    .map_err(ApiError::db)?;

    // The one place a fulfillment leg mutates the appointment directly:
    // reaching the lab collects the sample, inside this same transaction.
    let mut collected: Option<crate::models::AppointmentRow> = None;
    if req.to == ReturnStatus::ReturnedToLab {
        let appointment = store::lock_appointment(&mut *tx, row.appointment_id)
            .await
            .map_err(ApiError::db)?
            .ok_or_else(|| ApiError::not_found("appointment"))?;
        crate::domain::appointment::validate_transition(
            appointment.kind,
            appointment.status,
            AppointmentStatus::SampleCollected,
        )?;
        sqlx::query(
            r#"
            UPDATE appointment
            SET status = $2, sample_collected_at = now(), updated_at = now()
            WHERE appointment_id = $1
            "#,
        )
        .bind(appointment.appointment_id)
        .bind(AppointmentStatus::SampleCollected)
        .execute(&mut *tx)
        .await
        .map_err(ApiError::db)?;
        store::append_status_history(
            &mut *tx,
            appointment.appointment_id,
            Some(appointment.status),
            AppointmentStatus::SampleCollected,
            auth.user_id,
            Some("sample returned to lab"),
        )
        .await
        .map_err(ApiError::db)?;
        collected = Some(appointment);
    }

    tx.commit().await.map_err(ApiError::db)?;

    if let Some(appointment) = collected {
        let mut conn = state.db.acquire().await.map_err(ApiError::db)?;
        if let Ok(Some(email)) = store::customer_email(&mut *conn, appointment.customer_id).await {
            notify_best_effort(
                state.notifier.as_ref(),
                &email,
                "Sample received",
                "Your sample has arrived at the lab and is being processed.",
            )
            .await;
        }
    }

    let mut conn = state.db.acquire().await.map_err(ApiError::db)?;
    let row = fetch_return(&mut *conn, row.appointment_id)
        .await?
        .ok_or_else(|| ApiError::not_found("return shipment"))?;
    Ok(Json(ApiOk { data: row.into() }))
}

/* ============================================================
   Fetch helpers
   ============================================================ */

async fn fetch_outbound(
    conn: &mut sqlx::PgConnection,
    appointment_id: Uuid,
) -> Result<Option<OutboundShipmentRow>, ApiError> {
    sqlx::query_as::<_, OutboundShipmentRow>(
        r#"
        SELECT shipment_id, appointment_id, carrier_name, tracking_ref,
               contact_name, contact_phone, address, status,
               deleted_at, created_at, updated_at
        FROM shipment_outbound
        WHERE appointment_id = $1 AND deleted_at IS NULL
        "#,
    )
    .bind(appointment_id)
    .fetch_optional(conn)
    .await
    .map_err(ApiError::db)
}

async fn fetch_return(
    conn: &mut sqlx::PgConnection,
    appointment_id: Uuid,
) -> Result<Option<ReturnShipmentRow>, ApiError> {
    sqlx::query_as::<_, ReturnShipmentRow>(
        r#"
        SELECT shipment_id, appointment_id, carrier_name, tracking_ref,
               contact_name, contact_phone, address, status,
               deleted_at, created_at, updated_at
        FROM shipment_return
        WHERE appointment_id = $1 AND deleted_at IS NULL
        "#,
    )
    .bind(appointment_id)
    .fetch_optional(conn)
    .await
    .map_err(ApiError::db)
}
