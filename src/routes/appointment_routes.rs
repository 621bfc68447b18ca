// src/routes/appointment_routes.rs

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{delete, get, patch, post},
};
use chrono::{DateTime, NaiveDate, Utc};
use rand::thread_rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    domain::appointment::{
        self, AppointmentKind, AppointmentStatus, ConsultationMode, DeliveryMode, KindDetail,
        PaymentState, TestingDelivery,
    },
    domain::capacity::{self, CapacityRejection},
    domain::eligibility::{self, EligibilityRecord, EligibilityRejection, TEST_CODE_ATTEMPTS},
    domain::payment::{self, ORDER_CODE_ATTEMPTS, ObligationStatus},
    domain::shipping::ReturnStatus,
    error::ApiError,
    external::notifier::notify_best_effort,
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState, AppointmentRow, OkResponse, ServiceRow, SlotRow},
    store,
};

/*
Roles (app_user.role):
0 customer
1 admin
2 staff
3 consultant
*/

fn is_admin(auth: &AuthContext) -> bool {
    auth.role == 1
}
fn is_staff(auth: &AuthContext) -> bool {
    auth.role == 2
}
fn is_customer(auth: &AuthContext) -> bool {
    auth.role == 0
}

fn can_manage(auth: &AuthContext) -> bool {
    is_admin(auth) || is_staff(auth)
}

fn ensure_manage(auth: &AuthContext) -> Result<(), ApiError> {
    if can_manage(auth) {
        Ok(())
    } else {
        Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Only admin/staff can manage appointments".into(),
        ))
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/appointments/testing", post(create_testing_appointment))
        .route(
            "/appointments/consultation",
            post(create_consultation_appointment),
        )
        .route("/appointments", get(list_appointments))
        .route("/appointments/{appointment_id}", get(get_appointment))
        .route("/appointments/{appointment_id}", patch(patch_appointment))
        .route("/appointments/{appointment_id}", delete(delete_appointment))
        .route("/appointments/{appointment_id}/status", post(update_status))
        .route("/appointments/{appointment_id}/confirm", post(confirm_appointment))
        .route("/eligibility/{test_code}", get(check_eligibility))
}

/* ============================================================
   DTOs
   ============================================================ */

#[derive(Debug, Serialize)]
pub struct AppointmentDto {
    pub appointment_id: Uuid,
    pub customer_id: Uuid,
    pub provider_id: Option<Uuid>,
    pub service_id: Uuid,
    pub slot_id: Option<Uuid>,
    pub kind: AppointmentKind,
    pub delivery_mode: DeliveryMode,
    pub status: AppointmentStatus,
    pub payment_state: PaymentState,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub session_name: Option<String>,
    pub is_free_consultation: bool,
    pub related_appointment_id: Option<Uuid>,
    pub meeting_link: Option<String>,
    pub test_code: Option<String>,
    pub free_consultation_valid_until: Option<DateTime<Utc>>,
    pub sample_collected_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<AppointmentRow> for AppointmentDto {
    fn from(r: AppointmentRow) -> Self {
        AppointmentDto {
            appointment_id: r.appointment_id,
            customer_id: r.customer_id,
            provider_id: r.provider_id,
            service_id: r.service_id,
            slot_id: r.slot_id,
            kind: r.kind,
            delivery_mode: r.delivery_mode,
            status: r.status,
            payment_state: r.payment_state,
            start_at: r.start_at,
            end_at: r.end_at,
            session_name: r.session_name,
            is_free_consultation: r.is_free_consultation,
            related_appointment_id: r.related_appointment_id,
            meeting_link: r.meeting_link,
            test_code: r.test_code,
            free_consultation_valid_until: r.free_consultation_valid_until,
            sample_collected_at: r.sample_collected_at,
            created_at: r.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BookingResponse {
    pub appointment: AppointmentDto,
    /// Present when the booking carries a payment obligation.
    pub checkout_url: Option<String>,
    pub order_code: Option<i64>,
}

/* ============================================================
   POST /appointments/testing
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct CreateTestingRequest {
    pub service_id: Uuid,
    /// YYYY-MM-DD; the exact start time is assigned by the capacity ledger.
    pub date: String,
    pub session: String,
    pub delivery: TestingDelivery,
    /// Staff may book on behalf of a customer.
    pub customer_id: Option<Uuid>,
}

pub async fn create_testing_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateTestingRequest>,
) -> Result<Json<ApiOk<BookingResponse>>, ApiError> {
    let customer_id = resolve_booking_customer(&auth, req.customer_id)?;

    let date = NaiveDate::parse_from_str(req.date.trim(), "%Y-%m-%d")
        .map_err(|_| ApiError::validation("date must be YYYY-MM-DD"))?;

    let now = Utc::now();
    let day_start = DateTime::<Utc>::from_naive_utc_and_offset(
        date.and_hms_opt(0, 0, 0).unwrap(),
        Utc,
    );
    let today_start = DateTime::<Utc>::from_naive_utc_and_offset(
        now.date_naive().and_hms_opt(0, 0, 0).unwrap(),
        Utc,
    );
    capacity::validate_booking_window(today_start, day_start)?;

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    // Lock the service row: concurrent bookings for the same service/session
    // serialize here, so two requests cannot both observe a free seat.
    let service: ServiceRow = sqlx::query_as::<_, ServiceRow>(
        r#"
        SELECT service_id, kind, display_name, price_cents, daily_capacity,
               session_windows, is_active
        FROM service
        WHERE service_id = $1
        FOR UPDATE
        "#,
    )
    .bind(req.service_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("service"))?;

    if !service.is_active || service.kind != AppointmentKind::Testing {
        return Err(ApiError::BadRequest(
            "SERVICE_MISMATCH",
            "service is not an active testing service".into(),
        ));
    }

    let windows = capacity::parse_session_windows(service.session_windows.as_ref())
        .map_err(ApiError::from)?;
    let window = windows
        .iter()
        .find(|(name, _)| *name == req.session)
        .map(|(_, w)| w.clone())
        .ok_or(CapacityRejection::UnknownSession(req.session.clone()))?;

    let day_end = day_start + chrono::Duration::days(1);

    // Seats already taken in this session. An unpaid booking holds its seat
    // until it settles, fails, or the expiry sweep cancels it; counting only
    // paid rows would admit a second booking into a full session before the
    // first one settles.
    let session_rows: Vec<(AppointmentStatus, PaymentState)> = sqlx::query_as(
        r#"
        SELECT status, payment_state
        FROM appointment
        WHERE service_id = $1
          AND session_name = $2
          AND start_at >= $3 AND start_at < $4
          AND deleted_at IS NULL
        "#,
    )
    .bind(req.service_id)
    .bind(&req.session)
    .bind(day_start)
    .bind(day_end)
    .fetch_all(&mut *tx)
    .await
    .map_err(ApiError::db)?;
    let session_count = session_rows
        .iter()
        .filter(|(status, payment)| capacity::occupies_session_seat(*status, *payment))
        .count() as i64;

    let slot_time = capacity::admit_into_session(
        &window,
        service.daily_capacity,
        windows.len(),
        session_count,
    )?;
    let start_at = DateTime::<Utc>::from_naive_utc_and_offset(date.and_time(slot_time), Utc);
    let end_at = start_at + chrono::Duration::minutes(capacity::SESSION_SLOT_MINUTES);

    // Per-customer daily limit (service-agnostic).
    let daily: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM appointment
        WHERE customer_id = $1
          AND start_at >= $2 AND start_at < $3
          AND deleted_at IS NULL
          AND status <> $4
          AND payment_state = $5
        "#,
    )
    .bind(customer_id)
    .bind(day_start)
    .bind(day_end)
    .bind(AppointmentStatus::Cancelled)
    .bind(PaymentState::Paid)
    .fetch_one(&mut *tx)
    .await
    .map_err(ApiError::db)?;
    if daily >= capacity::CUSTOMER_DAILY_LIMIT {
        return Err(CapacityRejection::CustomerDailyLimit.into());
    }

    // Anti-spam guard: concurrent pending-payment bookings for this service.
    let pending: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM appointment
        WHERE customer_id = $1
          AND service_id = $2
          AND deleted_at IS NULL
          AND status = $3
          AND payment_state = $4
        "#,
    )
    .bind(customer_id)
    .bind(req.service_id)
    .bind(AppointmentStatus::Pending)
    .bind(PaymentState::Unpaid)
    .fetch_one(&mut *tx)
    .await
    .map_err(ApiError::db)?;
    if pending >= capacity::CUSTOMER_PENDING_LIMIT {
        return Err(CapacityRejection::PendingPaymentLimit.into());
    }

    let detail = KindDetail::Testing {
        delivery: req.delivery.clone(),
    };
    let appointment_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO appointment (
          appointment_id, customer_id, service_id, kind, delivery_mode,
          status, payment_state, start_at, end_at, session_name,
          is_free_consultation, created_at, updated_at
        )
        VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,false,now(),now())
        "#,
    )
    .bind(appointment_id)
    .bind(customer_id)
    .bind(req.service_id)
    .bind(AppointmentKind::Testing)
    .bind(detail.delivery_mode())
    .bind(AppointmentStatus::Pending)
    .bind(PaymentState::Unpaid)
    .bind(start_at)
    .bind(end_at)
    .bind(&req.session)
    .execute(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    let order_code =
        issue_obligation(&mut *tx, appointment_id, service.price_cents, now).await?;

    if let TestingDelivery::Home {
        contact_name,
        contact_phone,
        address,
    } = &req.delivery
    {
        sqlx::query(
            r#"
            INSERT INTO shipment_outbound (
              shipment_id, appointment_id, carrier_name,
              contact_name, contact_phone, address,
              status, created_at, updated_at
            )
            VALUES ($1,$2,'default',$3,$4,$5,$6,now(),now())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(appointment_id)
        .bind(contact_name)
        .bind(contact_phone)
        .bind(address)
        .bind(crate::domain::shipping::OutboundStatus::Pending)
        .execute(&mut *tx)
        .await
        .map_err(ApiError::db)?;
    }

    store::append_status_history(
        &mut *tx,
        appointment_id,
        None,
        AppointmentStatus::Pending,
        auth.user_id,
        Some("booked"),
    )
    .await
    .map_err(ApiError::db)?;
    store::append_audit(
        &mut *tx,
        auth.user_id,
        "appointment.create",
        "appointment",
        appointment_id,
        None,
    )
    .await
    .map_err(ApiError::db)?;

    tx.commit().await.map_err(ApiError::db)?;

    // Post-commit side effects. The booking row is valid without them; a
    // gateway failure is surfaced to the caller and the Pending obligation is
    // reclaimed by the expiry sweep.
    let checkout_url =
        create_payment_link(&state, customer_id, order_code, service.price_cents, &service)
            .await?;

    if matches!(req.delivery, TestingDelivery::Home { .. }) {
        crate::routes::shipping_routes::dispatch_outbound_order(&state, appointment_id).await?;
    }

    send_booking_notification(&state, customer_id, &service.display_name, start_at).await;

    let appointment = load_appointment_dto(&state, appointment_id).await?;
    Ok(Json(ApiOk {
        data: BookingResponse {
            appointment,
            checkout_url: Some(checkout_url),
            order_code: Some(order_code),
        },
    }))
}

/* ============================================================
   POST /appointments/consultation
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct CreateConsultationRequest {
    pub service_id: Uuid,
    pub slot_id: Uuid,
    pub mode: ConsultationMode,
    pub meeting_link: Option<String>,
    /// Present when the customer claims a free consultation funded by a
    /// completed test.
    pub test_code: Option<String>,
    pub customer_id: Option<Uuid>,
}

pub async fn create_consultation_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateConsultationRequest>,
) -> Result<Json<ApiOk<BookingResponse>>, ApiError> {
    let customer_id = resolve_booking_customer(&auth, req.customer_id)?;

    if req.mode == ConsultationMode::Clinic && req.meeting_link.is_some() {
        return Err(ApiError::validation(
            "meeting_link is only valid for online consultations",
        ));
    }

    let now = Utc::now();
    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    // Lock the slot: the claim decision and the claim itself stay in one
    // transaction, so two concurrent bookings cannot both take it.
    let slot: SlotRow = sqlx::query_as::<_, SlotRow>(
        r#"
        SELECT slot_id, provider_id, service_id, start_at, end_at,
               is_booked, max_daily_appointments, deleted_at, created_at
        FROM slot
        WHERE slot_id = $1
        FOR UPDATE
        "#,
    )
    .bind(req.slot_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("slot"))?;

    if slot.deleted_at.is_some() {
        return Err(CapacityRejection::SlotDeleted.into());
    }
    if slot.is_booked {
        return Err(CapacityRejection::SlotTaken.into());
    }
    if slot.service_id != req.service_id {
        return Err(ApiError::BadRequest(
            "SERVICE_MISMATCH",
            "slot does not belong to this service".into(),
        ));
    }

    capacity::validate_booking_window(now, slot.start_at)?;

    let service: ServiceRow = sqlx::query_as::<_, ServiceRow>(
        r#"
        SELECT service_id, kind, display_name, price_cents, daily_capacity,
               session_windows, is_active
        FROM service
        WHERE service_id = $1
        "#,
    )
    .bind(req.service_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("service"))?;

    if !service.is_active || service.kind != AppointmentKind::Consultation {
        return Err(ApiError::BadRequest(
            "SERVICE_MISMATCH",
            "service is not an active consultation service".into(),
        ));
    }

    let provider_verified: Option<bool> =
        sqlx::query_scalar(r#"SELECT is_verified FROM app_user WHERE user_id = $1"#)
            .bind(slot.provider_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(ApiError::db)?;
    if !provider_verified.unwrap_or(false) {
        return Err(CapacityRejection::ProviderUnverified.into());
    }

    // Provider's same-day paid appointment count against the slot's maximum.
    let slot_day_start = DateTime::<Utc>::from_naive_utc_and_offset(
        slot.start_at.date_naive().and_hms_opt(0, 0, 0).unwrap(),
        Utc,
    );
    let slot_day_end = slot_day_start + chrono::Duration::days(1);
    let provider_daily: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM appointment
        WHERE provider_id = $1
          AND start_at >= $2 AND start_at < $3
          AND deleted_at IS NULL
          AND status <> $4
          AND payment_state = $5
        "#,
    )
    .bind(slot.provider_id)
    .bind(slot_day_start)
    .bind(slot_day_end)
    .bind(AppointmentStatus::Cancelled)
    .bind(PaymentState::Paid)
    .fetch_one(&mut *tx)
    .await
    .map_err(ApiError::db)?;
    if provider_daily >= slot.max_daily_appointments as i64 {
        return Err(CapacityRejection::ProviderDailyLimit.into());
    }

    // Overlap freedom for the provider and for this customer+service pair.
    let provider_overlap: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS(
          SELECT 1 FROM appointment
          WHERE provider_id = $1
            AND deleted_at IS NULL
            AND status <> $2
            AND payment_state = $3
            AND start_at < $5 AND $4 < end_at
        )
        "#,
    )
    .bind(slot.provider_id)
    .bind(AppointmentStatus::Cancelled)
    .bind(PaymentState::Paid)
    .bind(slot.start_at)
    .bind(slot.end_at)
    .fetch_one(&mut *tx)
    .await
    .map_err(ApiError::db)?;
    if provider_overlap {
        return Err(CapacityRejection::OverlapProvider.into());
    }

    let customer_overlap: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS(
          SELECT 1 FROM appointment
          WHERE customer_id = $1
            AND service_id = $2
            AND deleted_at IS NULL
            AND status <> $3
            AND payment_state = $4
            AND start_at < $6 AND $5 < end_at
        )
        "#,
    )
    .bind(customer_id)
    .bind(req.service_id)
    .bind(AppointmentStatus::Cancelled)
    .bind(PaymentState::Paid)
    .bind(slot.start_at)
    .bind(slot.end_at)
    .fetch_one(&mut *tx)
    .await
    .map_err(ApiError::db)?;
    if customer_overlap {
        return Err(CapacityRejection::OverlapCustomer.into());
    }

    // Free-consultation claim: re-verified here, inside the transaction, so
    // of two concurrent claims on the same test code the first committer wins.
    let funding = match &req.test_code {
        Some(code) => Some(verify_free_claim(&mut *tx, code, customer_id, now).await?),
        None => None,
    };
    let is_free = funding.is_some();

    sqlx::query(r#"UPDATE slot SET is_booked = true WHERE slot_id = $1"#)
        .bind(slot.slot_id)
        .execute(&mut *tx)
        .await
        .map_err(ApiError::db)?;

    let appointment_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO appointment (
          appointment_id, customer_id, provider_id, service_id, slot_id,
          kind, delivery_mode, status, payment_state, start_at, end_at,
          is_free_consultation, related_appointment_id, meeting_link,
          created_at, updated_at
        )
        VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,now(),now())
        "#,
    )
    .bind(appointment_id)
    .bind(customer_id)
    .bind(slot.provider_id)
    .bind(req.service_id)
    .bind(slot.slot_id)
    .bind(AppointmentKind::Consultation)
    .bind(match req.mode {
        ConsultationMode::Clinic => DeliveryMode::Clinic,
        ConsultationMode::Online => DeliveryMode::Online,
    })
    .bind(AppointmentStatus::Pending)
    .bind(if is_free {
        PaymentState::Paid
    } else {
        PaymentState::Unpaid
    })
    .bind(slot.start_at)
    .bind(slot.end_at)
    .bind(is_free)
    .bind(funding)
    .bind(&req.meeting_link)
    .execute(&mut *tx)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            // partial unique index on (related_appointment_id) for free
            // consultations: the concurrent claim lost the race
            EligibilityRejection::AlreadyClaimed.into()
        } else {
            ApiError::db(e)
        }
    })?;

    let order_code = if is_free {
        None
    } else {
        Some(issue_obligation(&mut *tx, appointment_id, service.price_cents, now).await?)
    };

    store::append_status_history(
        &mut *tx,
        appointment_id,
        None,
        AppointmentStatus::Pending,
        auth.user_id,
        Some(if is_free { "booked (free claim)" } else { "booked" }),
    )
    .await
    .map_err(ApiError::db)?;
    store::append_audit(
        &mut *tx,
        auth.user_id,
        "appointment.create",
        "appointment",
        appointment_id,
        req.test_code.as_deref(),
    )
    .await
    .map_err(ApiError::db)?;

    tx.commit().await.map_err(ApiError::db)?;

    let checkout_url = match order_code {
        Some(code) => {
            Some(create_payment_link(&state, customer_id, code, service.price_cents, &service).await?)
        }
        None => None,
    };

    send_booking_notification(&state, customer_id, &service.display_name, slot.start_at).await;

    let appointment = load_appointment_dto(&state, appointment_id).await?;
    Ok(Json(ApiOk {
        data: BookingResponse {
            appointment,
            checkout_url,
            order_code,
        },
    }))
}

/* ============================================================
   GET /eligibility/{test_code}
   ============================================================ */

#[derive(Debug, Serialize)]
pub struct EligibilityDto {
    pub eligible: bool,
    pub reason: Option<String>,
    pub valid_until: Option<DateTime<Utc>>,
}

pub async fn check_eligibility(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(test_code): Path<String>,
) -> Result<Json<ApiOk<EligibilityDto>>, ApiError> {
    let mut conn = state.db.acquire().await.map_err(ApiError::db)?;
    let record = load_eligibility_record(&mut *conn, &test_code).await?;

    let Some((record, _)) = record else {
        return Err(EligibilityRejection::UnknownTestCode.into());
    };

    let valid_until = record.valid_until;
    match eligibility::evaluate(&record, auth.user_id, Utc::now()) {
        Ok(()) => Ok(Json(ApiOk {
            data: EligibilityDto {
                eligible: true,
                reason: None,
                valid_until,
            },
        })),
        Err(reason) => Ok(Json(ApiOk {
            data: EligibilityDto {
                eligible: false,
                reason: Some(reason.code().to_string()),
                valid_until,
            },
        })),
    }
}

/* ============================================================
   GET /appointments, GET /appointments/{id}
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub customer_id: Option<Uuid>,
    pub status: Option<AppointmentStatus>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

pub async fn list_appointments(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<ListQuery>,
) -> Result<Json<ApiOk<Vec<AppointmentDto>>>, ApiError> {
    // Customers only ever see their own bookings.
    let customer_filter = if is_customer(&auth) {
        Some(auth.user_id)
    } else {
        q.customer_id
    };

    let rows = sqlx::query_as::<_, AppointmentRow>(
        r#"
        SELECT
          appointment_id, customer_id, provider_id, service_id, slot_id,
          kind, delivery_mode, status, payment_state,
          start_at, end_at, session_name,
          is_free_consultation, related_appointment_id, meeting_link, test_code,
          free_consultation_valid_until, sample_collected_at,
          deleted_at, created_at, updated_at
        FROM appointment
        WHERE deleted_at IS NULL
          AND ($1::uuid IS NULL OR customer_id = $1)
          AND ($2::smallint IS NULL OR status = $2)
          AND ($3::timestamptz IS NULL OR start_at >= $3)
          AND ($4::timestamptz IS NULL OR start_at < $4)
        ORDER BY start_at ASC
        "#,
    )
    .bind(customer_filter)
    .bind(q.status)
    .bind(q.from)
    .bind(q.to)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk {
        data: rows.into_iter().map(AppointmentDto::from).collect(),
    }))
}

pub async fn get_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<ApiOk<AppointmentDto>>, ApiError> {
    let dto = load_appointment_dto(&state, appointment_id).await?;
    if is_customer(&auth) && dto.customer_id != auth.user_id {
        return Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Customers can only view their own appointments".into(),
        ));
    }
    Ok(Json(ApiOk { data: dto }))
}

/* ============================================================
   PATCH /appointments/{id}
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct PatchAppointmentRequest {
    pub provider_id: Option<Uuid>,
    pub meeting_link: Option<Option<String>>,
}

pub async fn patch_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
    Json(req): Json<PatchAppointmentRequest>,
) -> Result<Json<ApiOk<AppointmentDto>>, ApiError> {
    ensure_manage(&auth)?;

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    let row = store::lock_appointment(&mut *tx, appointment_id)
        .await
        .map_err(ApiError::db)?
        .ok_or_else(|| ApiError::not_found("appointment"))?;
    if row.deleted_at.is_some() {
        return Err(ApiError::not_found("appointment"));
    }
    if appointment::is_terminal(row.status) {
        return Err(ApiError::BadRequest(
            "APPOINTMENT_TERMINAL",
            "appointment is already completed or cancelled".into(),
        ));
    }
    // online consultations carry meeting links; nothing else does
    if let Some(Some(_)) = &req.meeting_link {
        if row.delivery_mode != DeliveryMode::Online {
            return Err(ApiError::validation(
                "meeting_link is only valid for online consultations",
            ));
        }
    }

    sqlx::query(
        r#"
        UPDATE appointment
        SET provider_id  = COALESCE($2, provider_id),
            meeting_link = COALESCE($3, meeting_link),
            updated_at = now()
        WHERE appointment_id = $1
        "#,
    )
    .bind(appointment_id)
    .bind(req.provider_id)
    .bind(req.meeting_link.unwrap_or(None))
    .execute(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    store::append_audit(
        &mut *tx,
        auth.user_id,
        "appointment.update",
        "appointment",
        appointment_id,
        None,
    )
    .await
    .map_err(ApiError::db)?;

    tx.commit().await.map_err(ApiError::db)?;

    let dto = load_appointment_dto(&state, appointment_id).await?;
    Ok(Json(ApiOk { data: dto }))
}

/* ============================================================
   Status transitions
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub to: AppointmentStatus,
    pub note: Option<String>,
    /// Structured result data; required when completing a testing
    /// appointment.
    pub result: Option<serde_json::Value>,
}

pub async fn update_status(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
    Json(req): Json<UpdateStatusRequest>,
) -> Result<Json<ApiOk<AppointmentDto>>, ApiError> {
    ensure_manage(&auth)?;

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    let row = store::lock_appointment(&mut *tx, appointment_id)
        .await
        .map_err(ApiError::db)?
        .ok_or_else(|| ApiError::not_found("appointment"))?;
    if row.deleted_at.is_some() {
        return Err(ApiError::not_found("appointment"));
    }

    apply_transition(&mut *tx, &row, req.to, req.result.as_ref(), auth.user_id, req.note.as_deref())
        .await?;

    tx.commit().await.map_err(ApiError::db)?;

    notify_status_change(&state, &row, req.to).await;

    let dto = load_appointment_dto(&state, appointment_id).await?;
    Ok(Json(ApiOk { data: dto }))
}

pub async fn confirm_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<ApiOk<AppointmentDto>>, ApiError> {
    ensure_manage(&auth)?;

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;
    let row = store::lock_appointment(&mut *tx, appointment_id)
        .await
        .map_err(ApiError::db)?
        .ok_or_else(|| ApiError::not_found("appointment"))?;
    if row.deleted_at.is_some() {
        return Err(ApiError::not_found("appointment"));
    }

    apply_transition(
        &mut *tx,
        &row,
        AppointmentStatus::Confirmed,
        None,
        auth.user_id,
        Some("confirmed by staff"),
    )
    .await?;

    tx.commit().await.map_err(ApiError::db)?;

    notify_status_change(&state, &row, AppointmentStatus::Confirmed).await;

    let dto = load_appointment_dto(&state, appointment_id).await?;
    Ok(Json(ApiOk { data: dto }))
}

/// Edge validation plus edge side effects, inside the caller's transaction.
async fn apply_transition(
    tx: &mut sqlx::PgConnection,
    row: &AppointmentRow,
    to: AppointmentStatus,
    result: Option<&serde_json::Value>,
    actor_id: Uuid,
    note: Option<&str>,
) -> Result<(), ApiError> {
    appointment::validate_transition(row.kind, row.status, to)?;

    match to {
        AppointmentStatus::Confirmed => {
            if row.payment_state != PaymentState::Paid && !row.is_free_consultation {
                return Err(ApiError::BadRequest(
                    "PAYMENT_REQUIRED",
                    "appointment cannot be confirmed before payment settles".into(),
                ));
            }
            if row.delivery_mode == DeliveryMode::Online && row.meeting_link.is_none() {
                return Err(ApiError::BadRequest(
                    "MEETING_LINK_REQUIRED",
                    "online consultation needs a meeting link before confirmation".into(),
                ));
            }
        }
        AppointmentStatus::SampleCollected
            if row.kind == AppointmentKind::Testing && row.delivery_mode == DeliveryMode::Home =>
        {
            let returned: Option<ReturnStatus> = sqlx::query_scalar(
                r#"
                SELECT status FROM shipment_return
                WHERE appointment_id = $1 AND deleted_at IS NULL
                "#,
            )
            .bind(row.appointment_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(ApiError::db)?;
            if returned != Some(ReturnStatus::ReturnedToLab) {
                return Err(ApiError::BadRequest(
                    "RETURN_NOT_COMPLETE",
                    "sample cannot be marked collected before the return shipment reaches the lab"
                        .into(),
                ));
            }
        }
        AppointmentStatus::Completed if row.kind == AppointmentKind::Testing => {
            let Some(result) = result else {
                return Err(ApiError::BadRequest(
                    "RESULT_REQUIRED",
                    "completing a testing appointment requires result data".into(),
                ));
            };
            record_test_completion(tx, row, result, actor_id).await?;
        }
        AppointmentStatus::Cancelled => {
            store::release_slot(&mut *tx, row.slot_id)
                .await
                .map_err(ApiError::db)?;
            store::cancel_pending_obligations(&mut *tx, row.appointment_id)
                .await
                .map_err(ApiError::db)?;
        }
        _ => {}
    }

    let mut set_collected_at = "".to_string();
    if to == AppointmentStatus::SampleCollected {
        set_collected_at = ", sample_collected_at = now()".to_string();
    }
    sqlx::query(&format!(
        r#"
        UPDATE appointment
        SET status = $2, updated_at = now(){set_collected_at}
        WHERE appointment_id = $1
        "#
    ))
    .bind(row.appointment_id)
    .bind(to)
    .execute(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    store::append_status_history(&mut *tx, row.appointment_id, Some(row.status), to, actor_id, note)
        .await
        .map_err(ApiError::db)?;
    store::append_audit(
        &mut *tx,
        actor_id,
        "appointment.status",
        "appointment",
        row.appointment_id,
        Some(to.as_str()),
    )
    .await
    .map_err(ApiError::db)?;

    Ok(())
}

/// Completion of a testing appointment: store the structured result, stamp
/// the eligibility window, and assign a unique test code if absent.
async fn record_test_completion(
    tx: &mut sqlx::PgConnection,
    row: &AppointmentRow,
    result: &serde_json::Value,
    actor_id: Uuid,
) -> Result<(), ApiError> {
    let now = Utc::now();
    let abnormal = appointment::result_is_abnormal(result);

    sqlx::query(
        r#"
        INSERT INTO test_result (result_id, appointment_id, data, is_abnormal, recorded_by, created_at)
        VALUES ($1,$2,$3,$4,$5,now())
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(row.appointment_id)
    .bind(result)
    .bind(abnormal)
    .bind(actor_id)
    .execute(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    if row.test_code.is_none() {
        // A statement error would abort the whole transaction, so collisions
        // are detected via rows_affected rather than the unique constraint.
        let mut assigned = false;
        for _ in 0..TEST_CODE_ATTEMPTS {
            // ThreadRng is not Send, keep it out of scope across the await
            let code = eligibility::generate_test_code(&mut thread_rng());
            let res = sqlx::query(
                r#"
                UPDATE appointment SET test_code = $2
                WHERE appointment_id = $1
                  AND NOT EXISTS (SELECT 1 FROM appointment WHERE test_code = $2)
                "#,
            )
            .bind(row.appointment_id)
            .bind(&code)
            .execute(&mut *tx)
            .await
            .map_err(ApiError::db)?;
            if res.rows_affected() == 1 {
                assigned = true;
                break;
            }
        }
        if !assigned {
            return Err(ApiError::Internal(
                "could not assign a unique test code".into(),
            ));
        }
    }

    sqlx::query(
        r#"
        UPDATE appointment
        SET free_consultation_valid_until = $2
        WHERE appointment_id = $1
        "#,
    )
    .bind(row.appointment_id)
    .bind(appointment::free_consultation_deadline(now))
    .execute(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    if abnormal {
        tracing::info!(
            "abnormal result recorded for appointment {}",
            row.appointment_id
        );
    }
    Ok(())
}

/* ============================================================
   DELETE /appointments/{id} (soft, cascading)
   ============================================================ */

pub async fn delete_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<OkResponse>, ApiError> {
    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    let row = store::lock_appointment(&mut *tx, appointment_id)
        .await
        .map_err(ApiError::db)?
        .ok_or_else(|| ApiError::not_found("appointment"))?;

    if is_customer(&auth) && row.customer_id != auth.user_id {
        return Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Customers can only delete their own appointments".into(),
        ));
    }

    // Idempotent against a record already deleted.
    if row.deleted_at.is_some() {
        return Ok(Json(OkResponse::ok()));
    }

    sqlx::query(
        r#"UPDATE appointment SET deleted_at = now(), updated_at = now() WHERE appointment_id = $1"#,
    )
    .bind(appointment_id)
    .execute(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    for stmt in [
        r#"UPDATE appointment_status_history SET deleted_at = now() WHERE appointment_id = $1 AND deleted_at IS NULL"#,
        r#"UPDATE test_result SET deleted_at = now() WHERE appointment_id = $1 AND deleted_at IS NULL"#,
        r#"UPDATE payment_obligation SET deleted_at = now() WHERE appointment_id = $1 AND deleted_at IS NULL"#,
        r#"UPDATE shipment_outbound SET deleted_at = now() WHERE appointment_id = $1 AND deleted_at IS NULL"#,
        r#"UPDATE shipment_return SET deleted_at = now() WHERE appointment_id = $1 AND deleted_at IS NULL"#,
    ] {
        sqlx::query(stmt)
            .bind(appointment_id)
            .execute(&mut *tx)
            .await
            .map_err(ApiError::db)?;
    }

    store::cancel_pending_obligations(&mut *tx, appointment_id)
        .await
        .map_err(ApiError::db)?;
    store::release_slot(&mut *tx, row.slot_id)
        .await
        .map_err(ApiError::db)?;
    store::append_audit(
        &mut *tx,
        auth.user_id,
        "appointment.delete",
        "appointment",
        appointment_id,
        None,
    )
    .await
    .map_err(ApiError::db)?;

    tx.commit().await.map_err(ApiError::db)?;
    Ok(Json(OkResponse::ok()))
}

/* ============================================================
   Helpers
   ============================================================ */

fn resolve_booking_customer(
    auth: &AuthContext,
    requested: Option<Uuid>,
) -> Result<Uuid, ApiError> {
    match requested {
        None => Ok(auth.user_id),
        Some(id) if id == auth.user_id => Ok(id),
        Some(id) if can_manage(auth) => Ok(id),
        Some(_) => Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Customers can only book for themselves".into(),
        )),
    }
}

/// Insert a payment obligation, retrying the order code against its unique
/// constraint.
async fn issue_obligation(
    tx: &mut sqlx::PgConnection,
    appointment_id: Uuid,
    amount_cents: i64,
    now: DateTime<Utc>,
) -> Result<i64, ApiError> {
    // ON CONFLICT keeps an order-code collision from aborting the enclosing
    // transaction; zero rows affected means retry with a fresh code.
    for _ in 0..ORDER_CODE_ATTEMPTS {
        // ThreadRng is not Send, keep it out of scope across the await
        let order_code = payment::generate_order_code(now, &mut thread_rng());
        let res = sqlx::query(
            r#"
            INSERT INTO payment_obligation (
              obligation_id, appointment_id, order_code, amount_cents, method,
              status, created_at, expires_at
            )
            VALUES ($1,$2,$3,$4,'gateway',$5,$6,$7)
            ON CONFLICT (order_code) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(appointment_id)
        .bind(order_code)
        .bind(amount_cents)
        .bind(ObligationStatus::Pending)
        .bind(now)
        .bind(payment::obligation_expiry(now))
        .execute(&mut *tx)
        .await
        .map_err(ApiError::db)?;
        if res.rows_affected() == 1 {
            return Ok(order_code);
        }
    }
    Err(ApiError::Internal(
        "could not generate a unique order code".into(),
    ))
}

async fn create_payment_link(
    state: &AppState,
    customer_id: Uuid,
    order_code: i64,
    amount_cents: i64,
    service: &ServiceRow,
) -> Result<String, ApiError> {
    let (buyer_name, buyer_email): (String, String) = sqlx::query_as(
        r#"SELECT display_name, email FROM app_user WHERE user_id = $1"#,
    )
    .bind(customer_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .unwrap_or_else(|| ("Customer".to_string(), String::new()));

    let link_req = crate::external::payment_gateway::PaymentLinkRequest {
        order_code,
        amount_cents,
        description: service.display_name.clone(),
        buyer_name,
        buyer_email,
        return_url: state.config.payment_return_url.clone(),
        cancel_url: state.config.payment_cancel_url.clone(),
    };

    let url = state.gateway.create_link(&link_req).await.map_err(|e| {
        tracing::warn!("payment link creation failed for order {order_code}: {e}");
        ApiError::Upstream(
            "GATEWAY_FAILED",
            "payment link could not be created; the booking was not completed".into(),
        )
    })?;

    sqlx::query(
        r#"UPDATE payment_obligation SET checkout_url = $2 WHERE order_code = $1"#,
    )
    .bind(order_code)
    .bind(&url)
    .execute(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(url)
}

async fn load_appointment_dto(
    state: &AppState,
    appointment_id: Uuid,
) -> Result<AppointmentDto, ApiError> {
    let mut conn = state.db.acquire().await.map_err(ApiError::db)?;
    let row = store::fetch_appointment(&mut *conn, appointment_id)
        .await
        .map_err(ApiError::db)?
        .ok_or_else(|| ApiError::not_found("appointment"))?;
    Ok(row.into())
}

/// Resolve a test code into the facts the eligibility engine evaluates.
/// Returns the record plus the funding appointment id.
async fn load_eligibility_record(
    conn: &mut sqlx::PgConnection,
    test_code: &str,
) -> Result<Option<(EligibilityRecord, Uuid)>, ApiError> {
    #[derive(sqlx::FromRow)]
    struct FundingRow {
        appointment_id: Uuid,
        customer_id: Uuid,
        status: AppointmentStatus,
        deleted: bool,
        valid_until: Option<DateTime<Utc>>,
        already_claimed: bool,
    }

    let row = sqlx::query_as::<_, FundingRow>(
        r#"
        SELECT
          a.appointment_id,
          a.customer_id,
          a.status,
          (a.deleted_at IS NOT NULL) AS deleted,
          a.free_consultation_valid_until AS valid_until,
          EXISTS(
            SELECT 1 FROM appointment c
            WHERE c.related_appointment_id = a.appointment_id
              AND c.is_free_consultation = true
              AND c.deleted_at IS NULL
          ) AS already_claimed
        FROM appointment a
        WHERE a.test_code = $1
          AND a.kind = $2
        "#,
    )
    .bind(test_code)
    .bind(AppointmentKind::Testing)
    .fetch_optional(conn)
    .await
    .map_err(ApiError::db)?;

    Ok(row.map(|r| {
        (
            EligibilityRecord {
                customer_id: r.customer_id,
                status: r.status,
                deleted: r.deleted,
                valid_until: r.valid_until,
                already_claimed: r.already_claimed,
            },
            r.appointment_id,
        )
    }))
}

/// Lock the funding appointment and re-run the eligibility check inside the
/// booking transaction. Returns the funding appointment id.
async fn verify_free_claim(
    tx: &mut sqlx::PgConnection,
    test_code: &str,
    customer_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Uuid, ApiError> {
    // Serialize concurrent claims on the same test code.
    let funding_id: Option<Uuid> = sqlx::query_scalar(
        r#"
        SELECT appointment_id FROM appointment
        WHERE test_code = $1 AND kind = $2
        FOR UPDATE
        "#,
    )
    .bind(test_code)
    .bind(AppointmentKind::Testing)
    .fetch_optional(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    let Some(_) = funding_id else {
        return Err(EligibilityRejection::UnknownTestCode.into());
    };

    let Some((record, funding_id)) = load_eligibility_record(&mut *tx, test_code).await? else {
        return Err(EligibilityRejection::UnknownTestCode.into());
    };
    eligibility::evaluate(&record, customer_id, now)?;
    Ok(funding_id)
}

async fn send_booking_notification(
    state: &AppState,
    customer_id: Uuid,
    service_name: &str,
    start_at: DateTime<Utc>,
) {
    let Ok(mut conn) = state.db.acquire().await else {
        return;
    };
    let email = match store::customer_email(&mut *conn, customer_id).await {
        Ok(Some(email)) => email,
        _ => return,
    };
    notify_best_effort(
        state.notifier.as_ref(),
        &email,
        "Booking received",
        &format!(
            "Your booking for {service_name} at {} is awaiting payment confirmation.",
            store::human_time(start_at)
        ),
    )
    .await;
}

async fn notify_status_change(state: &AppState, row: &AppointmentRow, to: AppointmentStatus) {
    let Ok(mut conn) = state.db.acquire().await else {
        return;
    };
    let email = match store::customer_email(&mut *conn, row.customer_id).await {
        Ok(Some(email)) => email,
        _ => return,
    };
    notify_best_effort(
        state.notifier.as_ref(),
        &email,
        "Appointment update",
        &format!(
            "Your appointment on {} is now {}.",
            store::human_time(row.start_at),
            to.as_str()
        ),
    )
    .await;
}
