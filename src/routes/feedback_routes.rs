// src/routes/feedback_routes.rs

use axum::{Json, Router, extract::State, routing::post};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    domain::appointment::{AppointmentKind, AppointmentStatus},
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{AppState, OkResponse},
    store,
};

pub fn router() -> Router<AppState> {
    Router::new().route("/feedback", post(submit_feedback))
}

#[derive(Debug, Deserialize)]
pub struct SubmitFeedbackRequest {
    pub appointment_id: Uuid,
    pub rating: i16,
    pub comment: Option<String>,
}

pub async fn submit_feedback(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<SubmitFeedbackRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    if !(1..=5).contains(&req.rating) {
        return Err(ApiError::validation("rating must be between 1 and 5"));
    }

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    let appointment = store::fetch_appointment(&mut *tx, req.appointment_id)
        .await
        .map_err(ApiError::db)?
        .ok_or_else(|| ApiError::not_found("appointment"))?;
    if appointment.deleted_at.is_some() {
        return Err(ApiError::not_found("appointment"));
    }
    if appointment.customer_id != auth.user_id {
        return Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Feedback can only be left on your own appointments".into(),
        ));
    }
    if appointment.kind != AppointmentKind::Consultation
        || appointment.status != AppointmentStatus::Completed
    {
        return Err(ApiError::BadRequest(
            "FEEDBACK_NOT_ALLOWED",
            "feedback applies to completed consultations only".into(),
        ));
    }

    sqlx::query(
        r#"
        INSERT INTO consultation_feedback (feedback_id, appointment_id, customer_id, rating, comment, created_at)
        VALUES ($1,$2,$3,$4,$5,now())
        ON CONFLICT (appointment_id) DO UPDATE
        SET rating = EXCLUDED.rating, comment = EXCLUDED.comment
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(req.appointment_id)
    .bind(auth.user_id)
    .bind(req.rating)
    .bind(&req.comment)
    .execute(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    store::append_audit(
        &mut *tx,
        auth.user_id,
        "feedback.submit",
        "appointment",
        req.appointment_id,
        None,
    )
    .await
    .map_err(ApiError::db)?;

    tx.commit().await.map_err(ApiError::db)?;
    Ok(Json(OkResponse::ok()))
}
