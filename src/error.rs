use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorObject,
}

#[derive(Debug, Serialize)]
pub struct ErrorObject {
    pub code: String,
    pub message: String,
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized(&'static str, String),
    Forbidden(&'static str, String),
    BadRequest(&'static str, String),
    NotFound(&'static str, String),
    Conflict(&'static str, String),
    /// An external collaborator (gateway, carrier) failed; committed rows are
    /// left for the expiry sweep / manual reconciliation.
    Upstream(&'static str, String),
    Internal(String),
}

impl ApiError {
    pub fn session_expired() -> Self {
        ApiError::Unauthorized("SESSION_EXPIRED", "Session expired".into())
    }

    pub fn not_found(what: &str) -> Self {
        ApiError::NotFound("NOT_FOUND", format!("{what} not found"))
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        ApiError::BadRequest("VALIDATION_ERROR", msg.into())
    }

    pub fn db(e: sqlx::Error) -> Self {
        ApiError::Internal(format!("db error: {e}"))
    }

    fn to_error_response(code: &str, message: &str) -> Json<ErrorResponse> {
        Json(ErrorResponse {
            error: ErrorObject {
                code: code.to_string(),
                message: message.to_string(),
            },
        })
    }
}

impl From<crate::domain::capacity::CapacityRejection> for ApiError {
    fn from(r: crate::domain::capacity::CapacityRejection) -> Self {
        use crate::domain::capacity::CapacityRejection::*;
        let msg = r.to_string();
        match r {
            // contention on shared capacity
            SessionFull | SlotTaken | OverlapProvider | OverlapCustomer => {
                ApiError::Conflict(r.code(), msg)
            }
            _ => ApiError::BadRequest(r.code(), msg),
        }
    }
}

impl From<crate::domain::eligibility::EligibilityRejection> for ApiError {
    fn from(r: crate::domain::eligibility::EligibilityRejection) -> Self {
        use crate::domain::eligibility::EligibilityRejection::*;
        let msg = r.to_string();
        match r {
            AlreadyClaimed => ApiError::Conflict(r.code(), msg),
            _ => ApiError::BadRequest(r.code(), msg),
        }
    }
}

impl From<crate::domain::appointment::TransitionError> for ApiError {
    fn from(e: crate::domain::appointment::TransitionError) -> Self {
        ApiError::BadRequest("ILLEGAL_TRANSITION", e.to_string())
    }
}

impl From<crate::domain::shipping::ShippingError> for ApiError {
    fn from(e: crate::domain::shipping::ShippingError) -> Self {
        ApiError::BadRequest("ILLEGAL_SHIPMENT_TRANSITION", e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized(code, msg) => {
                (StatusCode::UNAUTHORIZED, ApiError::to_error_response(code, &msg)).into_response()
            }
            ApiError::Forbidden(code, msg) => {
                (StatusCode::FORBIDDEN, ApiError::to_error_response(code, &msg)).into_response()
            }
            ApiError::BadRequest(code, msg) => {
                (StatusCode::BAD_REQUEST, ApiError::to_error_response(code, &msg)).into_response()
            }
            ApiError::NotFound(code, msg) => {
                (StatusCode::NOT_FOUND, ApiError::to_error_response(code, &msg)).into_response()
            }
            ApiError::Conflict(code, msg) => {
                (StatusCode::CONFLICT, ApiError::to_error_response(code, &msg)).into_response()
            }
            ApiError::Upstream(code, msg) => {
                (StatusCode::BAD_GATEWAY, ApiError::to_error_response(code, &msg)).into_response()
            }
            // Driver/system details stay in the logs, never in the body.
            ApiError::Internal(msg) => {
                tracing::error!("internal error: {msg}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiError::to_error_response("INTERNAL", "internal error"),
                )
                    .into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::capacity::CapacityRejection;

    fn status_of(err: ApiError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn infrastructure_errors_are_internal_not_bad_request() {
        assert_eq!(
            status_of(ApiError::db(sqlx::Error::PoolClosed)),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn typed_rejections_keep_client_status_codes() {
        assert_eq!(
            status_of(CapacityRejection::SessionFull.into()),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(ApiError::validation("start_at required")),
            StatusCode::BAD_REQUEST
        );
    }
}
