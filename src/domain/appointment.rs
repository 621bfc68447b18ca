//! Appointment lifecycle: status/kind enums and the transition table.
//!
//! The transition table is pure so it can be checked without a database;
//! handlers apply it inside the row-locking transaction.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Days after completion during which a testing appointment can fund a
/// free consultation.
pub const FREE_CONSULTATION_VALIDITY_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "smallint")]
#[repr(i16)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Pending = 0,
    Confirmed = 1,
    InProgress = 2,
    SampleCollected = 3,
    Completed = 4,
    Cancelled = 5,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::InProgress => "in_progress",
            AppointmentStatus::SampleCollected => "sample_collected",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "smallint")]
#[repr(i16)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentKind {
    Testing = 0,
    Consultation = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "smallint")]
#[repr(i16)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    Clinic = 0,
    Home = 1,
    Online = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "smallint")]
#[repr(i16)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    Unpaid = 0,
    Paid = 1,
    Failed = 2,
}

/// Kind-specific booking payload. Collapses the "field meaningful only if
/// kind = X" contract into the type: a testing appointment never carries a
/// meeting link, an online consultation never carries a shipping address.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KindDetail {
    Testing {
        delivery: TestingDelivery,
    },
    Consultation {
        slot_id: Uuid,
        mode: ConsultationMode,
        meeting_link: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestingDelivery {
    Clinic,
    Home {
        contact_name: String,
        contact_phone: String,
        address: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsultationMode {
    Clinic,
    Online,
}

impl KindDetail {
    pub fn kind(&self) -> AppointmentKind {
        match self {
            KindDetail::Testing { .. } => AppointmentKind::Testing,
            KindDetail::Consultation { .. } => AppointmentKind::Consultation,
        }
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        match self {
            KindDetail::Testing {
                delivery: TestingDelivery::Clinic,
            } => DeliveryMode::Clinic,
            KindDetail::Testing {
                delivery: TestingDelivery::Home { .. },
            } => DeliveryMode::Home,
            KindDetail::Consultation {
                mode: ConsultationMode::Clinic,
                ..
            } => DeliveryMode::Clinic,
            KindDetail::Consultation {
                mode: ConsultationMode::Online,
                ..
            } => DeliveryMode::Online,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("transition {from} -> {to} is not allowed")]
    Illegal {
        from: &'static str,
        to: &'static str,
    },
}

/// Legal next statuses for a given kind and current status.
pub fn allowed_transitions(
    kind: AppointmentKind,
    from: AppointmentStatus,
) -> &'static [AppointmentStatus] {
    use AppointmentStatus::*;
    match (kind, from) {
        (_, Pending) => &[Confirmed, Cancelled],
        (AppointmentKind::Testing, Confirmed) => &[SampleCollected, Cancelled],
        (AppointmentKind::Consultation, Confirmed) => &[InProgress, Cancelled],
        (AppointmentKind::Consultation, InProgress) => &[SampleCollected, Cancelled],
        (AppointmentKind::Testing, InProgress) => &[],
        (_, SampleCollected) => &[Completed, Cancelled],
        (_, Completed) | (_, Cancelled) => &[],
    }
}

pub fn validate_transition(
    kind: AppointmentKind,
    from: AppointmentStatus,
    to: AppointmentStatus,
) -> Result<(), TransitionError> {
    if allowed_transitions(kind, from).contains(&to) {
        Ok(())
    } else {
        Err(TransitionError::Illegal {
            from: from.as_str(),
            to: to.as_str(),
        })
    }
}

pub fn is_terminal(status: AppointmentStatus) -> bool {
    matches!(
        status,
        AppointmentStatus::Completed | AppointmentStatus::Cancelled
    )
}

/// Completion stamps the eligibility window for a follow-up free consultation.
pub fn free_consultation_deadline(completed_at: DateTime<Utc>) -> DateTime<Utc> {
    completed_at + Duration::days(FREE_CONSULTATION_VALIDITY_DAYS)
}

/// A result is flagged abnormal when any field value contains a
/// case-insensitive "positive" marker.
pub fn result_is_abnormal(result: &serde_json::Value) -> bool {
    match result {
        serde_json::Value::String(s) => s.to_lowercase().contains("positive"),
        serde_json::Value::Array(items) => items.iter().any(result_is_abnormal),
        serde_json::Value::Object(map) => map.values().any(result_is_abnormal),
        _ => false,
    }
}
