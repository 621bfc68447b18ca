use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::config::Config;
use crate::domain::appointment::{AppointmentKind, AppointmentStatus, DeliveryMode, PaymentState};
use crate::domain::payment::ObligationStatus;
use crate::domain::shipping::{OutboundStatus, ReturnStatus};
use crate::external::{carrier::ShipmentCarrier, notifier::Notifier, payment_gateway::PaymentGateway};

/// Actor recorded on rows written by background jobs (expiry sweep).
pub const SYSTEM_ACTOR_ID: Uuid = Uuid::nil();

#[derive(Clone)]
pub struct AppState {
    pub db: sqlx::PgPool,
    pub config: Config,
    pub gateway: Arc<dyn PaymentGateway>,
    pub carrier: Arc<dyn ShipmentCarrier>,
    pub notifier: Arc<dyn Notifier>,
}

/* -------------------------
   API envelopes
--------------------------*/

#[derive(Debug, Serialize)]
pub struct ApiOk<T> {
    pub data: T,
}

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub data: OkData,
}

#[derive(Debug, Serialize)]
pub struct OkData {
    pub ok: bool,
}

impl OkResponse {
    pub fn ok() -> Self {
        OkResponse {
            data: OkData { ok: true },
        }
    }
}

/* -------------------------
   DB Row Models
--------------------------*/

#[derive(Debug, Clone, FromRow)]
pub struct AppointmentRow {
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
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SlotRow {
    pub slot_id: Uuid,
    pub provider_id: Uuid,
    pub service_id: Uuid,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub is_booked: bool,
    pub max_daily_appointments: i32,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ObligationRow {
    pub obligation_id: Uuid,
    pub appointment_id: Uuid,
    pub order_code: i64,
    pub amount_cents: i64,
    pub method: String,
    pub status: ObligationStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct OutboundShipmentRow {
    pub shipment_id: Uuid,
    pub appointment_id: Uuid,
    pub carrier_name: String,
    pub tracking_ref: Option<String>,
    pub contact_name: String,
    pub contact_phone: String,
    pub address: String,
    pub status: OutboundStatus,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ReturnShipmentRow {
    pub shipment_id: Uuid,
    pub appointment_id: Uuid,
    pub carrier_name: String,
    pub tracking_ref: Option<String>,
    pub contact_name: String,
    pub contact_phone: String,
    pub address: String,
    pub status: ReturnStatus,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ServiceRow {
    pub service_id: Uuid,
    pub kind: AppointmentKind,
    pub display_name: String,
    pub price_cents: i64,
    pub daily_capacity: i32,
    /// JSON object: session name -> {"start":"08:00","end":"11:30"}.
    pub session_windows: Option<serde_json::Value>,
    pub is_active: bool,
}
