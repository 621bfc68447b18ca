//! Payment obligations: order-code generation, the expiry rule and the
//! gateway status mapping consumed by the settlement webhook.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::domain::appointment::PaymentState;

/// Attempts against the order-code unique constraint before failing hard.
pub const ORDER_CODE_ATTEMPTS: u32 = 5;
/// A Pending obligation expires this long after creation.
pub const OBLIGATION_TTL_MINUTES: i64 = 30;
/// Random suffix width appended to the time prefix.
const ORDER_CODE_SUFFIX_MOD: i64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "smallint")]
#[repr(i16)]
#[serde(rename_all = "snake_case")]
pub enum ObligationStatus {
    Pending = 0,
    Completed = 1,
    Cancelled = 2,
}

impl ObligationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ObligationStatus::Pending)
    }
}

/// Numeric order reference: a `yymmddHHMMSS` prefix with six random digits
/// appended. 18 digits, fits an i64 / BIGINT.
pub fn generate_order_code<R: Rng>(now: DateTime<Utc>, rng: &mut R) -> i64 {
    let prefix: i64 = now
        .format("%y%m%d%H%M%S")
        .to_string()
        .parse()
        .unwrap_or(0);
    let suffix: i64 = rng.gen_range(0..ORDER_CODE_SUFFIX_MOD);
    prefix * ORDER_CODE_SUFFIX_MOD + suffix
}

pub fn obligation_expiry(created_at: DateTime<Utc>) -> DateTime<Utc> {
    created_at + Duration::minutes(OBLIGATION_TTL_MINUTES)
}

/// Sweep predicate: past the explicit expiry, or older than the TTL
/// regardless of it (covers rows written before the expiry column existed).
pub fn is_expired(created_at: DateTime<Utc>, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now > expires_at || now > created_at + Duration::minutes(OBLIGATION_TTL_MINUTES)
}

/// Appointment-side effect of a terminal settlement: the payment state to
/// stamp and whether the booking is torn down (cancelled, slot released).
/// A Cancelled obligation is terminal, so its booking must be reclaimed here;
/// the sweep only revisits Pending obligations.
pub fn settlement_effect(target: ObligationStatus) -> Option<(PaymentState, bool)> {
    match target {
        ObligationStatus::Pending => None,
        ObligationStatus::Completed => Some((PaymentState::Paid, false)),
        ObligationStatus::Cancelled => Some((PaymentState::Failed, true)),
    }
}

/// Map a gateway callback status onto the obligation state machine.
/// Unknown statuses are ignored (the webhook still acknowledges).
pub fn map_gateway_status(raw: &str) -> Option<ObligationStatus> {
    match raw.to_ascii_uppercase().as_str() {
        "PAID" | "COMPLETED" | "SUCCESS" => Some(ObligationStatus::Completed),
        "CANCELLED" | "FAILED" | "EXPIRED" => Some(ObligationStatus::Cancelled),
        _ => None,
    }
}
