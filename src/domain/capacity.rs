//! Capacity Ledger: booking-time limits for sessions, slots and providers.
//!
//! The arithmetic and the rejection taxonomy live here; the counting queries
//! run inside the booking transaction in the route layer so that a failed
//! rule never leaves a partial reservation behind.

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc};
use serde::Deserialize;

use crate::domain::appointment::{AppointmentStatus, PaymentState};

/// Bookings may be placed at most this far ahead.
pub const MAX_BOOKING_AHEAD_DAYS: i64 = 60;
/// Fixed width of one testing booking inside a session.
pub const SESSION_SLOT_MINUTES: i64 = 30;
/// Paid, non-cancelled bookings one customer may hold per calendar day.
pub const CUSTOMER_DAILY_LIMIT: i64 = 2;
/// Concurrent pending-payment bookings one customer may hold per service.
pub const CUSTOMER_PENDING_LIMIT: i64 = 3;
/// Fallback per-day maximum for a consultation slot's provider.
pub const DEFAULT_PROVIDER_DAILY_MAX: i32 = 5;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CapacityRejection {
    #[error("requested time is in the past")]
    InPast,
    #[error("bookings may be placed at most {MAX_BOOKING_AHEAD_DAYS} days ahead")]
    TooFarAhead,
    #[error("bookings cannot cross into a future calendar year")]
    CrossesYear,
    #[error("service has no session configuration")]
    NoSessionConfig,
    #[error("unknown session {0:?} for this service")]
    UnknownSession(String),
    #[error("session is fully booked")]
    SessionFull,
    #[error("daily booking limit of {CUSTOMER_DAILY_LIMIT} reached for this customer")]
    CustomerDailyLimit,
    #[error("too many unpaid bookings for this service; settle or wait for expiry")]
    PendingPaymentLimit,
    #[error("slot is already booked")]
    SlotTaken,
    #[error("slot is no longer available")]
    SlotDeleted,
    #[error("provider is not verified")]
    ProviderUnverified,
    #[error("provider has reached the daily appointment maximum")]
    ProviderDailyLimit,
    #[error("provider already has an appointment overlapping this window")]
    OverlapProvider,
    #[error("customer already has an appointment for this service overlapping this window")]
    OverlapCustomer,
}

impl CapacityRejection {
    /// Stable machine code surfaced in the error response.
    pub fn code(&self) -> &'static str {
        match self {
            CapacityRejection::InPast => "BOOKING_IN_PAST",
            CapacityRejection::TooFarAhead => "BOOKING_TOO_FAR_AHEAD",
            CapacityRejection::CrossesYear => "BOOKING_CROSSES_YEAR",
            CapacityRejection::NoSessionConfig => "NO_SESSION_CONFIG",
            CapacityRejection::UnknownSession(_) => "UNKNOWN_SESSION",
            CapacityRejection::SessionFull => "SESSION_FULL",
            CapacityRejection::CustomerDailyLimit => "CUSTOMER_DAILY_LIMIT",
            CapacityRejection::PendingPaymentLimit => "PENDING_PAYMENT_LIMIT",
            CapacityRejection::SlotTaken => "SLOT_TAKEN",
            CapacityRejection::SlotDeleted => "SLOT_DELETED",
            CapacityRejection::ProviderUnverified => "PROVIDER_UNVERIFIED",
            CapacityRejection::ProviderDailyLimit => "PROVIDER_DAILY_LIMIT",
            CapacityRejection::OverlapProvider => "OVERLAP_PROVIDER",
            CapacityRejection::OverlapCustomer => "OVERLAP_CUSTOMER",
        }
    }
}

/// A named sub-window of a testing day, parsed from the service's
/// `session_windows` JSON map.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SessionWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

/// Parse `{"morning":{"start":"08:00:00","end":"11:30:00"}, ...}`.
pub fn parse_session_windows(
    raw: Option<&serde_json::Value>,
) -> Result<Vec<(String, SessionWindow)>, CapacityRejection> {
    let Some(serde_json::Value::Object(map)) = raw else {
        return Err(CapacityRejection::NoSessionConfig);
    };
    if map.is_empty() {
        return Err(CapacityRejection::NoSessionConfig);
    }
    let mut out = Vec::with_capacity(map.len());
    for (name, v) in map {
        let window: SessionWindow = serde_json::from_value(v.clone())
            .map_err(|_| CapacityRejection::NoSessionConfig)?;
        out.push((name.clone(), window));
    }
    Ok(out)
}

/// The requested date must be within `[now, now + 60d]` and must not fall in
/// a later calendar year than `now` (guard against multi-year drift).
pub fn validate_booking_window(
    now: DateTime<Utc>,
    requested: DateTime<Utc>,
) -> Result<(), CapacityRejection> {
    if requested < now {
        return Err(CapacityRejection::InPast);
    }
    if requested.year() > now.year() {
        return Err(CapacityRejection::CrossesYear);
    }
    if requested > now + Duration::days(MAX_BOOKING_AHEAD_DAYS) {
        return Err(CapacityRejection::TooFarAhead);
    }
    Ok(())
}

/// Whether a booking still holds its session seat. A pending-payment booking
/// holds the seat until the expiry sweep frees it; only cancellation or a
/// failed payment releases it.
pub fn occupies_session_seat(status: AppointmentStatus, payment: PaymentState) -> bool {
    status != AppointmentStatus::Cancelled && payment != PaymentState::Failed
}

/// Daily capacity divided evenly across declared sessions.
pub fn session_capacity(daily_capacity: i32, session_count: usize) -> i64 {
    if session_count == 0 {
        return 0;
    }
    (daily_capacity as i64) / (session_count as i64)
}

/// Start time of the Nth (0-based) booking inside a session, or None when it
/// would spill past the session end.
pub fn nth_booking_start(window: &SessionWindow, n: i64) -> Option<NaiveTime> {
    let offset = Duration::minutes(n * SESSION_SLOT_MINUTES);
    let start = window.start.overflowing_add_signed(offset).0;
    let end = start.overflowing_add_signed(Duration::minutes(SESSION_SLOT_MINUTES)).0;
    // overflowing_add wraps at midnight; a wrapped end sorts before start
    if start < window.start || end > window.end || end < start {
        return None;
    }
    Some(start)
}

/// Admission decision for the next testing booking in a session that already
/// holds `existing` paid non-cancelled bookings.
pub fn admit_into_session(
    window: &SessionWindow,
    daily_capacity: i32,
    session_count: usize,
    existing: i64,
) -> Result<NaiveTime, CapacityRejection> {
    let cap = session_capacity(daily_capacity, session_count);
    if existing >= cap {
        return Err(CapacityRejection::SessionFull);
    }
    nth_booking_start(window, existing).ok_or(CapacityRejection::SessionFull)
}

/// Half-open time-range intersection, the overlap rule for consultations.
pub fn ranges_overlap(
    a_start: DateTime<Utc>,
    a_end: DateTime<Utc>,
    b_start: DateTime<Utc>,
    b_end: DateTime<Utc>,
) -> bool {
    a_start < b_end && b_start < a_end
}
