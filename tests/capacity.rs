use chrono::{Duration, NaiveTime, TimeZone, Utc};
use htms_server::domain::appointment::{AppointmentStatus, PaymentState};
use htms_server::domain::capacity::{
    admit_into_session, nth_booking_start, occupies_session_seat, parse_session_windows,
    ranges_overlap, session_capacity, validate_booking_window, CapacityRejection, SessionWindow,
    MAX_BOOKING_AHEAD_DAYS,
};
use serde_json::json;

fn t(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

fn morning() -> SessionWindow {
    SessionWindow {
        start: t(8, 0),
        end: t(11, 30),
    }
}

#[test]
fn booking_window_accepts_the_sixty_day_boundary() {
    let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
    assert!(validate_booking_window(now, now).is_ok());
    assert!(validate_booking_window(now, now + Duration::days(MAX_BOOKING_AHEAD_DAYS)).is_ok());
    assert_eq!(
        validate_booking_window(now, now + Duration::days(MAX_BOOKING_AHEAD_DAYS + 1)),
        Err(CapacityRejection::TooFarAhead)
    );
}

#[test]
fn booking_window_rejects_the_past_and_future_years() {
    let now = Utc.with_ymd_and_hms(2026, 12, 20, 12, 0, 0).unwrap();
    assert_eq!(
        validate_booking_window(now, now - Duration::hours(1)),
        Err(CapacityRejection::InPast)
    );
    // 15 days ahead is inside the 60-day horizon but lands in January
    assert_eq!(
        validate_booking_window(now, now + Duration::days(15)),
        Err(CapacityRejection::CrossesYear)
    );
}

#[test]
fn session_capacity_divides_evenly_and_floors() {
    assert_eq!(session_capacity(10, 2), 5);
    assert_eq!(session_capacity(7, 2), 3);
    assert_eq!(session_capacity(1, 2), 0);
    assert_eq!(session_capacity(10, 0), 0);
}

#[test]
fn bookings_pack_from_the_session_start_in_half_hour_steps() {
    let w = morning();
    assert_eq!(nth_booking_start(&w, 0), Some(t(8, 0)));
    assert_eq!(nth_booking_start(&w, 1), Some(t(8, 30)));
    assert_eq!(nth_booking_start(&w, 6), Some(t(11, 0)));
    // the seventh would run 11:30..12:00, past the window end
    assert_eq!(nth_booking_start(&w, 7), None);
}

#[test]
fn admission_stops_at_session_capacity() {
    let w = morning();
    // daily capacity 8 across 2 sessions: 4 per session
    assert_eq!(admit_into_session(&w, 8, 2, 0), Ok(t(8, 0)));
    assert_eq!(admit_into_session(&w, 8, 2, 3), Ok(t(9, 30)));
    assert_eq!(
        admit_into_session(&w, 8, 2, 4),
        Err(CapacityRejection::SessionFull)
    );
}

#[test]
fn unpaid_bookings_hold_their_session_seat() {
    // A fresh booking sits at Pending/Unpaid until the gateway settles; it
    // still takes a seat, otherwise a capacity-1 session admits two bookings
    // at the same start before the first one pays.
    assert!(occupies_session_seat(
        AppointmentStatus::Pending,
        PaymentState::Unpaid
    ));
    assert!(occupies_session_seat(
        AppointmentStatus::Confirmed,
        PaymentState::Paid
    ));
    // Only cancellation or a failed payment frees the seat.
    assert!(!occupies_session_seat(
        AppointmentStatus::Cancelled,
        PaymentState::Unpaid
    ));
    assert!(!occupies_session_seat(
        AppointmentStatus::Pending,
        PaymentState::Failed
    ));

    // With the unpaid seat counted, a one-seat session is full after a single
    // booking regardless of its payment state.
    let w = morning();
    assert_eq!(admit_into_session(&w, 1, 1, 0), Ok(t(8, 0)));
    assert_eq!(
        admit_into_session(&w, 1, 1, 1),
        Err(CapacityRejection::SessionFull)
    );
}

#[test]
fn admission_is_bounded_by_window_length_even_with_spare_capacity() {
    // a 1-hour window holds two slots no matter what capacity says
    let short = SessionWindow {
        start: t(9, 0),
        end: t(10, 0),
    };
    assert_eq!(admit_into_session(&short, 100, 1, 1), Ok(t(9, 30)));
    assert_eq!(
        admit_into_session(&short, 100, 1, 2),
        Err(CapacityRejection::SessionFull)
    );
}

#[test]
fn session_windows_parse_from_the_service_json() {
    let raw = json!({
        "morning": { "start": "08:00:00", "end": "11:30:00" },
        "afternoon": { "start": "13:00:00", "end": "16:00:00" }
    });
    let windows = parse_session_windows(Some(&raw)).expect("valid config");
    assert_eq!(windows.len(), 2);
    let morning = windows
        .iter()
        .find(|(name, _)| name == "morning")
        .map(|(_, w)| w)
        .expect("morning present");
    assert_eq!(morning.start, t(8, 0));
    assert_eq!(morning.end, t(11, 30));
}

#[test]
fn missing_or_empty_session_config_is_rejected() {
    assert_eq!(
        parse_session_windows(None),
        Err(CapacityRejection::NoSessionConfig)
    );
    assert_eq!(
        parse_session_windows(Some(&json!({}))),
        Err(CapacityRejection::NoSessionConfig)
    );
    assert_eq!(
        parse_session_windows(Some(&json!({ "morning": "08:00" }))),
        Err(CapacityRejection::NoSessionConfig)
    );
}

#[test]
fn overlap_is_half_open() {
    let base = Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap();
    let hour = Duration::hours(1);
    // back-to-back appointments do not overlap
    assert!(!ranges_overlap(base, base + hour, base + hour, base + hour * 2));
    assert!(ranges_overlap(
        base,
        base + hour,
        base + Duration::minutes(30),
        base + hour + Duration::minutes(30)
    ));
    // containment counts as overlap
    assert!(ranges_overlap(
        base,
        base + hour * 3,
        base + hour,
        base + hour * 2
    ));
}

#[test]
fn rejection_codes_are_stable() {
    assert_eq!(CapacityRejection::SessionFull.code(), "SESSION_FULL");
    assert_eq!(CapacityRejection::SlotTaken.code(), "SLOT_TAKEN");
    assert_eq!(
        CapacityRejection::CustomerDailyLimit.code(),
        "CUSTOMER_DAILY_LIMIT"
    );
    assert_eq!(
        CapacityRejection::PendingPaymentLimit.code(),
        "PENDING_PAYMENT_LIMIT"
    );
}
