use chrono::{Duration, TimeZone, Utc};
use htms_server::domain::appointment::PaymentState;
use htms_server::domain::payment::{
    generate_order_code, is_expired, map_gateway_status, obligation_expiry, settlement_effect,
    ObligationStatus, OBLIGATION_TTL_MINUTES,
};
use rand::{rngs::StdRng, SeedableRng};

#[test]
fn order_code_carries_the_creation_timestamp_prefix() {
    let now = Utc.with_ymd_and_hms(2026, 4, 17, 9, 35, 42).unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    let code = generate_order_code(now, &mut rng);
    assert_eq!(code / 1_000_000, 260_417_093_542);
    assert!(code >= 0);
}

#[test]
fn order_code_suffix_stays_within_six_digits() {
    let now = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
    let mut rng = StdRng::seed_from_u64(99);
    for _ in 0..1000 {
        let suffix = generate_order_code(now, &mut rng) % 1_000_000;
        assert!((0..1_000_000).contains(&suffix));
    }
}

#[test]
fn codes_in_the_same_second_differ_by_suffix_only() {
    let now = Utc.with_ymd_and_hms(2026, 4, 17, 9, 35, 42).unwrap();
    let mut rng = StdRng::seed_from_u64(3);
    let codes: Vec<i64> = (0..8).map(|_| generate_order_code(now, &mut rng)).collect();
    assert!(codes.iter().all(|c| c / 1_000_000 == codes[0] / 1_000_000));
    assert!(
        codes.iter().any(|c| *c != codes[0]),
        "eight draws should not all share one suffix"
    );
}

#[test]
fn obligations_expire_thirty_minutes_after_creation() {
    let created = Utc.with_ymd_and_hms(2026, 4, 17, 10, 0, 0).unwrap();
    let expires = obligation_expiry(created);
    assert_eq!(expires - created, Duration::minutes(OBLIGATION_TTL_MINUTES));

    assert!(!is_expired(created, expires, created + Duration::minutes(29)));
    assert!(is_expired(created, expires, created + Duration::minutes(31)));
}

#[test]
fn expiry_predicate_falls_back_to_the_ttl() {
    // an expiry stamped far in the future does not outlive the TTL
    let created = Utc.with_ymd_and_hms(2026, 4, 17, 10, 0, 0).unwrap();
    let bogus_expiry = created + Duration::days(365);
    assert!(is_expired(created, bogus_expiry, created + Duration::minutes(31)));
    assert!(!is_expired(created, bogus_expiry, created + Duration::minutes(10)));
}

#[test]
fn gateway_statuses_map_case_insensitively() {
    assert_eq!(map_gateway_status("PAID"), Some(ObligationStatus::Completed));
    assert_eq!(map_gateway_status("paid"), Some(ObligationStatus::Completed));
    assert_eq!(
        map_gateway_status("Success"),
        Some(ObligationStatus::Completed)
    );
    assert_eq!(
        map_gateway_status("CANCELLED"),
        Some(ObligationStatus::Cancelled)
    );
    assert_eq!(
        map_gateway_status("expired"),
        Some(ObligationStatus::Cancelled)
    );
    assert_eq!(map_gateway_status("PROCESSING"), None);
    assert_eq!(map_gateway_status(""), None);
}

#[test]
fn cancelled_settlement_tears_the_booking_down() {
    // Completion stamps Paid and leaves the booking alone; cancellation stamps
    // Failed and reclaims the booking right away. The sweep only revisits
    // Pending obligations, so a Cancelled one must release its slot here.
    assert_eq!(
        settlement_effect(ObligationStatus::Completed),
        Some((PaymentState::Paid, false))
    );
    assert_eq!(
        settlement_effect(ObligationStatus::Cancelled),
        Some((PaymentState::Failed, true))
    );
    assert_eq!(settlement_effect(ObligationStatus::Pending), None);
}

#[test]
fn only_pending_is_non_terminal() {
    assert!(!ObligationStatus::Pending.is_terminal());
    assert!(ObligationStatus::Completed.is_terminal());
    assert!(ObligationStatus::Cancelled.is_terminal());
}
