use chrono::{DateTime, Duration, TimeZone, Utc};
use htms_server::domain::appointment::AppointmentStatus;
use htms_server::domain::eligibility::{
    evaluate, generate_test_code, EligibilityRecord, EligibilityRejection,
};
use rand::{rngs::StdRng, SeedableRng};
use uuid::Uuid;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap()
}

fn eligible_record(customer: Uuid) -> EligibilityRecord {
    EligibilityRecord {
        customer_id: customer,
        status: AppointmentStatus::Completed,
        deleted: false,
        valid_until: Some(now() + Duration::days(10)),
        already_claimed: false,
    }
}

#[test]
fn completed_owned_unclaimed_test_is_eligible() {
    let customer = Uuid::new_v4();
    assert!(evaluate(&eligible_record(customer), customer, now()).is_ok());
}

#[test]
fn ownership_is_checked_before_anything_else() {
    let customer = Uuid::new_v4();
    let mut record = eligible_record(customer);
    // even a deleted, expired, claimed record reports NotOwner to a stranger
    record.deleted = true;
    record.already_claimed = true;
    record.valid_until = None;
    assert_eq!(
        evaluate(&record, Uuid::new_v4(), now()),
        Err(EligibilityRejection::NotOwner)
    );
}

#[test]
fn only_completed_tests_fund_a_consultation() {
    let customer = Uuid::new_v4();
    for status in [
        AppointmentStatus::Pending,
        AppointmentStatus::Confirmed,
        AppointmentStatus::SampleCollected,
        AppointmentStatus::Cancelled,
    ] {
        let mut record = eligible_record(customer);
        record.status = status;
        assert_eq!(
            evaluate(&record, customer, now()),
            Err(EligibilityRejection::NotCompleted),
            "{status:?} must not be eligible"
        );
    }
}

#[test]
fn deleted_funding_tests_are_rejected() {
    let customer = Uuid::new_v4();
    let mut record = eligible_record(customer);
    record.deleted = true;
    assert_eq!(
        evaluate(&record, customer, now()),
        Err(EligibilityRejection::Deleted)
    );
}

#[test]
fn the_window_is_inclusive_at_the_deadline() {
    let customer = Uuid::new_v4();
    let mut record = eligible_record(customer);

    record.valid_until = Some(now());
    assert!(evaluate(&record, customer, now()).is_ok());

    record.valid_until = Some(now() - Duration::seconds(1));
    assert_eq!(
        evaluate(&record, customer, now()),
        Err(EligibilityRejection::Expired)
    );

    // a completed test that never got a deadline stamped cannot fund anything
    record.valid_until = None;
    assert_eq!(
        evaluate(&record, customer, now()),
        Err(EligibilityRejection::Expired)
    );
}

#[test]
fn a_consumed_test_cannot_fund_twice() {
    let customer = Uuid::new_v4();
    let mut record = eligible_record(customer);
    record.already_claimed = true;
    assert_eq!(
        evaluate(&record, customer, now()),
        Err(EligibilityRejection::AlreadyClaimed)
    );
}

#[test]
fn test_codes_use_the_unambiguous_alphabet() {
    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..200 {
        let code = generate_test_code(&mut rng);
        assert_eq!(code.len(), 11);
        assert!(code.starts_with("HT-"), "got {code}");
        for c in code[3..].chars() {
            assert!(
                "23456789ABCDEFGHJKLMNPQRSTUVWXYZ".contains(c),
                "ambiguous character {c:?} in {code}"
            );
        }
    }
}

#[test]
fn rejection_codes_are_stable() {
    assert_eq!(
        EligibilityRejection::UnknownTestCode.code(),
        "UNKNOWN_TEST_CODE"
    );
    assert_eq!(
        EligibilityRejection::AlreadyClaimed.code(),
        "ELIGIBILITY_CLAIMED"
    );
    assert_eq!(EligibilityRejection::Expired.code(), "ELIGIBILITY_EXPIRED");
}
