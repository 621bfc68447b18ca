use chrono::{Duration, TimeZone, Utc};
use htms_server::domain::appointment::{
    allowed_transitions, free_consultation_deadline, is_terminal, result_is_abnormal,
    validate_transition, AppointmentKind, AppointmentStatus, ConsultationMode, DeliveryMode,
    KindDetail, TestingDelivery,
};
use serde_json::json;
use uuid::Uuid;

use AppointmentKind::{Consultation, Testing};
use AppointmentStatus::*;

const ALL_STATUSES: [AppointmentStatus; 6] = [
    Pending,
    Confirmed,
    InProgress,
    SampleCollected,
    Completed,
    Cancelled,
];

#[test]
fn testing_lifecycle_follows_the_expected_chain() {
    assert!(validate_transition(Testing, Pending, Confirmed).is_ok());
    assert!(validate_transition(Testing, Confirmed, SampleCollected).is_ok());
    assert!(validate_transition(Testing, SampleCollected, Completed).is_ok());
}

#[test]
fn testing_never_enters_in_progress() {
    for from in ALL_STATUSES {
        assert!(
            validate_transition(Testing, from, InProgress).is_err(),
            "testing must not reach in_progress from {from:?}"
        );
    }
    // and cannot leave it either, should a row ever end up there
    assert!(allowed_transitions(Testing, InProgress).is_empty());
}

#[test]
fn consultation_lifecycle_passes_through_in_progress() {
    assert!(validate_transition(Consultation, Pending, Confirmed).is_ok());
    assert!(validate_transition(Consultation, Confirmed, InProgress).is_ok());
    assert!(validate_transition(Consultation, InProgress, SampleCollected).is_ok());
    assert!(validate_transition(Consultation, SampleCollected, Completed).is_ok());

    // the consultation chain has no shortcut around in_progress
    assert!(validate_transition(Consultation, Confirmed, SampleCollected).is_err());
}

#[test]
fn every_non_terminal_status_can_cancel() {
    for kind in [Testing, Consultation] {
        for from in [Pending, Confirmed, SampleCollected] {
            assert!(
                validate_transition(kind, from, Cancelled).is_ok(),
                "{kind:?} should cancel from {from:?}"
            );
        }
    }
    assert!(validate_transition(Consultation, InProgress, Cancelled).is_ok());
}

#[test]
fn terminal_statuses_admit_nothing() {
    for kind in [Testing, Consultation] {
        for terminal in [Completed, Cancelled] {
            assert!(is_terminal(terminal));
            for to in ALL_STATUSES {
                assert!(
                    validate_transition(kind, terminal, to).is_err(),
                    "{kind:?} {terminal:?} -> {to:?} must be rejected"
                );
            }
        }
    }
    assert!(!is_terminal(Pending));
    assert!(!is_terminal(SampleCollected));
}

#[test]
fn no_backward_or_skipping_edges() {
    assert!(validate_transition(Testing, Confirmed, Pending).is_err());
    assert!(validate_transition(Testing, Pending, SampleCollected).is_err());
    assert!(validate_transition(Testing, Pending, Completed).is_err());
    assert!(validate_transition(Consultation, SampleCollected, InProgress).is_err());
    assert!(validate_transition(Consultation, InProgress, Completed).is_err());
}

#[test]
fn illegal_transition_error_names_both_endpoints() {
    let err = validate_transition(Testing, Completed, Pending).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("completed"), "got {msg}");
    assert!(msg.contains("pending"), "got {msg}");
}

#[test]
fn kind_detail_maps_onto_delivery_modes() {
    let clinic_test = KindDetail::Testing {
        delivery: TestingDelivery::Clinic,
    };
    assert_eq!(clinic_test.kind(), Testing);
    assert_eq!(clinic_test.delivery_mode(), DeliveryMode::Clinic);

    let home_test = KindDetail::Testing {
        delivery: TestingDelivery::Home {
            contact_name: "A. Nyberg".into(),
            contact_phone: "+46 70 000 00 00".into(),
            address: "Storgatan 1".into(),
        },
    };
    assert_eq!(home_test.delivery_mode(), DeliveryMode::Home);

    let online = KindDetail::Consultation {
        slot_id: Uuid::new_v4(),
        mode: ConsultationMode::Online,
        meeting_link: Some("https://meet.example/abc".into()),
    };
    assert_eq!(online.kind(), Consultation);
    assert_eq!(online.delivery_mode(), DeliveryMode::Online);
}

#[test]
fn kind_detail_rejects_cross_kind_payloads() {
    // a testing payload has no slot to offer
    let raw = json!({ "kind": "testing", "slot_id": Uuid::new_v4(), "mode": "online" });
    assert!(serde_json::from_value::<KindDetail>(raw).is_err());

    let raw = json!({ "kind": "consultation", "delivery": "clinic" });
    assert!(serde_json::from_value::<KindDetail>(raw).is_err());
}

#[test]
fn free_consultation_window_is_thirty_days() {
    let completed = Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap();
    let deadline = free_consultation_deadline(completed);
    assert_eq!(deadline - completed, Duration::days(30));
}

#[test]
fn abnormal_result_detection_scans_nested_values() {
    assert!(result_is_abnormal(&json!({ "hiv": "POSITIVE" })));
    assert!(result_is_abnormal(&json!({
        "panel": { "chlamydia": "negative", "gonorrhea": "Positive (confirm)" }
    })));
    assert!(result_is_abnormal(&json!(["negative", "positive"])));

    assert!(!result_is_abnormal(&json!({ "hiv": "negative" })));
    assert!(!result_is_abnormal(&json!({ "count": 42, "ok": true })));
    assert!(!result_is_abnormal(&json!({})));
}
