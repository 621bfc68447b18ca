use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use htms_server::domain::shipping::{
    validate_outbound_transition, validate_return_transition, OutboundStatus, ReturnStatus,
    CARRIER_ATTEMPTS,
};
use htms_server::external::carrier::{
    ensure_order, CarrierOrder, CarrierOrderRequest, ShipmentCarrier,
};

use OutboundStatus as Out;
use ReturnStatus as Ret;

const OUTBOUND: [OutboundStatus; 4] = [
    Out::Pending,
    Out::Shipped,
    Out::DeliveredToCustomer,
    Out::Failed,
];
const RETURN: [ReturnStatus; 4] = [
    Ret::PickupRequested,
    Ret::SampleInTransit,
    Ret::ReturnedToLab,
    Ret::Failed,
];

#[test]
fn outbound_leg_walks_the_chain_in_order() {
    assert!(validate_outbound_transition(Out::Pending, Out::Shipped).is_ok());
    assert!(validate_outbound_transition(Out::Shipped, Out::DeliveredToCustomer).is_ok());
    assert!(validate_outbound_transition(Out::Pending, Out::DeliveredToCustomer).is_err());
    assert!(validate_outbound_transition(Out::Shipped, Out::Pending).is_err());
}

#[test]
fn return_leg_walks_the_chain_in_order() {
    assert!(validate_return_transition(Ret::PickupRequested, Ret::SampleInTransit).is_ok());
    assert!(validate_return_transition(Ret::SampleInTransit, Ret::ReturnedToLab).is_ok());
    assert!(validate_return_transition(Ret::PickupRequested, Ret::ReturnedToLab).is_err());
    assert!(validate_return_transition(Ret::SampleInTransit, Ret::PickupRequested).is_err());
}

#[test]
fn failed_is_reachable_from_non_terminal_states_only() {
    assert!(validate_outbound_transition(Out::Pending, Out::Failed).is_ok());
    assert!(validate_outbound_transition(Out::Shipped, Out::Failed).is_ok());
    assert!(validate_outbound_transition(Out::DeliveredToCustomer, Out::Failed).is_err());

    assert!(validate_return_transition(Ret::PickupRequested, Ret::Failed).is_ok());
    assert!(validate_return_transition(Ret::SampleInTransit, Ret::Failed).is_ok());
    assert!(validate_return_transition(Ret::ReturnedToLab, Ret::Failed).is_err());
}

#[test]
fn terminal_shipment_states_admit_nothing() {
    for to in OUTBOUND {
        assert!(validate_outbound_transition(Out::DeliveredToCustomer, to).is_err());
        assert!(validate_outbound_transition(Out::Failed, to).is_err());
    }
    for to in RETURN {
        assert!(validate_return_transition(Ret::ReturnedToLab, to).is_err());
        assert!(validate_return_transition(Ret::Failed, to).is_err());
    }
}

#[test]
fn self_transitions_are_rejected_on_both_legs() {
    for s in OUTBOUND {
        assert!(
            validate_outbound_transition(s, s).is_err(),
            "outbound {s:?} -> {s:?} must be rejected"
        );
    }
    for s in RETURN {
        assert!(
            validate_return_transition(s, s).is_err(),
            "return {s:?} -> {s:?} must be rejected"
        );
    }
}

struct FlakyCarrier {
    calls: AtomicUsize,
    fail_first: usize,
}

impl FlakyCarrier {
    fn new(fail_first: usize) -> Self {
        FlakyCarrier {
            calls: AtomicUsize::new(0),
            fail_first,
        }
    }
}

#[async_trait]
impl ShipmentCarrier for FlakyCarrier {
    async fn create_order(&self, _req: &CarrierOrderRequest) -> anyhow::Result<CarrierOrder> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_first {
            anyhow::bail!("carrier unreachable");
        }
        Ok(CarrierOrder {
            tracking_ref: format!("TRK-{n}"),
            label_url: None,
            eta: None,
        })
    }
}

fn pickup_request() -> CarrierOrderRequest {
    CarrierOrderRequest {
        origin: "12 Elm St".into(),
        destination: "lab".into(),
        contact_name: "A. Customer".into(),
        contact_phone: "555-0100".into(),
        parcel_kind: "sample-return".into(),
    }
}

#[tokio::test]
async fn legs_with_a_tracking_ref_skip_the_carrier() {
    let carrier = FlakyCarrier::new(0);
    let placed = ensure_order(&carrier, Some("TRK-EXISTING"), &pickup_request())
        .await
        .unwrap();
    assert!(placed.is_none());
    assert_eq!(carrier.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn legs_without_a_tracking_ref_retry_until_the_order_lands() {
    // A leg created on an earlier request that never got its carrier order
    // must go back to the carrier, not short-circuit on the existing record.
    let carrier = FlakyCarrier::new(2);
    let placed = ensure_order(&carrier, None, &pickup_request())
        .await
        .unwrap();
    assert!(placed.is_some());
    assert_eq!(carrier.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn carrier_attempts_are_bounded() {
    let carrier = FlakyCarrier::new(usize::MAX);
    let err = ensure_order(&carrier, None, &pickup_request())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unreachable"));
    assert_eq!(carrier.calls.load(Ordering::SeqCst), CARRIER_ATTEMPTS as usize);
}

#[test]
fn illegal_shipment_errors_name_the_leg_and_endpoints() {
    let out_err = validate_outbound_transition(Out::Failed, Out::Shipped).unwrap_err();
    let msg = out_err.to_string();
    assert!(msg.contains("outbound"), "got {msg}");
    assert!(msg.contains("failed") && msg.contains("shipped"), "got {msg}");

    let ret_err = validate_return_transition(Ret::ReturnedToLab, Ret::SampleInTransit).unwrap_err();
    let msg = ret_err.to_string();
    assert!(msg.contains("return"), "got {msg}");
    assert!(
        msg.contains("returned_to_lab") && msg.contains("sample_in_transit"),
        "got {msg}"
    );
}
