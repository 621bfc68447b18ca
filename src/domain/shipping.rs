//! Shipment legs for at-home testing: two independent state machines
//! correlated only by the shared appointment. The rule that gates the
//! appointment's SampleCollected transition on the return leg lives in the
//! orchestrator, not here.

use serde::{Deserialize, Serialize};

/// Attempts for the external carrier order call.
pub const CARRIER_ATTEMPTS: u32 = 3;
/// Fixed backoff between carrier attempts.
pub const CARRIER_BACKOFF_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "smallint")]
#[repr(i16)]
#[serde(rename_all = "snake_case")]
pub enum OutboundStatus {
    Pending = 0,
    Shipped = 1,
    DeliveredToCustomer = 2,
    Failed = 3,
}

impl OutboundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboundStatus::Pending => "pending",
            OutboundStatus::Shipped => "shipped",
            OutboundStatus::DeliveredToCustomer => "delivered_to_customer",
            OutboundStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "smallint")]
#[repr(i16)]
#[serde(rename_all = "snake_case")]
pub enum ReturnStatus {
    PickupRequested = 0,
    SampleInTransit = 1,
    ReturnedToLab = 2,
    Failed = 3,
}

impl ReturnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReturnStatus::PickupRequested => "pickup_requested",
            ReturnStatus::SampleInTransit => "sample_in_transit",
            ReturnStatus::ReturnedToLab => "returned_to_lab",
            ReturnStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ShippingError {
    #[error("outbound leg cannot move {from} -> {to}")]
    IllegalOutbound {
        from: &'static str,
        to: &'static str,
    },
    #[error("return leg cannot move {from} -> {to}")]
    IllegalReturn {
        from: &'static str,
        to: &'static str,
    },
}

/// Outbound legal edges: Pending -> Shipped -> DeliveredToCustomer, with
/// Failed reachable from either non-terminal state.
pub fn validate_outbound_transition(
    from: OutboundStatus,
    to: OutboundStatus,
) -> Result<(), ShippingError> {
    use OutboundStatus::*;
    let ok = matches!(
        (from, to),
        (Pending, Shipped) | (Shipped, DeliveredToCustomer) | (Pending, Failed) | (Shipped, Failed)
    );
    if ok {
        Ok(())
    } else {
        Err(ShippingError::IllegalOutbound {
            from: from.as_str(),
            to: to.as_str(),
        })
    }
}

/// Return legal edges: PickupRequested -> SampleInTransit -> ReturnedToLab,
/// with Failed reachable from either non-terminal state.
pub fn validate_return_transition(
    from: ReturnStatus,
    to: ReturnStatus,
) -> Result<(), ShippingError> {
    use ReturnStatus::*;
    let ok = matches!(
        (from, to),
        (PickupRequested, SampleInTransit)
            | (SampleInTransit, ReturnedToLab)
            | (PickupRequested, Failed)
            | (SampleInTransit, Failed)
    );
    if ok {
        Ok(())
    } else {
        Err(ShippingError::IllegalReturn {
            from: from.as_str(),
            to: to.as_str(),
        })
    }
}
