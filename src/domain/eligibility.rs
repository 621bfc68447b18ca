//! Free-consultation eligibility: a completed testing appointment funds one
//! waived-fee consultation within a 30-day window. "Consumed" is represented
//! by the existence of a linked free consultation, not a mutable flag, so the
//! check is idempotent at read time; the booking transaction re-verifies
//! uniqueness to close the concurrent-claim race.

use chrono::{DateTime, Utc};
use rand::Rng;
use uuid::Uuid;

use crate::domain::appointment::AppointmentStatus;

/// Attempts against the test-code unique constraint before failing hard.
pub const TEST_CODE_ATTEMPTS: u32 = 5;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EligibilityRejection {
    #[error("test code does not match any testing appointment")]
    UnknownTestCode,
    #[error("test code belongs to a different customer")]
    NotOwner,
    #[error("testing appointment is not completed")]
    NotCompleted,
    #[error("testing appointment was deleted")]
    Deleted,
    #[error("free consultation window has expired")]
    Expired,
    #[error("free consultation for this test was already claimed")]
    AlreadyClaimed,
}

impl EligibilityRejection {
    pub fn code(&self) -> &'static str {
        match self {
            EligibilityRejection::UnknownTestCode => "UNKNOWN_TEST_CODE",
            EligibilityRejection::NotOwner => "ELIGIBILITY_NOT_OWNER",
            EligibilityRejection::NotCompleted => "ELIGIBILITY_NOT_COMPLETED",
            EligibilityRejection::Deleted => "ELIGIBILITY_DELETED",
            EligibilityRejection::Expired => "ELIGIBILITY_EXPIRED",
            EligibilityRejection::AlreadyClaimed => "ELIGIBILITY_CLAIMED",
        }
    }
}

/// The facts the engine evaluates, loaded from the funding testing
/// appointment plus a claimed-consultation existence check.
#[derive(Debug, Clone)]
pub struct EligibilityRecord {
    pub customer_id: Uuid,
    pub status: AppointmentStatus,
    pub deleted: bool,
    pub valid_until: Option<DateTime<Utc>>,
    pub already_claimed: bool,
}

pub fn evaluate(
    record: &EligibilityRecord,
    requesting_customer: Uuid,
    now: DateTime<Utc>,
) -> Result<(), EligibilityRejection> {
    if record.customer_id != requesting_customer {
        return Err(EligibilityRejection::NotOwner);
    }
    if record.deleted {
        return Err(EligibilityRejection::Deleted);
    }
    if record.status != AppointmentStatus::Completed {
        return Err(EligibilityRejection::NotCompleted);
    }
    match record.valid_until {
        Some(deadline) if now <= deadline => {}
        _ => return Err(EligibilityRejection::Expired),
    }
    if record.already_claimed {
        return Err(EligibilityRejection::AlreadyClaimed);
    }
    Ok(())
}

/// Short customer-facing code stamped on a testing appointment at completion,
/// e.g. `HT-4F7K2M9Q`. Unique-constraint backed; the caller retries.
pub fn generate_test_code<R: Rng>(rng: &mut R) -> String {
    // unambiguous alphabet: no 0/O/1/I
    const ALPHABET: &[u8] = b"23456789ABCDEFGHJKLMNPQRSTUVWXYZ";
    let body: String = (0..8)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("HT-{body}")
}
