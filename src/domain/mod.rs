pub mod appointment;
pub mod capacity;
pub mod eligibility;
pub mod payment;
pub mod shipping;
