pub mod carrier;
pub mod notifier;
pub mod payment_gateway;
