use std::env;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub payment_gateway_url: String,
    pub payment_return_url: String,
    pub payment_cancel_url: String,
    pub carrier_url: String,
    pub notifier_url: String,
    pub sweep_interval_minutes: u64,
    /// When true, a return pickup may only be requested after the outbound
    /// leg has reached DeliveredToCustomer.
    pub return_requires_delivery: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL")?;
        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
        let payment_gateway_url =
            env::var("PAYMENT_GATEWAY_URL").unwrap_or_else(|_| "http://localhost:9100".to_string());
        let payment_return_url = env::var("PAYMENT_RETURN_URL")
            .unwrap_or_else(|_| "http://localhost:3000/payment/return".to_string());
        let payment_cancel_url = env::var("PAYMENT_CANCEL_URL")
            .unwrap_or_else(|_| "http://localhost:3000/payment/cancel".to_string());
        let carrier_url =
            env::var("CARRIER_URL").unwrap_or_else(|_| "http://localhost:9200".to_string());
        let notifier_url =
            env::var("NOTIFIER_URL").unwrap_or_else(|_| "http://localhost:9300".to_string());
        let sweep_interval_minutes = env::var("SWEEP_INTERVAL_MINUTES")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(30);
        let return_requires_delivery = env::var("RETURN_REQUIRES_DELIVERY")
            .ok()
            .and_then(|s| s.parse::<bool>().ok())
            .unwrap_or(false);

        Ok(Self {
            database_url,
            bind_addr,
            payment_gateway_url,
            payment_return_url,
            payment_cancel_url,
            carrier_url,
            notifier_url,
            sweep_interval_minutes,
            return_requires_delivery,
        })
    }
}
