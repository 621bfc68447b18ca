pub mod payment_sweep;
