pub mod aggregated;
pub mod health;
pub mod metrics;
