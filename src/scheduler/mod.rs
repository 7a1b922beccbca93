//! Background tickers owned by the service lifecycle.

pub mod engine;

pub use self::engine::{run_alert_flush_loop, run_retrain_loop};
