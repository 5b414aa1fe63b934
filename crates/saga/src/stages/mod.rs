//! Stage handlers: stock → balance → completion.
//!
//! Each handler consumes one [`StageEvent`](crate::messages::StageEvent)
//! variant, does its work in its own transaction and either publishes the
//! next event or compensates.

pub mod balance;
pub mod completion;
pub mod stock;

use std::time::Instant;

pub use balance::BalanceDeductionHandler;
pub use completion::CompletionHandler;
pub use stock::StockReservationHandler;

fn observe(stage: &'static str, outcome: &'static str, started: Instant) {
    metrics::counter!("saga_stage_total", "stage" => stage, "outcome" => outcome).increment(1);
    metrics::histogram!("saga_stage_duration_seconds", "stage" => stage)
        .record(started.elapsed().as_secs_f64());
}
