//! Direct Carrier Billing subscription renewal engine.
//!
//! Once a day the dispatcher pages through every subscription due today
//! and schedules a delayed charging job at its exact due moment. Operator
//! worker pools call the carrier gateways with bounded concurrency and
//! append outcomes to a Redis ledger; a periodic consumer drains the
//! ledger, applies bulk database mutations and emits notifications with a
//! durable fallback path.

pub mod config;
pub mod error;
pub mod models;
pub mod observability;
pub mod services;
pub mod startup;
pub mod workers;
