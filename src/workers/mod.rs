pub mod consumer;
pub mod dispatcher;
pub mod operator;
pub mod retrier;
pub mod scheduler;

pub use consumer::{DrainSummary, ResultConsumer, MAX_BATCH_SIZE};
pub use dispatcher::{DispatchSummary, RenewalDispatcher};
pub use operator::{OperatorWorker, REQUEUE_DELAY};
pub use retrier::{NotificationRetrier, SweepSummary, MAX_FALLBACK_RETRIES};
pub use scheduler::{run_daily_at, run_every, BUSINESS_TZ};
