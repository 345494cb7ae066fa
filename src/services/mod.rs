pub mod broker;
pub mod database;
pub mod gateways;
pub mod ledger;
pub mod metrics;
pub mod queue;

pub use broker::{send_batch, AmqpBroker, NotificationBroker};
pub use database::{BillingEventStore, Database, SubscriptionStore, DEFAULT_PAGE_SIZE};
pub use gateways::{ChargeRequest, ChargeResult, GatewayClient, GpGatewayClient, RobiGatewayClient};
pub use ledger::{ResultLedger, RedisLedger, FALLBACK_PREFIX, LEDGER_KEY};
pub use metrics::{get_metrics, init_metrics};
pub use queue::{EnqueueOptions, EnqueueOutcome, JobHandler, JobQueue, RedisJobQueue, WorkerHost};
