pub mod billing_event;
pub mod charging;
pub mod notification;
pub mod outcome;
pub mod subscription;

pub use billing_event::{BillingEvent, BillingEventStatus, EVENT_TYPE_RENEWAL};
pub use charging::{ChargingConfig, GpConfig, RobiConfig};
pub use notification::{FallbackMessage, NotificationEvent, NotificationPayload, NOTIFICATION_SOURCE};
pub use outcome::{ChargeOutcome, GatewayFault, RenewalJob, SubscriptionBulkUpdate};
pub use subscription::{
    Merchant, Operator, PaymentChannel, PlanPricing, Product, ProductPlan, Subscription,
    SubscriptionStatus,
};
