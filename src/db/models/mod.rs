pub mod alert_models;
pub mod device_models;
pub mod incident_models;
pub mod log_models;
pub mod webhook_models;

pub use alert_models::{
    AbsenceTarget, AlertEvent, AlertRule, Comparison, RuleCondition, RuleScope, Severity,
};
pub use device_models::{Camera, CameraKey, Collector, DeviceStatus, Gateway, Tag, Upserted};
pub use incident_models::{Incident, IncidentSource, IncidentStatus, IncidentTransition};
pub use log_models::{CameraEvent, CollectionLog, DailyUsage};
pub use webhook_models::{
    DeliveryRecord, DeliveryStatus, PendingDelivery, SubscriptionKind, WebhookSubscription,
};
