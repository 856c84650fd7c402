pub mod alerts;
pub mod camera_events;
pub mod collection_logs;
pub mod devices;
pub mod incidents;
pub mod webhooks;

pub use alerts::AlertsRepository;
pub use camera_events::CameraEventsRepository;
pub use collection_logs::CollectionLogsRepository;
pub use devices::DevicesRepository;
pub use incidents::IncidentsRepository;
pub use webhooks::WebhooksRepository;
