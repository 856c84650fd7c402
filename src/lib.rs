pub mod alerts;
pub mod api;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod incidents;
pub mod ingest;
pub mod messaging;
pub mod pipeline;
pub mod services;
pub mod sessionizer;
pub mod state;
pub mod store;
pub mod utils;

// Re-export main components for easier use
pub use error::Error;
pub use pipeline::{Health, Pipeline};
pub use store::{MemoryStore, PgStore, Store};
