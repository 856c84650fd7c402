pub mod retention;

pub use retention::{RetentionService, RollupReport};
