pub mod backoff;
pub mod keyed_lock;

pub use backoff::Backoff;
pub use keyed_lock::KeyedLocks;
