//! Rule evaluation over readings, camera events and the periodic absence sweep.

pub mod engine;
pub mod rules;

#[cfg(test)]
mod tests;

pub use engine::{CameraContext, EngineStats, FireOutcome, ReadingContext, RuleEngine};
pub use rules::{render_title, MatchRecord, Subject};
