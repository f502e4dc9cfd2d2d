//! Provider arbitration: scoring, fallback execution, multi-source merge
//! and numeric conflict resolution.

pub mod engine;
pub mod merge;
pub mod stats;

pub use engine::ArbitrationEngine;
pub use merge::{merge, resolve_conflict};
pub use stats::ScoreTracker;
