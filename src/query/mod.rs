//! Query pipeline: lower parsed statements into execution DAGs, run
//! them with cached, arbitrated fetches, and expose async task handles.

pub mod executor;
pub mod planner;
pub mod service;

pub use executor::{QueryExecutor, StepOutcome};
pub use planner::plan;
pub use service::QueryService;
