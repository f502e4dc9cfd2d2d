pub mod asset;
pub mod provider;
pub mod task;

pub use asset::{Asset, AssetClass, DataRequest, DataType, Region, Requirements};
pub use provider::{
    ArbitrationPlan, Fundamentals, Headline, MergeStrategy, OhlcvBar, Payload, ProviderId,
    ProviderResponse, ProviderScore, ProviderStats, ResolutionMethod, ResolvedValue,
    ScoreComponents, SentimentReading, UniverseRow,
};
pub use task::{
    ComputeOp, ExecutionPlan, ExecutionStep, StepId, StepKind, StepStatus, Task, TaskStatus,
};
