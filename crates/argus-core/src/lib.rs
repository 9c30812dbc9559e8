pub mod config;
pub mod error;
pub mod item;
pub mod model_cache;
pub mod rate_limit;
pub mod scheduler;
pub mod sink;
pub mod stage;
pub mod testutil;
pub mod tracker;
pub mod traits;

pub use config::PipelineConfig;
pub use error::PipelineError;
pub use item::{
    BackoffPolicy, ContentItem, Fragment, ItemStatus, MediaRef, OutputRef, RawMessage, StageKind,
    StagePlan, StageState, StageStatus, compute_hash,
};
pub use model_cache::{ModelCache, ModelHandle, ModelLoader};
pub use rate_limit::TokenBucket;
pub use sink::{MemorySink, Sink};
pub use stage::{StageExecutor, StageOutput};
pub use tracker::{CreateOutcome, FailureDisposition, ItemTracker};
pub use traits::{ChannelSource, ImageInference, SourcePage, TextInference};
