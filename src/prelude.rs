pub use crate::config::{InputFiles, MomentArmFile, PipelineConfig, SimulationConfig};
pub use crate::error::{PipelineError, PipelineResult};
pub use crate::io::{BundleReceiver, BundleSender, ChannelBundle, Popped, WaitPolicy};
pub use crate::model::muscle::{MuscleModel, MuscleParameters, SubjectConfig};
pub use crate::model::{ModelFrame, ModelOutput, NmsModel};
pub use crate::optimizer::{AnnealingOptimizer, Calibration, HybridConfig, Optimizer};
pub use crate::pipeline::StepDriver;
pub use crate::runtime::{Orchestrator, RunReport, SinkRole};
pub use crate::series::{TimeSeriesReader, TimeSeriesRecord};
pub use crate::storage::{FileStorage, MemoryStorage, StorageWriter};
pub use crate::strategy::{
    ActivationModel, CurveMode, ExecutionMode, LoopKind, StrategyRegistry, TendonModel,
};
pub use crate::utils::logger::LoggerConfig;
pub use crate::utils::{CancelToken, CountingGate};
