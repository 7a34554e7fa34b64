//! Stage contract, orchestrator, and the built-in pipeline.

pub mod builtin;
pub mod orchestrator;
pub mod stage;

pub use builtin::{
    PipelineConfig, PipelineOutcome, build_orchestrator, builtin_nodes, execute_pipeline,
    failure_trace, run_pipeline,
};
pub use orchestrator::{Orchestrator, OrchestratorResult, OrchestratorState, StageNode};
pub use stage::{
    SharedInputs, Stage, StageContext, StageOutcome, StageOutput, StageOutputs, StagePayload,
};
