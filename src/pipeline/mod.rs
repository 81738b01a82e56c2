mod orchestrator;

pub use orchestrator::{PipelineOrchestrator, ProcessResult};
