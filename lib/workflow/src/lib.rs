//! Workflow execution engine for genweave.
//!
//! This crate runs AI content-generation workflows expressed as directed
//! graphs of typed nodes:
//!
//! - **Definitions**: Nodes, edges and handle typing, validated before a run
//! - **Graph Analysis**: Cycle detection, topological order, dependency maps
//! - **Executions**: Monotonic status, per-node results and a pending worklist
//! - **Orchestration**: One node in flight per root execution, queue-backed
//! - **Processors**: Provider predictions, text generation and sub-workflows
//! - **Continuation**: Webhook or poll results advance the execution
//! - **Recovery**: Cancellation and stalled job sweeps

pub mod cancel;
pub mod completion;
pub mod config;
pub mod definition;
pub mod engine;
pub mod error;
pub mod execution;
pub mod graph;
pub mod inputs;
pub mod node;
pub mod orchestrator;
pub mod processor;
pub mod recovery;
pub mod source;
pub mod store;
pub mod subworkflow;

#[cfg(test)]
mod testing;

pub use cancel::{CancelSummary, Canceller};
pub use completion::{CompletionHandler, CompletionOutcome};
pub use config::{CompletionMode, EngineConfig};
pub use definition::{
    EdgeDefinition, InterfaceInput, InterfaceOutput, NodeDefinition, WorkflowDefinition,
    WorkflowInterface,
};
pub use engine::{Engine, EngineDeps};
pub use error::{EngineError, GraphError, SourceError, StoreError};
pub use execution::{
    DispatchMode, Execution, ExecutionStatus, MAX_DEPTH, NodeResult, NodeResultUpdate,
    NodeStatus, PendingNode,
};
pub use graph::{build_dependency_map, detect_cycles, topological_sort};
pub use node::{HandleType, NodeCategory};
pub use orchestrator::{NodeJob, OrchestrationProcessor, OrchestrationTask, Orchestrator, PassOutcome};
pub use processor::NodeJobProcessor;
pub use recovery::{RecoveryConfig, StallRecoveryTask, SweepReport};
pub use source::{InMemoryWorkflowSource, WorkflowSource};
pub use store::{ExecutionStore, InMemoryExecutionStore};
pub use subworkflow::SubWorkflowCoordinator;
