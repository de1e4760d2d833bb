//! Orchestration of the phylogenetic inference pipeline: inventory, core
//! estimation, batch compilation, dispatch to the external scheduler,
//! checkpointed phase execution, result aggregation and export.

pub mod aggregate;
pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod dispatch;
pub mod estimate;
pub mod export;
pub mod inventory;
pub mod log;
pub mod models;
pub mod pipeline;
pub mod report;
pub mod species;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use config::{
    CoreAssignment, Datatype, ModelCriterion, RunConfig, RunPaths, SchedulerMode,
    SpeciesTreeTool,
};
pub use dispatch::{EngineInvocation, ExecutionEngine, SchedulerEngine};
pub use export::{export_run, ExportSelection, ExportSummary};
pub use log::RunLog;
pub use pipeline::{
    describe_run, phase_requested, run_pipeline, run_status, PlannedPhase, RunPlan, RunStatus,
    RunSummary,
};
pub use report::{write_report, ReportContext};
