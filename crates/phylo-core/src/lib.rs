pub mod args;
pub mod dataset;
pub mod error;
pub mod fsutil;
pub mod job;
pub mod phase;

pub use args::{ArgEntry, ToolArgs};
pub use dataset::{dataset_name, Dataset, DATASET_SCHEMA_VERSION};
pub use error::{read_tool_log, PipelineError, Result, ScrapeError, ENGINE_JOBS_FAILED_CODE};
pub use fsutil::{
    append_lines, atomic_copy, atomic_write_bytes, atomic_write_json_pretty, canonical_json_digest,
    ensure_dir, incremental_path, scratch_dir, sha256_bytes,
};
pub use job::{JobBatch, JobDescriptor};
pub use phase::{Phase, TERMINAL_CHECKPOINT};
