use std::path::PathBuf;
use thiserror::Error;

/// Exit code the execution engine reserves for "some jobs failed but the
/// engine itself completed".
pub const ENGINE_JOBS_FAILED_CODE: i32 = 242;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Bad paths, bad option values, empty inputs. Reported before any phase runs.
    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The engine (or a tool it needs) cannot be found or started.
    #[error("execution engine unavailable: {message}")]
    EngineUnavailable { message: String },

    /// The engine exited with an unrecognized status after all retries.
    #[error("execution engine failed with status {code} after {attempts} attempt(s)")]
    Engine { code: i32, attempts: u32 },

    /// Jobs failed while job failures are configured as fatal.
    #[error("{failed} job(s) failed during {phase} and job failures are fatal")]
    JobFailures { phase: String, failed: usize },

    #[error("all {total} scheduled job(s) failed during {phase}")]
    AllJobsFailed { phase: String, total: usize },

    /// A one-shot external tool (species-tree inference) failed.
    #[error("{tool} failed: {message}")]
    Tool { tool: String, message: String },

    #[error("no dataset survived the {phase} phase")]
    AllDatasetsInvalid { phase: String },
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn engine_unavailable(message: impl Into<String>) -> Self {
        Self::EngineUnavailable {
            message: message.into(),
        }
    }

    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Process exit status used by the CLI when this error aborts a run.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } | Self::Json(_) | Self::Yaml(_) => 1,
            Self::Io { .. } => 2,
            Self::EngineUnavailable { .. } => 238,
            Self::Engine { .. } => 239,
            Self::JobFailures { .. } => ENGINE_JOBS_FAILED_CODE,
            Self::AllJobsFailed { .. } => 243,
            Self::Tool { .. } => 244,
            Self::AllDatasetsInvalid { .. } => 245,
        }
    }

    /// Fatal errors that should be bundled into a diagnostic report. Plain
    /// configuration mistakes are reported directly.
    pub fn wants_report(&self) -> bool {
        !matches!(self, Self::Config { .. } | Self::Yaml(_))
    }
}

/// Outcome of scraping a labeled line out of a tool log.
///
/// These are the expected ways tool output goes wrong: the tool never wrote
/// the file, or wrote something we cannot read. Anything else is an I/O error
/// and stays fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScrapeError {
    #[error("log file {0} is missing")]
    Missing(PathBuf),

    #[error("malformed line {line:?}: {reason}")]
    Malformed { line: String, reason: String },

    #[error("required field '{0}' not found")]
    FieldNotFound(&'static str),
}

/// Read a tool log, separating "not there" (expected) from real I/O failures.
pub fn read_tool_log(path: &std::path::Path) -> Result<std::result::Result<String, ScrapeError>> {
    match std::fs::read_to_string(path) {
        Ok(s) => Ok(Ok(s)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Ok(Err(ScrapeError::Missing(path.to_path_buf())))
        }
        Err(e) if e.kind() == std::io::ErrorKind::InvalidData => Ok(Err(ScrapeError::Malformed {
            line: String::new(),
            reason: format!("{} is not valid UTF-8", path.display()),
        })),
        Err(e) => Err(PipelineError::io(path, e)),
    }
}
