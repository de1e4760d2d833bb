use phylo_core::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

pub const MIN_TOTAL_CORES: u32 = 2;
pub const MIN_MODELTEST_CORES: u32 = 4;
/// Upper bound on the in-process aggregation pool, which is I/O bound.
pub const AGGREGATION_POOL_CAP: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerMode {
    Split,
    Onecore,
    Fork,
    Openmp,
}

impl SchedulerMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SchedulerMode::Split => "split",
            SchedulerMode::Onecore => "onecore",
            SchedulerMode::Fork => "fork",
            SchedulerMode::Openmp => "openmp",
        }
    }

    pub fn uses_mpiexec(self) -> bool {
        matches!(self, SchedulerMode::Split | SchedulerMode::Onecore)
    }

    /// Every mode except fork runs jobs inside one engine rank per core, so
    /// jobs must be told to stay single-threaded.
    pub fn pins_single_thread(self) -> bool {
        self != SchedulerMode::Fork
    }
}

/// Which of the parser's parallelism suggestions becomes the core count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreAssignment {
    High,
    Medium,
    Low,
}

impl CoreAssignment {
    pub fn as_str(self) -> &'static str {
        match self {
            CoreAssignment::High => "high",
            CoreAssignment::Medium => "medium",
            CoreAssignment::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Datatype {
    Nt,
    Aa,
}

impl Datatype {
    /// Model handed to the parser before model selection has picked one.
    pub fn placeholder_model(self) -> &'static str {
        match self {
            Datatype::Nt => "GTR",
            Datatype::Aa => "WAG",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelCriterion {
    #[serde(rename = "AICc")]
    AICc,
    #[serde(rename = "AIC")]
    Aic,
    #[serde(rename = "BIC")]
    Bic,
}

impl ModelCriterion {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelCriterion::AICc => "AICc",
            ModelCriterion::Aic => "AIC",
            ModelCriterion::Bic => "BIC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum SpeciesTreeTool {
    Astral { jar: PathBuf },
    Aster { bin: PathBuf },
}

impl fmt::Display for SpeciesTreeTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpeciesTreeTool::Astral { .. } => f.write_str("astral"),
            SpeciesTreeTool::Aster { .. } => f.write_str("aster"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub alignments_dir: PathBuf,
    pub output_dir: PathBuf,
    pub cores: u32,
    pub seed: u64,
    pub do_continue: bool,
    pub dry_run: bool,
    pub scheduler: SchedulerMode,
    pub scheduler_exe: PathBuf,
    pub raxml_binary: PathBuf,
    pub modeltest_binary: PathBuf,
    pub core_assignment: CoreAssignment,
    pub datatype: Datatype,
    pub msa_filter: Option<PathBuf>,
    pub raxml_global_parameters: Option<PathBuf>,
    pub raxml_global_parameters_string: Option<String>,
    pub per_msa_raxml_parameters: Option<PathBuf>,
    pub random_starting_trees: u32,
    pub parsimony_starting_trees: u32,
    pub bootstraps: u32,
    pub auto_mre: bool,
    /// Bootstrap trees per job. `None` picks between 1 and
    /// `coarse_bootstrap_chunk` from the total bootstrap count.
    pub bootstrap_chunk_size: Option<u32>,
    pub coarse_bootstrap_chunk: u32,
    pub coarse_chunk_threshold: u64,
    pub tbe_support: bool,
    pub constrain_search: bool,
    pub percentage_jobs_double_cores: f64,
    pub use_modeltest: bool,
    pub modeltest_global_parameters: Option<PathBuf>,
    pub per_msa_modeltest_parameters: Option<PathBuf>,
    pub modeltest_criterion: ModelCriterion,
    pub modeltest_cores: u32,
    pub species_tree: Option<SpeciesTreeTool>,
    pub species_tree_parameters: Option<PathBuf>,
    pub job_failure_fatal: bool,
    pub retry: u32,
    pub disable_job_sorting: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            alignments_dir: PathBuf::new(),
            output_dir: PathBuf::new(),
            cores: 0,
            seed: 0,
            do_continue: false,
            dry_run: false,
            scheduler: SchedulerMode::Split,
            scheduler_exe: PathBuf::from("mpi-scheduler"),
            raxml_binary: PathBuf::from("raxml-ng"),
            modeltest_binary: PathBuf::from("modeltest-ng"),
            core_assignment: CoreAssignment::Medium,
            datatype: Datatype::Nt,
            msa_filter: None,
            raxml_global_parameters: None,
            raxml_global_parameters_string: None,
            per_msa_raxml_parameters: None,
            random_starting_trees: 1,
            parsimony_starting_trees: 0,
            bootstraps: 0,
            auto_mre: false,
            bootstrap_chunk_size: None,
            coarse_bootstrap_chunk: 2,
            coarse_chunk_threshold: 5000,
            tbe_support: false,
            constrain_search: false,
            percentage_jobs_double_cores: 0.05,
            use_modeltest: false,
            modeltest_global_parameters: None,
            per_msa_modeltest_parameters: None,
            modeltest_criterion: ModelCriterion::AICc,
            modeltest_cores: 16,
            species_tree: None,
            species_tree_parameters: None,
            job_failure_fatal: false,
            retry: 0,
            disable_job_sorting: false,
        }
    }
}

/// Starting point written by `phylo init`. Only the first three keys are
/// required; everything else shows its default.
pub const CONFIG_TEMPLATE: &str = "\
alignments_dir: ''                # REQUIRED: one alignment file per dataset
output_dir: ''                    # REQUIRED: must not exist unless resuming
cores: 0                          # REQUIRED: total core budget, at least 2
seed: 0
scheduler: split                  # split | onecore | fork | openmp
scheduler_exe: mpi-scheduler
raxml_binary: raxml-ng
modeltest_binary: modeltest-ng
core_assignment: medium           # high | medium | low
datatype: nt                      # nt | aa
raxml_global_parameters_string: '--model GTR+G'
random_starting_trees: 1
parsimony_starting_trees: 0
bootstraps: 0
auto_mre: false
tbe_support: false
constrain_search: false
percentage_jobs_double_cores: 0.05
use_modeltest: false
modeltest_criterion: AICc         # AICc | AIC | BIC
modeltest_cores: 16
job_failure_fatal: false
retry: 0
disable_job_sorting: false
# species_tree:
#   tool: astral
#   jar: /path/to/astral.jar
";

fn check_file(path: &Option<PathBuf>, what: &str, errors: &mut Vec<String>) {
    if let Some(p) = path {
        if !p.is_file() {
            errors.push(format!("invalid {} file: {}", what, p.display()));
        }
    }
}

impl RunConfig {
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        Ok(serde_yaml::from_str(&raw)?)
    }

    pub fn starting_trees(&self) -> u32 {
        self.random_starting_trees + self.parsimony_starting_trees
    }

    /// Independent search runs per dataset, used by the core-count prediction.
    pub fn runs_per_dataset(&self) -> u64 {
        u64::from(self.starting_trees()) + u64::from(self.bootstraps)
    }

    pub fn paths(&self) -> RunPaths {
        RunPaths::new(&self.output_dir)
    }

    /// All pre-flight checks. Every problem is reported at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if self.alignments_dir.as_os_str().is_empty() {
            errors.push("please provide the alignment directory".to_string());
        } else if !self.alignments_dir.is_dir() {
            errors.push(format!(
                "invalid alignment directory: {}",
                self.alignments_dir.display()
            ));
        } else {
            let empty = fs::read_dir(&self.alignments_dir)
                .map(|mut it| it.next().is_none())
                .unwrap_or(true);
            if empty {
                errors.push(format!(
                    "alignment directory {} is empty",
                    self.alignments_dir.display()
                ));
            }
        }
        if self.output_dir.as_os_str().is_empty() {
            errors.push("please provide the output directory".to_string());
        }
        if self.cores < MIN_TOTAL_CORES {
            errors.push(format!(
                "the number of cores must be at least {} (got {})",
                MIN_TOTAL_CORES, self.cores
            ));
        }
        if self.use_modeltest && self.modeltest_cores < MIN_MODELTEST_CORES {
            errors.push(format!(
                "the number of cores per model-selection job must be at least {} (got {})",
                MIN_MODELTEST_CORES, self.modeltest_cores
            ));
        }
        if !(0.0..=1.0).contains(&self.percentage_jobs_double_cores) {
            errors.push(format!(
                "percentage_jobs_double_cores must be within [0, 1] (got {})",
                self.percentage_jobs_double_cores
            ));
        }
        if self.auto_mre && self.bootstraps < 1 {
            errors.push(
                "autoMRE needs the maximum number of bootstrap trees (bootstraps >= 1)".to_string(),
            );
        }
        if self.bootstrap_chunk_size == Some(0) || self.coarse_bootstrap_chunk == 0 {
            errors.push("bootstrap chunk sizes must be positive".to_string());
        }
        check_file(&self.msa_filter, "msa filter", &mut errors);
        check_file(
            &self.raxml_global_parameters,
            "raxml global parameters",
            &mut errors,
        );
        check_file(
            &self.per_msa_raxml_parameters,
            "per-msa raxml parameters",
            &mut errors,
        );
        check_file(
            &self.modeltest_global_parameters,
            "model-test global parameters",
            &mut errors,
        );
        check_file(
            &self.per_msa_modeltest_parameters,
            "per-msa model-test parameters",
            &mut errors,
        );
        check_file(
            &self.species_tree_parameters,
            "species-tree parameters",
            &mut errors,
        );
        if errors.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::config(errors.join("; ")))
        }
    }
}

/// Layout of a run's output directory.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub root: PathBuf,
}

impl RunPaths {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn checkpoint(&self) -> PathBuf {
        self.root.join("checkpoint")
    }

    pub fn datasets_state(&self) -> PathBuf {
        self.root.join("datasets.jsonl")
    }

    pub fn failure_ledger(&self) -> PathBuf {
        self.root.join("failed_commands.txt")
    }

    pub fn rejected(&self) -> PathBuf {
        self.root.join("rejected_datasets.txt")
    }

    pub fn resolved_config(&self) -> PathBuf {
        self.root.join("resolved_config.json")
    }

    pub fn resolved_digest(&self) -> PathBuf {
        self.root.join("resolved_config.digest")
    }

    pub fn report(&self) -> PathBuf {
        self.root.join("report.txt")
    }

    pub fn parse_run(&self) -> PathBuf {
        self.root.join("parse_run")
    }

    pub fn old_parse_run(&self) -> PathBuf {
        self.root.join("old_parse_run")
    }

    pub fn modeltest_run(&self) -> PathBuf {
        self.root.join("modeltest_run")
    }

    pub fn constrain_run(&self) -> PathBuf {
        self.root.join("constrain_run")
    }

    pub fn mlsearch_run(&self) -> PathBuf {
        self.root.join("mlsearch_run")
    }

    pub fn mlsearch_results(&self) -> PathBuf {
        self.mlsearch_run().join("results")
    }

    pub fn mlsearch_bootstraps(&self) -> PathBuf {
        self.mlsearch_run().join("bootstraps")
    }

    pub fn concatenated_bootstraps(&self) -> PathBuf {
        self.root.join("concatenated_bootstraps")
    }

    pub fn concatenated_bootstrap(&self, name: &str) -> PathBuf {
        self.concatenated_bootstraps().join(format!("{}.bs", name))
    }

    pub fn supports_run(&self) -> PathBuf {
        self.root.join("supports_run")
    }

    pub fn species_run(&self, tool: &SpeciesTreeTool) -> PathBuf {
        self.root.join(format!("{}_run", tool))
    }

    /// Engine-driven phase directories, in pipeline order.
    pub fn engine_run_dirs(&self) -> Vec<(&'static str, PathBuf)> {
        vec![
            ("parse", self.parse_run()),
            ("old_parse", self.old_parse_run()),
            ("modeltest", self.modeltest_run()),
            ("constrain", self.constrain_run()),
            ("mlsearch", self.mlsearch_run()),
            ("supports", self.supports_run()),
        ]
    }
}
