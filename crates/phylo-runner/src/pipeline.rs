//! Checkpointed phase driver.
//!
//! Phases run in a fixed order and each one commits by advancing the
//! checkpoint file by exactly one. On resume, every phase at or below the
//! stored checkpoint is skipped and the dataset set is reloaded from
//! `datasets.jsonl` instead of being re-derived.

use crate::aggregate::{concatenate_bootstraps, select_best_trees};
use crate::batch::{
    bootstrap_chunk_size, bootstrap_jobs_per_dataset, compile_constraint_consensus,
    compile_constraint_parsimony, compile_mlsearch, compile_modeltest, compile_parse,
    compile_supports,
};
use crate::checkpoint::{load_datasets, read_checkpoint, save_datasets, write_checkpoint};
use crate::config::{RunConfig, RunPaths};
use crate::dispatch::{Dispatcher, ExecutionEngine, FailureLedger};
use crate::estimate::{analyse_parse_run, CorePrediction};
use crate::inventory::load_inventory;
use crate::log::RunLog;
use crate::models::apply_selected_models;
use crate::report::{write_report, ReportContext};
use crate::species::run_species_tree;
use crate::VERSION;
use phylo_core::{
    atomic_write_bytes, atomic_write_json_pretty, canonical_json_digest, Dataset, Phase,
    PipelineError, Result,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub output_dir: PathBuf,
    pub checkpoint: u8,
    pub datasets: usize,
    pub valid_datasets: usize,
    pub failed_jobs: usize,
    pub dry_run: bool,
    pub recommended_max_cores: Option<u64>,
    pub species_tree: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
}

/// Whether the configuration asks for `phase` at all. Unrequested phases
/// still commit their checkpoint index.
pub fn phase_requested(config: &RunConfig, phase: Phase) -> bool {
    match phase {
        Phase::Parse | Phase::MlSearch => true,
        Phase::ModelSelect => config.use_modeltest,
        Phase::BestTreeSelect => config.starting_trees() > 1,
        Phase::BootstrapConcat => config.bootstraps > 0,
        Phase::SupportCompute => config.bootstraps > 0 && config.starting_trees() > 0,
        Phase::SpeciesTree => config.species_tree.is_some(),
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|e| PipelineError::io(".", e))?;
    Ok(cwd.join(path))
}

/// Resolved configuration as persisted. Invocation-only switches are left
/// out so that resuming does not read as a configuration change.
fn resolved_config_value(config: &RunConfig) -> Result<Value> {
    let mut value = serde_json::to_value(config)?;
    if let Some(obj) = value.as_object_mut() {
        obj.remove("do_continue");
        obj.remove("dry_run");
    }
    Ok(value)
}

fn valid_count(datasets: &BTreeMap<String, Dataset>) -> usize {
    datasets.values().filter(|d| d.valid).count()
}

fn ensure_any_valid(datasets: &BTreeMap<String, Dataset>, phase: Phase) -> Result<()> {
    if valid_count(datasets) == 0 {
        return Err(PipelineError::AllDatasetsInvalid {
            phase: phase.to_string(),
        });
    }
    Ok(())
}

/// Marks one phase in flight; committing advances the checkpoint.
struct PhaseGuard<'a> {
    phase: Phase,
    log: &'a RunLog,
    done: bool,
}

impl<'a> PhaseGuard<'a> {
    fn begin(phase: Phase, log: &'a RunLog) -> Self {
        log.timed(format!("starting {} (phase {})", phase, phase.index()));
        Self {
            phase,
            log,
            done: false,
        }
    }

    fn commit(mut self, checkpoint: &Path) -> Result<u8> {
        write_checkpoint(checkpoint, self.phase.index())?;
        self.done = true;
        self.log.timed(format!("end of {}", self.phase));
        Ok(self.phase.index())
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.log.error(format!(
                "{} did not complete; rerun with --continue to resume from it",
                self.phase
            ));
        }
    }
}

struct Pipeline<'a> {
    config: RunConfig,
    paths: RunPaths,
    engine: &'a dyn ExecutionEngine,
    log: &'a RunLog,
}

impl<'a> Pipeline<'a> {
    fn persist_resolved_config(&self) -> Result<()> {
        let value = resolved_config_value(&self.config)?;
        let digest = canonical_json_digest(&value);
        let digest_path = self.paths.resolved_digest();
        if self.config.do_continue {
            if let Ok(previous) = fs::read_to_string(&digest_path) {
                if previous.trim() != digest {
                    self.log.warn(
                        "configuration changed since the previous attempt; completed phases are kept and the remaining ones use the new settings",
                    );
                }
            }
        }
        atomic_write_json_pretty(&self.paths.resolved_config(), &value)?;
        atomic_write_bytes(&digest_path, digest.as_bytes())
    }

    fn parse_and_analyse(
        &self,
        dispatcher: &mut Dispatcher<'a>,
        datasets: &mut BTreeMap<String, Dataset>,
    ) -> Result<CorePrediction> {
        let run_dir = self.paths.parse_run();
        let results = run_dir.join("results");
        let batch = compile_parse(datasets, &results, &self.config)?;
        dispatcher.dispatch(
            Phase::Parse.as_str(),
            Phase::Parse.job_prefix(),
            &batch,
            &run_dir,
            &self.config.raxml_binary,
        )?;
        analyse_parse_run(
            datasets,
            &results,
            &self.paths.rejected(),
            &self.config,
            self.log,
        )
    }

    fn model_select(
        &self,
        dispatcher: &mut Dispatcher<'a>,
        datasets: &mut BTreeMap<String, Dataset>,
    ) -> Result<CorePrediction> {
        let run_dir = self.paths.modeltest_run();
        let batch = compile_modeltest(datasets, &run_dir.join("results"), &self.config)?;
        dispatcher.dispatch(
            Phase::ModelSelect.as_str(),
            Phase::ModelSelect.job_prefix(),
            &batch,
            &run_dir,
            &self.config.modeltest_binary,
        )?;
        apply_selected_models(datasets, &run_dir, self.config.modeltest_criterion, self.log)?;
        ensure_any_valid(datasets, Phase::ModelSelect)?;

        // Re-parse with the selected models so binary alignments and size
        // metrics match what the search will use.
        let old = self.paths.old_parse_run();
        if old.exists() {
            fs::remove_dir_all(&old).map_err(|e| PipelineError::io(&old, e))?;
        }
        let current = self.paths.parse_run();
        if current.exists() {
            fs::rename(&current, &old).map_err(|e| PipelineError::io(&current, e))?;
        }
        let prediction = self.parse_and_analyse(dispatcher, datasets)?;
        ensure_any_valid(datasets, Phase::ModelSelect)?;
        save_datasets(&self.paths.datasets_state(), datasets)?;
        Ok(prediction)
    }

    fn build_constraints(
        &self,
        dispatcher: &mut Dispatcher<'a>,
        datasets: &BTreeMap<String, Dataset>,
    ) -> Result<()> {
        let run_dir = self.paths.constrain_run();
        let parsimony = run_dir.join("parsimony").join("results");
        let consensus = run_dir.join("consensus").join("results");
        let batch = compile_constraint_parsimony(datasets, &parsimony, &self.config)?;
        dispatcher.dispatch(
            "constraint-parsimony",
            "parsi",
            &batch,
            &run_dir,
            &self.config.raxml_binary,
        )?;
        let batch = compile_constraint_consensus(datasets, &parsimony, &consensus, &self.config)?;
        dispatcher.dispatch(
            "constraint-consensus",
            "consensus",
            &batch,
            &run_dir,
            &self.config.raxml_binary,
        )?;
        Ok(())
    }

    fn run_phase(
        &self,
        phase: Phase,
        dispatcher: &mut Dispatcher<'a>,
        datasets: &mut BTreeMap<String, Dataset>,
        outputs: &mut PhaseOutputs,
    ) -> Result<()> {
        match phase {
            Phase::Parse => {
                outputs.prediction = Some(self.parse_and_analyse(dispatcher, datasets)?);
                save_datasets(&self.paths.datasets_state(), datasets)?;
            }
            Phase::ModelSelect => {
                outputs.prediction = Some(self.model_select(dispatcher, datasets)?);
            }
            Phase::MlSearch => {
                if self.config.constrain_search {
                    self.build_constraints(dispatcher, datasets)?;
                }
                let batch = compile_mlsearch(datasets, &self.paths, &self.config)?;
                dispatcher.dispatch(
                    phase.as_str(),
                    phase.job_prefix(),
                    &batch,
                    &self.paths.mlsearch_run(),
                    &self.config.raxml_binary,
                )?;
            }
            Phase::BestTreeSelect => {
                let selected = select_best_trees(datasets, &self.paths, &self.config, self.log)?;
                self.log
                    .info(format!("best ML tree selected for {} dataset(s)", selected.len()));
            }
            Phase::BootstrapConcat => {
                let done = concatenate_bootstraps(datasets, &self.paths, &self.config, self.log)?;
                self.log
                    .info(format!("bootstrap trees concatenated for {} dataset(s)", done.len()));
            }
            Phase::SupportCompute => {
                let batch = compile_supports(datasets, &self.paths, &self.config)?;
                dispatcher.dispatch(
                    phase.as_str(),
                    phase.job_prefix(),
                    &batch,
                    &self.paths.supports_run(),
                    &self.config.raxml_binary,
                )?;
            }
            Phase::SpeciesTree => {
                if let Some(tool) = &self.config.species_tree {
                    outputs.species_tree =
                        Some(run_species_tree(tool, &self.config, &self.paths, self.log)?);
                }
            }
        }
        Ok(())
    }

    fn execute(&self) -> Result<RunSummary> {
        self.persist_resolved_config()?;
        let config = &self.config;
        let paths = &self.paths;
        let log = self.log;

        let mut checkpoint = read_checkpoint(&paths.checkpoint())?;
        if checkpoint > 0 {
            log.info(format!(
                "resuming after checkpoint {} ({})",
                checkpoint,
                Phase::from_index(checkpoint).map(Phase::as_str).unwrap_or("unknown")
            ));
        }
        let ledger = FailureLedger::open(&paths.failure_ledger())?;
        let mut dispatcher = Dispatcher::new(self.engine, config, ledger, log);
        let mut outputs = PhaseOutputs::default();

        let mut datasets = if checkpoint < Phase::Parse.index() {
            let guard = PhaseGuard::begin(Phase::Parse, log);
            let mut datasets = load_inventory(config, log)?.datasets;
            if config.use_modeltest {
                let placeholder = config.datatype.placeholder_model();
                for d in datasets.values_mut().filter(|d| d.model().is_none()) {
                    d.set_model(placeholder);
                }
            }
            self.run_phase(Phase::Parse, &mut dispatcher, &mut datasets, &mut outputs)?;
            ensure_any_valid(&datasets, Phase::Parse)?;
            checkpoint = guard.commit(&paths.checkpoint())?;
            datasets
        } else {
            load_datasets(&paths.datasets_state())?
        };
        ensure_any_valid(&datasets, Phase::Parse)?;

        if config.dry_run {
            log.info("end of the dry run");
            return Ok(self.summary(checkpoint, &datasets, &dispatcher, outputs, true));
        }

        for phase in Phase::ALL.iter().copied().skip(1) {
            if phase.index() <= checkpoint {
                continue;
            }
            let guard = PhaseGuard::begin(phase, log);
            if phase_requested(config, phase) {
                self.run_phase(phase, &mut dispatcher, &mut datasets, &mut outputs)?;
            } else {
                log.info(format!("{} not requested, nothing to do", phase));
            }
            checkpoint = guard.commit(&paths.checkpoint())?;
        }

        ensure_any_valid(&datasets, Phase::SpeciesTree)?;
        let failed = dispatcher.ledger().entries().len();
        if failed > 0 {
            log.warn(format!("total number of jobs that failed: {}", failed));
            log.warn(format!(
                "for a detailed list, see {}",
                dispatcher.ledger().path().display()
            ));
        }
        let invalid = datasets.len() - valid_count(&datasets);
        if invalid > 0 {
            log.warn(format!(
                "{} dataset(s) were rejected, see {}",
                invalid,
                paths.rejected().display()
            ));
        }
        Ok(self.summary(checkpoint, &datasets, &dispatcher, outputs, false))
    }

    fn summary(
        &self,
        checkpoint: u8,
        datasets: &BTreeMap<String, Dataset>,
        dispatcher: &Dispatcher<'_>,
        outputs: PhaseOutputs,
        dry_run: bool,
    ) -> RunSummary {
        RunSummary {
            output_dir: self.paths.root.clone(),
            checkpoint,
            datasets: datasets.len(),
            valid_datasets: valid_count(datasets),
            failed_jobs: dispatcher.ledger().entries().len(),
            dry_run,
            recommended_max_cores: outputs.prediction.map(|p| p.recommended_max),
            species_tree: outputs.species_tree,
            log_file: self.log.path().map(Path::to_path_buf),
        }
    }
}

#[derive(Default)]
struct PhaseOutputs {
    prediction: Option<CorePrediction>,
    species_tree: Option<PathBuf>,
}

/// Run (or resume) the whole pipeline into `config.output_dir`.
///
/// Fatal errors other than configuration problems leave a `report.txt` in
/// the output directory before being returned.
pub fn run_pipeline(
    mut config: RunConfig,
    engine: &dyn ExecutionEngine,
    args: &[String],
) -> Result<RunSummary> {
    config.validate()?;
    config.output_dir = absolute(&config.output_dir)?;
    config.alignments_dir = absolute(&config.alignments_dir)?;
    if config.output_dir.exists() && !config.do_continue {
        return Err(PipelineError::config(format!(
            "the output directory {} already exists; use another output directory or --continue",
            config.output_dir.display()
        )));
    }
    let log = RunLog::in_dir(&config.output_dir)?;
    log.header(VERSION, args);
    let pipeline = Pipeline {
        paths: config.paths(),
        engine,
        log: &log,
        config,
    };
    match pipeline.execute() {
        Ok(summary) => {
            log.timed("end of the run");
            Ok(summary)
        }
        Err(err) => {
            log.error(err.to_string());
            if err.wants_report() {
                let ctx = ReportContext {
                    version: VERSION.to_string(),
                    args: args.to_vec(),
                    cores: Some(pipeline.config.cores),
                    error: Some(err.to_string()),
                };
                match write_report(&pipeline.paths.root, &ctx) {
                    Ok(path) => log.error(format!(
                        "a report was written to {}; please attach it when reporting an issue",
                        path.display()
                    )),
                    Err(e) => log.error(format!("failed to write the report: {}", e)),
                }
            }
            Err(err)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedPhase {
    pub index: u8,
    pub name: &'static str,
    pub requested: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunPlan {
    pub alignments_dir: PathBuf,
    pub output_dir: PathBuf,
    pub output_exists: bool,
    pub datasets: Vec<String>,
    pub orphan_filter_entries: Vec<String>,
    pub unknown_override_names: Vec<String>,
    pub warnings: Vec<String>,
    pub cores: u32,
    pub scheduler: &'static str,
    pub starting_trees: u32,
    pub bootstraps: u32,
    pub bootstrap_chunk: u32,
    pub bootstrap_jobs_per_dataset: u32,
    pub phases: Vec<PlannedPhase>,
}

/// Validate the configuration and resolve the inventory without running anything.
pub fn describe_run(config: &RunConfig) -> Result<RunPlan> {
    config.validate()?;
    let log = RunLog::detached();
    let inventory = load_inventory(config, &log)?;
    let chunk = bootstrap_chunk_size(config, inventory.datasets.len());
    Ok(RunPlan {
        alignments_dir: config.alignments_dir.clone(),
        output_dir: config.output_dir.clone(),
        output_exists: config.output_dir.exists(),
        datasets: inventory.datasets.keys().cloned().collect(),
        orphan_filter_entries: inventory.orphan_filter_entries,
        unknown_override_names: inventory.unknown_override_names,
        warnings: log.warnings(),
        cores: config.cores,
        scheduler: config.scheduler.as_str(),
        starting_trees: config.starting_trees(),
        bootstraps: config.bootstraps,
        bootstrap_chunk: chunk,
        bootstrap_jobs_per_dataset: bootstrap_jobs_per_dataset(config, chunk),
        phases: Phase::ALL
            .iter()
            .map(|p| PlannedPhase {
                index: p.index(),
                name: p.as_str(),
                requested: phase_requested(config, *p),
            })
            .collect(),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    pub output_dir: PathBuf,
    pub checkpoint: u8,
    pub completed: Vec<&'static str>,
    pub pending: Vec<&'static str>,
    pub datasets: Option<usize>,
    pub valid_datasets: Option<usize>,
    pub failed_jobs: usize,
    pub has_report: bool,
}

pub fn run_status(output_dir: &Path) -> Result<RunStatus> {
    if !output_dir.is_dir() {
        return Err(PipelineError::config(format!(
            "{} is not a run output directory",
            output_dir.display()
        )));
    }
    let paths = RunPaths::new(output_dir);
    let checkpoint = read_checkpoint(&paths.checkpoint())?;
    let (completed, pending): (Vec<Phase>, Vec<Phase>) =
        Phase::ALL.iter().partition(|p| p.index() <= checkpoint);
    let datasets = if paths.datasets_state().is_file() {
        Some(load_datasets(&paths.datasets_state())?)
    } else {
        None
    };
    let ledger = FailureLedger::open(&paths.failure_ledger())?;
    Ok(RunStatus {
        output_dir: output_dir.to_path_buf(),
        checkpoint,
        completed: completed.into_iter().map(Phase::as_str).collect(),
        pending: pending.into_iter().map(Phase::as_str).collect(),
        datasets: datasets.as_ref().map(BTreeMap::len),
        valid_datasets: datasets.as_ref().map(valid_count),
        failed_jobs: ledger.entries().len(),
        has_report: paths.report().is_file(),
    })
}
