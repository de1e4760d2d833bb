use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use phylo_core::PipelineError;
use phylo_runner::config::CONFIG_TEMPLATE;
use phylo_runner::export::load_resolved_config;
use phylo_runner::{
    CoreAssignment, Datatype, ExportSelection, ExportSummary, ModelCriterion, ReportContext,
    RunConfig, RunLog, RunPaths, RunPlan, RunStatus, RunSummary, SchedulerEngine, SchedulerMode,
    SpeciesTreeTool,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "phylo", version, about = "Parallel per-gene phylogenetic inference")]
struct Cli {
    /// Default log filter; RUST_LOG takes precedence.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SchedulerArg {
    Split,
    Onecore,
    Fork,
    Openmp,
}

impl From<SchedulerArg> for SchedulerMode {
    fn from(value: SchedulerArg) -> Self {
        match value {
            SchedulerArg::Split => SchedulerMode::Split,
            SchedulerArg::Onecore => SchedulerMode::Onecore,
            SchedulerArg::Fork => SchedulerMode::Fork,
            SchedulerArg::Openmp => SchedulerMode::Openmp,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CoreAssignmentArg {
    High,
    Medium,
    Low,
}

impl From<CoreAssignmentArg> for CoreAssignment {
    fn from(value: CoreAssignmentArg) -> Self {
        match value {
            CoreAssignmentArg::High => CoreAssignment::High,
            CoreAssignmentArg::Medium => CoreAssignment::Medium,
            CoreAssignmentArg::Low => CoreAssignment::Low,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DatatypeArg {
    Nt,
    Aa,
}

impl From<DatatypeArg> for Datatype {
    fn from(value: DatatypeArg) -> Self {
        match value {
            DatatypeArg::Nt => Datatype::Nt,
            DatatypeArg::Aa => Datatype::Aa,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CriterionArg {
    #[value(name = "AICc")]
    AICc,
    #[value(name = "AIC")]
    Aic,
    #[value(name = "BIC")]
    Bic,
}

impl From<CriterionArg> for ModelCriterion {
    fn from(value: CriterionArg) -> Self {
        match value {
            CriterionArg::AICc => ModelCriterion::AICc,
            CriterionArg::Aic => ModelCriterion::Aic,
            CriterionArg::Bic => ModelCriterion::Bic,
        }
    }
}

/// Run options. Anything given here overrides the YAML config file.
#[derive(Args, Clone, Debug, Default)]
struct RunArgs {
    /// YAML configuration file
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(short = 'a', long = "alignments-dir")]
    alignments_dir: Option<PathBuf>,
    #[arg(short = 'o', long = "output-dir")]
    output_dir: Option<PathBuf>,
    #[arg(short = 'c', long)]
    cores: Option<u32>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long = "continue")]
    do_continue: bool,
    #[arg(long)]
    dry_run: bool,
    #[arg(long, value_enum)]
    scheduler: Option<SchedulerArg>,
    #[arg(long)]
    scheduler_exe: Option<PathBuf>,
    #[arg(long)]
    raxml_binary: Option<PathBuf>,
    #[arg(long)]
    modeltest_binary: Option<PathBuf>,
    #[arg(long, value_enum)]
    core_assignment: Option<CoreAssignmentArg>,
    #[arg(short = 'd', long, value_enum)]
    datatype: Option<DatatypeArg>,
    #[arg(long)]
    msa_filter: Option<PathBuf>,
    #[arg(short = 'r', long)]
    raxml_global_parameters: Option<PathBuf>,
    #[arg(short = 'R', long, allow_hyphen_values = true)]
    raxml_global_parameters_string: Option<String>,
    #[arg(long)]
    per_msa_raxml_parameters: Option<PathBuf>,
    #[arg(short = 's', long)]
    random_starting_trees: Option<u32>,
    #[arg(short = 'p', long)]
    parsimony_starting_trees: Option<u32>,
    #[arg(short = 'b', long)]
    bootstraps: Option<u32>,
    #[arg(long = "autoMRE")]
    auto_mre: bool,
    #[arg(long)]
    bootstrap_chunk_size: Option<u32>,
    #[arg(long)]
    tbe_support: bool,
    #[arg(long)]
    constrain_search: bool,
    #[arg(long)]
    percentage_jobs_double_cores: Option<f64>,
    #[arg(short = 'm', long = "use-modeltest")]
    use_modeltest: bool,
    #[arg(long)]
    modeltest_global_parameters: Option<PathBuf>,
    #[arg(long)]
    per_msa_modeltest_parameters: Option<PathBuf>,
    #[arg(long = "modeltest-criteria", value_enum)]
    modeltest_criterion: Option<CriterionArg>,
    #[arg(long)]
    modeltest_cores: Option<u32>,
    #[arg(long, conflicts_with = "use_aster")]
    use_astral: bool,
    #[arg(long)]
    astral_jar: Option<PathBuf>,
    #[arg(long)]
    use_aster: bool,
    #[arg(long)]
    aster_bin: Option<PathBuf>,
    #[arg(long)]
    species_tree_parameters: Option<PathBuf>,
    #[arg(long)]
    job_failure_fatal: bool,
    #[arg(long)]
    retry: Option<u32>,
    #[arg(long)]
    disable_job_sorting: bool,
}

/// Result families to export; none selected means all of them.
#[derive(Args, Clone, Copy, Debug, Default)]
struct ExportArgs {
    #[arg(long)]
    best_ml_tree: bool,
    #[arg(long)]
    best_ml_model: bool,
    #[arg(long)]
    sorted_ml_trees: bool,
    #[arg(long)]
    bootstrap_trees: bool,
    #[arg(long = "support-values-tree")]
    support_trees: bool,
    #[arg(long)]
    species_tree: bool,
    #[arg(long)]
    gene_trees: bool,
}

impl From<ExportArgs> for ExportSelection {
    fn from(value: ExportArgs) -> Self {
        ExportSelection {
            best_ml_tree: value.best_ml_tree,
            best_ml_model: value.best_ml_model,
            sorted_ml_trees: value.sorted_ml_trees,
            bootstrap_trees: value.bootstrap_trees,
            support_trees: value.support_trees,
            species_tree: value.species_tree,
            gene_trees: value.gene_trees,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    Run {
        #[command(flatten)]
        run: RunArgs,
        #[arg(long)]
        json: bool,
    },
    Describe {
        #[command(flatten)]
        run: RunArgs,
        #[arg(long)]
        json: bool,
    },
    Status {
        output_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Report {
        output_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Copy the results of a finished run into a new flat directory.
    Export {
        run_dir: PathBuf,
        export_dir: PathBuf,
        #[command(flatten)]
        select: ExportArgs,
        #[arg(long)]
        json: bool,
    },
    Init {
        #[arg(long, default_value = "phylo.yaml")]
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(Some(payload)) => emit_json(&payload),
        Ok(None) => {}
        Err(err) => {
            let code = exit_code_for(&err);
            if json_mode {
                emit_json(&error_envelope(&err));
            } else {
                eprintln!("error: {:#}", err);
            }
            std::process::exit(code);
        }
    }
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn invocation_args() -> Vec<String> {
    std::env::args().collect()
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run { run, json } => {
            let config = build_config(&run)?;
            tracing::debug!(
                scheduler = config.scheduler.as_str(),
                cores = config.cores,
                "starting run"
            );
            let engine = SchedulerEngine::from_config(&config);
            let summary = phylo_runner::run_pipeline(config, &engine, &invocation_args())?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "run": serde_json::to_value(&summary)?,
                })));
            }
            print_run_summary(&summary);
        }
        Commands::Describe { run, json } => {
            let config = build_config(&run)?;
            let plan = phylo_runner::describe_run(&config)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "plan": serde_json::to_value(&plan)?,
                })));
            }
            print_plan(&plan);
        }
        Commands::Status { output_dir, json } => {
            let status = phylo_runner::run_status(&output_dir)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "status",
                    "status": serde_json::to_value(&status)?,
                })));
            }
            print_status(&status);
        }
        Commands::Report { output_dir, json } => {
            if !output_dir.is_dir() {
                return Err(anyhow!("{} is not a run output directory", output_dir.display()));
            }
            let ctx = ReportContext {
                version: phylo_runner::VERSION.to_string(),
                args: invocation_args(),
                cores: recorded_cores(&output_dir),
                error: None,
            };
            let path = phylo_runner::write_report(&output_dir, &ctx)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "report",
                    "report": path.display().to_string(),
                })));
            }
            println!("report: {}", path.display());
        }
        Commands::Export {
            run_dir,
            export_dir,
            select,
            json,
        } => {
            let log = RunLog::detached();
            let summary = phylo_runner::export_run(&run_dir, &export_dir, select.into(), &log)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "export",
                    "export": serde_json::to_value(&summary)?,
                })));
            }
            print_export_summary(&summary);
        }
        Commands::Init { path, force } => {
            if !force && path.exists() {
                return Err(anyhow!(
                    "init file already exists (use --force): {}",
                    path.display()
                ));
            }
            std::fs::write(&path, CONFIG_TEMPLATE)?;
            tracing::info!(path = %path.display(), "wrote config template");
            println!("wrote: {}", path.display());
            println!("next: fill in the fields marked REQUIRED");
            println!("next: phylo describe --config {}", path.display());
        }
    }
    Ok(None)
}

fn build_config(args: &RunArgs) -> Result<RunConfig> {
    let mut config = match &args.config {
        Some(path) => RunConfig::from_yaml_file(path)?,
        None => RunConfig::default(),
    };
    if let Some(v) = &args.alignments_dir {
        config.alignments_dir = v.clone();
    }
    if let Some(v) = &args.output_dir {
        config.output_dir = v.clone();
    }
    if let Some(v) = args.cores {
        config.cores = v;
    }
    if let Some(v) = args.seed {
        config.seed = v;
    }
    config.do_continue |= args.do_continue;
    config.dry_run |= args.dry_run;
    if let Some(v) = args.scheduler {
        config.scheduler = v.into();
    }
    if let Some(v) = &args.scheduler_exe {
        config.scheduler_exe = v.clone();
    }
    if let Some(v) = &args.raxml_binary {
        config.raxml_binary = v.clone();
    }
    if let Some(v) = &args.modeltest_binary {
        config.modeltest_binary = v.clone();
    }
    if let Some(v) = args.core_assignment {
        config.core_assignment = v.into();
    }
    if let Some(v) = args.datatype {
        config.datatype = v.into();
    }
    if args.msa_filter.is_some() {
        config.msa_filter = args.msa_filter.clone();
    }
    if args.raxml_global_parameters.is_some() {
        config.raxml_global_parameters = args.raxml_global_parameters.clone();
    }
    if args.raxml_global_parameters_string.is_some() {
        config.raxml_global_parameters_string = args.raxml_global_parameters_string.clone();
    }
    if args.per_msa_raxml_parameters.is_some() {
        config.per_msa_raxml_parameters = args.per_msa_raxml_parameters.clone();
    }
    if let Some(v) = args.random_starting_trees {
        config.random_starting_trees = v;
    }
    if let Some(v) = args.parsimony_starting_trees {
        config.parsimony_starting_trees = v;
    }
    if let Some(v) = args.bootstraps {
        config.bootstraps = v;
    }
    config.auto_mre |= args.auto_mre;
    if args.bootstrap_chunk_size.is_some() {
        config.bootstrap_chunk_size = args.bootstrap_chunk_size;
    }
    config.tbe_support |= args.tbe_support;
    config.constrain_search |= args.constrain_search;
    if let Some(v) = args.percentage_jobs_double_cores {
        config.percentage_jobs_double_cores = v;
    }
    config.use_modeltest |= args.use_modeltest;
    if args.modeltest_global_parameters.is_some() {
        config.modeltest_global_parameters = args.modeltest_global_parameters.clone();
    }
    if args.per_msa_modeltest_parameters.is_some() {
        config.per_msa_modeltest_parameters = args.per_msa_modeltest_parameters.clone();
    }
    if let Some(v) = args.modeltest_criterion {
        config.modeltest_criterion = v.into();
    }
    if let Some(v) = args.modeltest_cores {
        config.modeltest_cores = v;
    }
    if args.use_astral {
        let jar = args
            .astral_jar
            .clone()
            .ok_or_else(|| anyhow!("--use-astral requires --astral-jar"))?;
        config.species_tree = Some(SpeciesTreeTool::Astral { jar });
    } else if args.use_aster {
        let bin = args
            .aster_bin
            .clone()
            .ok_or_else(|| anyhow!("--use-aster requires --aster-bin"))?;
        config.species_tree = Some(SpeciesTreeTool::Aster { bin });
    }
    if args.species_tree_parameters.is_some() {
        config.species_tree_parameters = args.species_tree_parameters.clone();
    }
    config.job_failure_fatal |= args.job_failure_fatal;
    if let Some(v) = args.retry {
        config.retry = v;
    }
    config.disable_job_sorting |= args.disable_job_sorting;
    Ok(config)
}

fn recorded_cores(output_dir: &Path) -> Option<u32> {
    load_resolved_config(&RunPaths::new(output_dir))
        .ok()
        .map(|config| config.cores)
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<PipelineError>()
        .map(PipelineError::exit_code)
        .unwrap_or(1)
}

/// Machine-readable error code plus the fields a caller needs to act on it.
fn error_details(err: &anyhow::Error) -> (&'static str, Value) {
    let exit_code = exit_code_for(err);
    let Some(pipeline_err) = err.downcast_ref::<PipelineError>() else {
        return ("command_failed", json!({ "exit_code": exit_code }));
    };
    match pipeline_err {
        PipelineError::Config { .. } | PipelineError::Yaml(_) => {
            ("config_error", json!({ "exit_code": exit_code }))
        }
        PipelineError::EngineUnavailable { .. } => {
            ("engine_unavailable", json!({ "exit_code": exit_code }))
        }
        PipelineError::Engine { code, attempts } => (
            "engine_failed",
            json!({ "exit_code": exit_code, "engine_exit": code, "attempts": attempts }),
        ),
        PipelineError::JobFailures { phase, failed } => (
            "job_failures",
            json!({ "exit_code": exit_code, "phase": phase, "failed_jobs": failed }),
        ),
        PipelineError::AllJobsFailed { phase, total } => (
            "all_jobs_failed",
            json!({ "exit_code": exit_code, "phase": phase, "total_jobs": total }),
        ),
        PipelineError::AllDatasetsInvalid { phase } => (
            "all_datasets_invalid",
            json!({ "exit_code": exit_code, "phase": phase }),
        ),
        PipelineError::Tool { tool, .. } => (
            "tool_failed",
            json!({ "exit_code": exit_code, "tool": tool }),
        ),
        PipelineError::Json(_) => ("invalid_json", json!({ "exit_code": exit_code })),
        PipelineError::Io { path, .. } => (
            "io_error",
            json!({ "exit_code": exit_code, "path": path.display().to_string() }),
        ),
    }
}

fn error_envelope(err: &anyhow::Error) -> Value {
    let (code, details) = error_details(err);
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": format!("{:#}", err),
            "details": details
        }
    })
}

fn emit_json(value: &Value) {
    let line = serde_json::to_string(value).unwrap_or_else(|e| {
        format!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":{:?},\"details\":{{}}}}}}",
            e.to_string()
        )
    });
    println!("{}", line);
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Status { json, .. }
        | Commands::Report { json, .. }
        | Commands::Export { json, .. } => *json,
        Commands::Init { .. } => false,
    }
}

fn print_run_summary(summary: &RunSummary) {
    println!("output_dir: {}", summary.output_dir.display());
    println!("checkpoint: {}", summary.checkpoint);
    println!(
        "datasets: {} ({} valid)",
        summary.datasets, summary.valid_datasets
    );
    println!("failed_jobs: {}", summary.failed_jobs);
    if let Some(cores) = summary.recommended_max_cores {
        println!("recommended_max_cores: {}", cores);
    }
    if let Some(tree) = &summary.species_tree {
        println!("species_tree: {}", tree.display());
    }
    if summary.dry_run {
        println!("dry_run: stopped after parse");
    }
}

fn print_export_summary(summary: &ExportSummary) {
    println!("export_dir: {}", summary.export_dir.display());
    println!("datasets: {}", summary.families.len());
    println!("exported: {} file(s)", summary.exported.len());
    for path in &summary.missing {
        println!("missing: {}", path.display());
    }
}

fn print_plan(plan: &RunPlan) {
    println!("alignments: {}", plan.alignments_dir.display());
    println!(
        "output: {}{}",
        plan.output_dir.display(),
        if plan.output_exists { " (exists)" } else { "" }
    );
    println!("datasets: {}", plan.datasets.len());
    for name in &plan.datasets {
        println!("  {}", name);
    }
    println!("cores: {} ({} scheduler)", plan.cores, plan.scheduler);
    println!(
        "search: {} starting tree(s), {} bootstrap(s) in {} job(s) per dataset",
        plan.starting_trees, plan.bootstraps, plan.bootstrap_jobs_per_dataset
    );
    println!("phases:");
    for phase in &plan.phases {
        println!(
            "  {} {:<18} {}",
            phase.index,
            phase.name,
            if phase.requested { "run" } else { "skip" }
        );
    }
    for w in &plan.warnings {
        println!("warning: {}", w);
    }
}

fn print_status(status: &RunStatus) {
    println!("output_dir: {}", status.output_dir.display());
    println!("checkpoint: {}", status.checkpoint);
    println!("completed: {}", status.completed.join(", "));
    println!("pending: {}", status.pending.join(", "));
    if let (Some(total), Some(valid)) = (status.datasets, status.valid_datasets) {
        println!("datasets: {} ({} valid)", total, valid);
    }
    println!("failed_jobs: {}", status.failed_jobs);
    if status.has_report {
        println!("report: present");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flags_override_yaml_defaults() {
        let cli = Cli::try_parse_from([
            "phylo",
            "run",
            "-a",
            "/data/msas",
            "-o",
            "/data/out",
            "-c",
            "16",
            "-b",
            "100",
            "--autoMRE",
            "--scheduler",
            "fork",
            "--modeltest-criteria",
            "BIC",
            "-R",
            "--model LG+G",
            "-r",
            "/data/raxml_params.txt",
            "--use-aster",
            "--aster-bin",
            "/opt/astral",
        ])
        .expect("parse");
        let Commands::Run { run, json } = cli.command else {
            panic!("expected run");
        };
        assert!(!json);
        let config = build_config(&run).expect("config");
        assert_eq!(config.cores, 16);
        assert_eq!(config.bootstraps, 100);
        assert!(config.auto_mre);
        assert_eq!(config.scheduler, SchedulerMode::Fork);
        assert_eq!(config.modeltest_criterion, ModelCriterion::Bic);
        assert_eq!(
            config.raxml_global_parameters_string.as_deref(),
            Some("--model LG+G")
        );
        assert_eq!(
            config.raxml_global_parameters,
            Some(PathBuf::from("/data/raxml_params.txt"))
        );
        assert_eq!(
            config.species_tree,
            Some(SpeciesTreeTool::Aster {
                bin: PathBuf::from("/opt/astral")
            })
        );
    }

    #[test]
    fn astral_requires_its_jar() {
        let args = RunArgs {
            use_astral: true,
            ..RunArgs::default()
        };
        assert!(build_config(&args).is_err());
    }

    #[test]
    fn exit_codes_come_from_pipeline_errors() {
        let err = anyhow::Error::new(PipelineError::AllJobsFailed {
            phase: "parse".to_string(),
            total: 3,
        });
        assert_eq!(exit_code_for(&err), 243);
        let envelope = error_envelope(&err);
        assert_eq!(envelope["ok"], false);
        assert_eq!(envelope["error"]["code"], "all_jobs_failed");
        assert_eq!(envelope["error"]["details"]["exit_code"], 243);
        assert_eq!(envelope["error"]["details"]["phase"], "parse");
        assert_eq!(envelope["error"]["details"]["total_jobs"], 3);
        assert_eq!(exit_code_for(&anyhow!("plain")), 1);
        assert_eq!(error_envelope(&anyhow!("plain"))["error"]["code"], "command_failed");
    }

    #[test]
    fn export_flags_select_result_families() {
        let cli = Cli::try_parse_from([
            "phylo",
            "export",
            "/runs/a",
            "/exports/a",
            "--best-ml-tree",
            "--support-values-tree",
            "--json",
        ])
        .expect("parse");
        assert!(command_json_mode(&cli.command));
        let Commands::Export { select, .. } = cli.command else {
            panic!("expected export");
        };
        let selection = ExportSelection::from(select);
        assert!(selection.best_ml_tree);
        assert!(selection.support_trees);
        assert!(!selection.bootstrap_trees);
        assert!(ExportSelection::from(ExportArgs::default()).is_empty());
    }
}
