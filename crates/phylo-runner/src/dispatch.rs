//! Drives the external execution engine, one invocation per phase batch.

use crate::config::{RunConfig, SchedulerMode};
use crate::log::RunLog;
use phylo_core::{
    append_lines, ensure_dir, incremental_path, read_tool_log, JobBatch, PipelineError, Result,
    ENGINE_JOBS_FAILED_CODE,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Per-phase failure list the engine writes into its output directory.
pub const ENGINE_FAILURE_FILE: &str = "failed_commands.txt";
const THREADS_ARG: &str = "--threads";

#[derive(Debug, Clone)]
pub struct EngineInvocation {
    pub phase: String,
    pub library: PathBuf,
    pub batch_file: PathBuf,
    pub output_dir: PathBuf,
    pub cores: u32,
    pub job_failure_fatal: bool,
}

/// The external batch-parallel job runner.
pub trait ExecutionEngine: Send + Sync {
    /// Fail early when the engine or the target executable cannot run at all.
    fn preflight(&self, invocation: &EngineInvocation) -> Result<()>;

    /// Run the whole batch once and return the engine's exit status.
    fn invoke(&self, invocation: &EngineInvocation) -> Result<i32>;
}

/// Runs the MPI/OpenMP/fork scheduler executable.
#[derive(Debug, Clone)]
pub struct SchedulerEngine {
    pub mode: SchedulerMode,
    pub exe: PathBuf,
}

impl SchedulerEngine {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            mode: config.scheduler,
            exe: config.scheduler_exe.clone(),
        }
    }

    /// Program, arguments and extra environment for one invocation.
    pub fn command_line(&self, inv: &EngineInvocation) -> (Vec<String>, Vec<(String, String)>) {
        let mut argv = Vec::new();
        let mut env = Vec::new();
        let ranks = inv.cores.to_string();
        if self.mode.uses_mpiexec() {
            argv.extend(["mpiexec".to_string(), "-n".to_string(), ranks.clone()]);
        }
        if self.mode == SchedulerMode::Openmp {
            env.push((
                "OMP_NUM_THREADS".to_string(),
                format!("{},{},{}", ranks, ranks, ranks),
            ));
            env.push(("OMP_DYNAMIC".to_string(), "false".to_string()));
        }
        argv.push(self.exe.display().to_string());
        argv.push(format!("--{}-scheduler", self.mode.as_str()));
        argv.push(ranks);
        argv.push(inv.library.display().to_string());
        argv.push(inv.batch_file.display().to_string());
        argv.push(inv.output_dir.display().to_string());
        if inv.job_failure_fatal {
            argv.push("--jobs-failure-fatal".to_string());
        }
        if self.mode == SchedulerMode::Fork {
            argv.push("--threads-arg".to_string());
            argv.push(THREADS_ARG.to_string());
        }
        (argv, env)
    }
}

fn mpiexec_available() -> bool {
    Command::new("mpiexec")
        .arg("--help")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

impl ExecutionEngine for SchedulerEngine {
    fn preflight(&self, inv: &EngineInvocation) -> Result<()> {
        if !inv.library.is_file() {
            return Err(PipelineError::engine_unavailable(format!(
                "the binary {} does not exist, please check your installation",
                inv.library.display()
            )));
        }
        if !inv.batch_file.is_file() {
            return Err(PipelineError::engine_unavailable(format!(
                "batch file {} is missing",
                inv.batch_file.display()
            )));
        }
        if self.mode.uses_mpiexec() && !mpiexec_available() {
            return Err(PipelineError::engine_unavailable("cannot run mpiexec"));
        }
        Ok(())
    }

    fn invoke(&self, inv: &EngineInvocation) -> Result<i32> {
        let (argv, env) = self.command_line(inv);
        let logs = incremental_path(&inv.output_dir, "logs", "txt");
        let out = fs::File::create(&logs).map_err(|e| PipelineError::io(&logs, e))?;
        let err = out.try_clone().map_err(|e| PipelineError::io(&logs, e))?;
        tracing::info!(phase = %inv.phase, logs = %logs.display(), "calling scheduler: {}", argv.join(" "));
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]).stdout(out).stderr(err);
        for (k, v) in env {
            cmd.env(k, v);
        }
        let status = cmd.status().map_err(|e| {
            PipelineError::engine_unavailable(format!("cannot start {}: {}", argv[0], e))
        })?;
        // Killed by a signal: no code, treat as an unrecognized failure.
        Ok(status.code().unwrap_or(-1))
    }
}

/// Run-wide list of failed job names, mirrored to `failed_commands.txt`.
#[derive(Debug)]
pub struct FailureLedger {
    path: PathBuf,
    entries: Vec<String>,
}

impl FailureLedger {
    /// Open the ledger, picking up entries left by earlier attempts of the run.
    pub fn open(path: &Path) -> Result<Self> {
        let entries = match fs::read_to_string(path) {
            Ok(text) => text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(PipelineError::io(path, e)),
        };
        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    pub fn record(&mut self, failed: &[String]) -> Result<()> {
        append_lines(&self.path, failed)?;
        self.entries.extend(failed.iter().cloned());
        Ok(())
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub total_jobs: usize,
    pub failed: Vec<String>,
    pub attempts: u32,
}

pub fn read_engine_failures(output_dir: &Path) -> Result<Vec<String>> {
    match read_tool_log(&output_dir.join(ENGINE_FAILURE_FILE))? {
        Ok(text) => Ok(text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|l| l.split_whitespace().next().unwrap_or(l).to_string())
            .collect()),
        Err(_) => Ok(Vec::new()),
    }
}

pub struct Dispatcher<'a> {
    engine: &'a dyn ExecutionEngine,
    log: &'a RunLog,
    retry: u32,
    job_failure_fatal: bool,
    cores: u32,
    ledger: FailureLedger,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        engine: &'a dyn ExecutionEngine,
        config: &RunConfig,
        ledger: FailureLedger,
        log: &'a RunLog,
    ) -> Self {
        Self {
            engine,
            log,
            retry: config.retry,
            job_failure_fatal: config.job_failure_fatal,
            cores: config.cores,
            ledger,
        }
    }

    pub fn ledger(&self) -> &FailureLedger {
        &self.ledger
    }

    fn print_help_in_error(&self, output_dir: &Path) {
        self.log.error(format!(
            "you might need to check individual runs in {}, in particular the per-job logs and the results folder",
            output_dir.display()
        ));
    }

    /// Write `batch` as `<run_dir>/<stem>_command.txt` and run it through the
    /// engine. Partial failures are recorded and tolerated unless job failures
    /// are fatal; a batch where every job failed always aborts.
    pub fn dispatch(
        &mut self,
        phase: &str,
        stem: &str,
        batch: &JobBatch,
        run_dir: &Path,
        library: &Path,
    ) -> Result<DispatchOutcome> {
        ensure_dir(run_dir)?;
        let batch_file = run_dir.join(format!("{}_command.txt", stem));
        batch.write_to(&batch_file)?;
        if batch.is_empty() {
            self.log
                .info(format!("{}: nothing to schedule, skipping the engine", phase));
            return Ok(DispatchOutcome::default());
        }
        let stale = run_dir.join(ENGINE_FAILURE_FILE);
        if stale.exists() {
            fs::remove_file(&stale).map_err(|e| PipelineError::io(&stale, e))?;
        }
        let invocation = EngineInvocation {
            phase: phase.to_string(),
            library: library.to_path_buf(),
            batch_file,
            output_dir: run_dir.to_path_buf(),
            cores: self.cores,
            job_failure_fatal: self.job_failure_fatal,
        };
        self.engine.preflight(&invocation)?;
        self.log.info(format!(
            "{}: scheduling {} job(s) on {} core(s)",
            phase,
            batch.len(),
            self.cores
        ));

        let mut attempts = 0u32;
        let code = loop {
            attempts += 1;
            let failure = match self.engine.invoke(&invocation) {
                Ok(code) if code == 0 || code == ENGINE_JOBS_FAILED_CODE => break code,
                Ok(code) => PipelineError::Engine { code, attempts },
                Err(e @ PipelineError::EngineUnavailable { .. }) => e,
                Err(e) => return Err(e),
            };
            self.log.error(format!("{}: engine execution failed: {}", phase, failure));
            if attempts > self.retry {
                self.print_help_in_error(run_dir);
                return Err(failure);
            }
            self.log
                .warn(format!("retry {}/{}...", attempts, self.retry));
        };

        let failed = read_engine_failures(run_dir)?;
        self.ledger.record(&failed)?;
        let outcome = DispatchOutcome {
            total_jobs: batch.len(),
            failed,
            attempts,
        };
        if outcome.failed.len() >= outcome.total_jobs {
            self.log.error(format!("{}: all scheduled commands failed", phase));
            self.print_help_in_error(run_dir);
            return Err(PipelineError::AllJobsFailed {
                phase: phase.to_string(),
                total: outcome.total_jobs,
            });
        }
        let engine_reported = code == ENGINE_JOBS_FAILED_CODE;
        if self.job_failure_fatal && (engine_reported || !outcome.failed.is_empty()) {
            self.log.error(
                "at least one job failed and job failures are fatal; to continue when a job fails, do not set job_failure_fatal",
            );
            self.print_help_in_error(run_dir);
            return Err(PipelineError::JobFailures {
                phase: phase.to_string(),
                failed: outcome.failed.len().max(1),
            });
        }
        if !outcome.failed.is_empty() {
            self.log.warn(format!(
                "{}: {}/{} commands failed",
                phase,
                outcome.failed.len(),
                outcome.total_jobs
            ));
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phylo_core::{scratch_dir, JobDescriptor};
    use std::sync::Mutex;

    /// Replays a scripted list of exit codes and failure lists.
    struct ScriptedEngine {
        script: Mutex<Vec<(i32, Vec<&'static str>)>>,
        calls: Mutex<u32>,
    }

    impl ScriptedEngine {
        fn new(script: Vec<(i32, Vec<&'static str>)>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().expect("lock")
        }
    }

    impl ExecutionEngine for ScriptedEngine {
        fn preflight(&self, _invocation: &EngineInvocation) -> Result<()> {
            Ok(())
        }

        fn invoke(&self, inv: &EngineInvocation) -> Result<i32> {
            *self.calls.lock().expect("lock") += 1;
            let (code, failed) = self.script.lock().expect("lock").remove(0);
            if !failed.is_empty() {
                let mut text = failed.join("\n");
                text.push('\n');
                fs::write(inv.output_dir.join(ENGINE_FAILURE_FILE), text).expect("failures");
            }
            Ok(code)
        }
    }

    fn batch(n: usize) -> JobBatch {
        let mut b = JobBatch::new();
        for i in 0..n {
            b.push(JobDescriptor::new(format!("job_{}", i), 1, 1, "--x"))
                .expect("push");
        }
        b
    }

    fn config(retry: u32, fatal: bool) -> RunConfig {
        RunConfig {
            cores: 4,
            retry,
            job_failure_fatal: fatal,
            ..RunConfig::default()
        }
    }

    #[test]
    fn partial_failures_are_tolerated_and_ledgered() {
        let root = scratch_dir("dispatch_partial");
        let engine = ScriptedEngine::new(vec![(ENGINE_JOBS_FAILED_CODE, vec!["job_1"])]);
        let log = RunLog::detached();
        let ledger = FailureLedger::open(&root.join("failed_commands.txt")).expect("ledger");
        let mut d = Dispatcher::new(&engine, &config(0, false), ledger, &log);
        let out = d
            .dispatch("ml-search", "mlsearch", &batch(3), &root.join("run"), Path::new("raxml"))
            .expect("tolerated");
        assert_eq!(out.failed, vec!["job_1".to_string()]);
        assert_eq!(out.total_jobs, 3);
        assert_eq!(d.ledger().entries(), &["job_1".to_string()]);
        assert!(root.join("run/mlsearch_command.txt").is_file());
        let ledger_text = fs::read_to_string(root.join("failed_commands.txt")).expect("ledger");
        assert_eq!(ledger_text, "job_1\n");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn total_failure_is_fatal_even_when_tolerated() {
        let root = scratch_dir("dispatch_total");
        let engine = ScriptedEngine::new(vec![(
            ENGINE_JOBS_FAILED_CODE,
            vec!["job_0", "job_1"],
        )]);
        let log = RunLog::detached();
        let ledger = FailureLedger::open(&root.join("failed_commands.txt")).expect("ledger");
        let mut d = Dispatcher::new(&engine, &config(3, false), ledger, &log);
        let err = d
            .dispatch("parse", "parse", &batch(2), &root.join("run"), Path::new("raxml"))
            .expect_err("all failed");
        assert!(matches!(err, PipelineError::AllJobsFailed { total: 2, .. }));
        assert_eq!(engine.calls(), 1);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn job_failures_abort_when_fatal() {
        let root = scratch_dir("dispatch_fatal");
        let engine = ScriptedEngine::new(vec![(ENGINE_JOBS_FAILED_CODE, vec!["job_0"])]);
        let log = RunLog::detached();
        let ledger = FailureLedger::open(&root.join("failed_commands.txt")).expect("ledger");
        let mut d = Dispatcher::new(&engine, &config(0, true), ledger, &log);
        let err = d
            .dispatch("parse", "parse", &batch(4), &root.join("run"), Path::new("raxml"))
            .expect_err("fatal");
        assert!(matches!(err, PipelineError::JobFailures { failed: 1, .. }));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn engine_errors_are_retried_then_fatal() {
        let root = scratch_dir("dispatch_retry");
        let engine = ScriptedEngine::new(vec![(1, vec![]), (0, vec![])]);
        let log = RunLog::detached();
        let ledger = FailureLedger::open(&root.join("failed_commands.txt")).expect("ledger");
        let mut d = Dispatcher::new(&engine, &config(1, false), ledger, &log);
        let out = d
            .dispatch("parse", "parse", &batch(2), &root.join("run"), Path::new("raxml"))
            .expect("second attempt succeeds");
        assert_eq!(out.attempts, 2);

        let engine = ScriptedEngine::new(vec![(9, vec![]), (9, vec![])]);
        let ledger = FailureLedger::open(&root.join("failed_commands.txt")).expect("ledger");
        let mut d = Dispatcher::new(&engine, &config(1, false), ledger, &log);
        let err = d
            .dispatch("parse", "parse", &batch(2), &root.join("run"), Path::new("raxml"))
            .expect_err("exhausted");
        assert!(matches!(err, PipelineError::Engine { code: 9, attempts: 2 }));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn empty_batch_skips_engine() {
        let root = scratch_dir("dispatch_empty");
        let engine = ScriptedEngine::new(vec![]);
        let log = RunLog::detached();
        let ledger = FailureLedger::open(&root.join("failed_commands.txt")).expect("ledger");
        let mut d = Dispatcher::new(&engine, &config(0, false), ledger, &log);
        let out = d
            .dispatch("support-compute", "supports", &JobBatch::new(), &root.join("run"), Path::new("raxml"))
            .expect("empty");
        assert_eq!(out.total_jobs, 0);
        assert_eq!(engine.calls(), 0);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn scheduler_command_line_per_mode() {
        let inv = EngineInvocation {
            phase: "parse".to_string(),
            library: PathBuf::from("/bin/raxml-ng"),
            batch_file: PathBuf::from("/out/parse_run/parse_command.txt"),
            output_dir: PathBuf::from("/out/parse_run"),
            cores: 8,
            job_failure_fatal: true,
        };
        let split = SchedulerEngine {
            mode: SchedulerMode::Split,
            exe: PathBuf::from("/bin/mpi-scheduler"),
        };
        let (argv, env) = split.command_line(&inv);
        assert_eq!(
            argv,
            vec![
                "mpiexec",
                "-n",
                "8",
                "/bin/mpi-scheduler",
                "--split-scheduler",
                "8",
                "/bin/raxml-ng",
                "/out/parse_run/parse_command.txt",
                "/out/parse_run",
                "--jobs-failure-fatal",
            ]
        );
        assert!(env.is_empty());

        let fork = SchedulerEngine {
            mode: SchedulerMode::Fork,
            exe: PathBuf::from("/bin/mpi-scheduler"),
        };
        let (argv, _) = fork.command_line(&inv);
        assert_eq!(argv[0], "/bin/mpi-scheduler");
        assert_eq!(&argv[argv.len() - 2..], &["--threads-arg", "--threads"]);

        let omp = SchedulerEngine {
            mode: SchedulerMode::Openmp,
            exe: PathBuf::from("/bin/mpi-scheduler"),
        };
        let (argv, env) = omp.command_line(&inv);
        assert_eq!(argv[1], "--openmp-scheduler");
        assert!(env.contains(&("OMP_NUM_THREADS".to_string(), "8,8,8".to_string())));
    }
}
