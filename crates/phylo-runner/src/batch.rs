//! Expands dataset-level requirements into one job batch per phase.

use crate::config::{RunConfig, RunPaths};
use phylo_core::{ensure_dir, Dataset, JobBatch, JobDescriptor, Result, ToolArgs};
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Parsimony starting trees used to build the strict consensus constraint.
pub const CONSTRAINT_PARSIMONY_TREES: u32 = 100;

fn path_arg(p: &Path) -> String {
    p.display().to_string()
}

fn finish(mut args: ToolArgs, config: &RunConfig) -> String {
    if config.scheduler.pins_single_thread() {
        args.push_opt("--threads", "1");
    }
    args.render()
}

/// Valid datasets, costliest first. Ties keep name order.
pub fn ordered_by<'a>(
    datasets: &'a BTreeMap<String, Dataset>,
    weight: impl Fn(&Dataset) -> u64,
) -> Vec<&'a Dataset> {
    let mut out: Vec<&Dataset> = datasets.values().filter(|d| d.valid).collect();
    out.sort_by_key(|d| Reverse(weight(d)));
    out
}

pub fn compile_parse(
    datasets: &BTreeMap<String, Dataset>,
    results_dir: &Path,
    config: &RunConfig,
) -> Result<JobBatch> {
    let mut batch = JobBatch::new();
    for d in ordered_by(datasets, |_| 1) {
        let out_dir = results_dir.join(&d.name);
        ensure_dir(&out_dir)?;
        let mut args = ToolArgs::new();
        args.push_flag("--parse");
        args.push_opt("--log", "DEBUG");
        args.push_opt("--msa", path_arg(&d.path));
        args.extend(&d.raxml_args);
        args.push_opt("--prefix", path_arg(&out_dir.join(&d.name)));
        batch.push(JobDescriptor::new(
            format!("parse_{}", d.name),
            1,
            1,
            finish(args, config),
        ))?;
    }
    Ok(batch)
}

fn modeltest_weight(d: &Dataset) -> u64 {
    if d.disable_sorting {
        1
    } else {
        (d.taxa * d.patterns).max(1)
    }
}

pub fn compile_modeltest(
    datasets: &BTreeMap<String, Dataset>,
    results_dir: &Path,
    config: &RunConfig,
) -> Result<JobBatch> {
    let mut batch = JobBatch::new();
    for d in ordered_by(datasets, modeltest_weight) {
        let out_dir = results_dir.join(&d.name);
        ensure_dir(&out_dir)?;
        let mut args = ToolArgs::new();
        args.push_opt("-i", path_arg(&d.path));
        args.push_opt("-t", "mp");
        args.push_opt("-o", path_arg(&out_dir.join(&d.name)));
        args.extend(&d.modeltest_args);
        batch.push(JobDescriptor::new(
            format!("modeltest_{}", d.name),
            config.modeltest_cores,
            modeltest_weight(d),
            args.render(),
        ))?;
    }
    Ok(batch)
}

/// Bootstrap trees per job.
pub fn bootstrap_chunk_size(config: &RunConfig, valid_datasets: usize) -> u32 {
    if let Some(explicit) = config.bootstrap_chunk_size {
        return explicit.max(1);
    }
    let total = u64::from(config.bootstraps) * valid_datasets as u64;
    if total > config.coarse_chunk_threshold {
        config.coarse_bootstrap_chunk.max(1)
    } else {
        1
    }
}

pub fn bootstrap_jobs_per_dataset(config: &RunConfig, chunk: u32) -> u32 {
    if config.bootstraps == 0 {
        0
    } else if config.auto_mre {
        1
    } else {
        (config.bootstraps + chunk - 1) / chunk
    }
}

/// Output prefix of one ml-search replicate. Replicates only get their own
/// subdirectory when there is more than one of them.
pub fn mlsearch_prefix(paths: &RunPaths, config: &RunConfig, name: &str, replicate: u32) -> PathBuf {
    let dataset_dir = paths.mlsearch_results().join(name);
    if config.starting_trees() > 1 {
        dataset_dir
            .join("multiple_runs")
            .join(replicate.to_string())
            .join(name)
    } else {
        dataset_dir.join(name)
    }
}

pub fn constraint_tree_path(paths: &RunPaths, name: &str) -> PathBuf {
    paths
        .constrain_run()
        .join("consensus")
        .join("results")
        .join(format!("{}.raxml.consensusTreeSTRICT", name))
}

pub fn compile_mlsearch(
    datasets: &BTreeMap<String, Dataset>,
    paths: &RunPaths,
    config: &RunConfig,
) -> Result<JobBatch> {
    let valid = datasets.values().filter(|d| d.valid).count();
    let chunk = bootstrap_chunk_size(config, valid);
    let bs_jobs = bootstrap_jobs_per_dataset(config, chunk);
    let starting_trees = config.starting_trees();
    let mut batch = JobBatch::new();
    for d in ordered_by(datasets, Dataset::weight) {
        let msa = path_arg(d.alignment_input());
        for replicate in 0..starting_trees {
            let prefix = mlsearch_prefix(paths, config, &d.name, replicate);
            if let Some(parent) = prefix.parent() {
                ensure_dir(parent)?;
            }
            let mut args = ToolArgs::new();
            args.push_opt("--msa", msa.clone());
            args.extend(&d.raxml_args);
            args.push_opt("--prefix", path_arg(&prefix));
            let start = if replicate >= config.random_starting_trees {
                "pars{1}"
            } else {
                "rand{1}"
            };
            args.push_opt("--tree", start);
            if config.constrain_search {
                args.push_opt(
                    "--tree-constraint",
                    path_arg(&constraint_tree_path(paths, &d.name)),
                );
                args.push_flag("--force");
            }
            args.push_opt(
                "--seed",
                (u64::from(replicate) + config.seed + 1).to_string(),
            );
            batch.push(JobDescriptor::new(
                format!("mlsearch_{}_{}", d.name, replicate),
                d.cores,
                d.weight(),
                finish(args, config),
            ))?;
        }
        if bs_jobs == 0 {
            continue;
        }
        let bs_dir = paths.mlsearch_bootstraps().join(&d.name);
        ensure_dir(&bs_dir)?;
        for chunk_index in 0..bs_jobs {
            let job_name = format!("mlsearch_{}_bs{}", d.name, chunk_index);
            let mut args = ToolArgs::new();
            args.push_flag("--bootstrap");
            args.push_opt("--msa", msa.clone());
            args.extend(&d.raxml_args);
            args.push_opt("--prefix", path_arg(&bs_dir.join(&job_name)));
            args.push_opt(
                "--seed",
                (u64::from(chunk_index) + config.seed + 1).to_string(),
            );
            let trees = if config.auto_mre {
                format!("autoMRE{{{}}}", config.bootstraps)
            } else {
                let done = chunk_index * chunk;
                chunk.min(config.bootstraps - done).to_string()
            };
            args.push_opt("--bs-trees", trees);
            batch.push(JobDescriptor::new(
                job_name,
                (d.cores / 2).max(1),
                d.weight() * u64::from(chunk),
                finish(args, config),
            ))?;
        }
    }
    Ok(batch)
}

/// Parsimony starting trees, first half of the constraint computation.
pub fn compile_constraint_parsimony(
    datasets: &BTreeMap<String, Dataset>,
    results_dir: &Path,
    config: &RunConfig,
) -> Result<JobBatch> {
    ensure_dir(results_dir)?;
    let mut batch = JobBatch::new();
    for d in ordered_by(datasets, |_| 1) {
        let mut args = ToolArgs::new();
        args.push_opt("--msa", path_arg(d.alignment_input()));
        args.extend(&d.raxml_args);
        args.push_opt("--prefix", path_arg(&results_dir.join(&d.name)));
        args.push_opt("--tree", format!("pars{{{}}}", CONSTRAINT_PARSIMONY_TREES));
        args.push_flag("--start");
        batch.push(JobDescriptor::new(
            format!("parsi_{}", d.name),
            1,
            1,
            finish(args, config),
        ))?;
    }
    Ok(batch)
}

/// Strict consensus of the parsimony trees, used as the search constraint.
pub fn compile_constraint_consensus(
    datasets: &BTreeMap<String, Dataset>,
    parsimony_results: &Path,
    results_dir: &Path,
    config: &RunConfig,
) -> Result<JobBatch> {
    ensure_dir(results_dir)?;
    let mut batch = JobBatch::new();
    for d in ordered_by(datasets, |_| 1) {
        let trees = parsimony_results.join(format!("{}.raxml.startTree", d.name));
        let mut args = ToolArgs::new();
        args.push_opt("--prefix", path_arg(&results_dir.join(&d.name)));
        args.push_opt("--tree", path_arg(&trees));
        args.push_opt("--consense", "STRICT");
        args.extend(&d.raxml_args);
        batch.push(JobDescriptor::new(
            format!("consensus_{}", d.name),
            1,
            1,
            finish(args, config),
        ))?;
    }
    Ok(batch)
}

pub fn best_tree_path(paths: &RunPaths, name: &str) -> PathBuf {
    paths
        .mlsearch_results()
        .join(name)
        .join(format!("{}.raxml.bestTree", name))
}

fn non_empty_file(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.is_file() && m.len() > 0).unwrap_or(false)
}

/// Support jobs for datasets that have both an ML tree and bootstrap trees.
/// Datasets missing either are skipped silently.
pub fn compile_supports(
    datasets: &BTreeMap<String, Dataset>,
    paths: &RunPaths,
    config: &RunConfig,
) -> Result<JobBatch> {
    let results = paths.supports_run().join("results");
    ensure_dir(&results)?;
    let metrics: &[Option<&str>] = if config.tbe_support {
        &[None, Some("tbe")]
    } else {
        &[None]
    };
    let mut batch = JobBatch::new();
    for d in ordered_by(datasets, |_| 1) {
        let bs_trees = paths.concatenated_bootstrap(&d.name);
        let best_tree = best_tree_path(paths, &d.name);
        if !non_empty_file(&bs_trees) || !non_empty_file(&best_tree) {
            continue;
        }
        for metric in metrics {
            let mut prefix = format!("{}.support", d.name);
            let mut name = format!("support_{}", d.name);
            let mut args = ToolArgs::new();
            args.push_flag("--support");
            args.push_opt("--tree", path_arg(&best_tree));
            args.push_opt("--bs-trees", path_arg(&bs_trees));
            if let Some(m) = metric {
                args.push_opt("--bs-metric", *m);
                prefix = format!("{}.{}", prefix, m);
                name = format!("{}_{}", name, m);
            }
            args.extend(&d.raxml_args);
            args.push_opt("--prefix", path_arg(&results.join(prefix)));
            batch.push(JobDescriptor::new(name, 1, 1, finish(args, config)))?;
        }
    }
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerMode;
    use phylo_core::scratch_dir;

    fn dataset(name: &str, taxa: u64, cores: u32) -> Dataset {
        let mut d = Dataset::new(name, format!("/msas/{}.fasta", name));
        d.taxa = taxa;
        d.patterns = 50;
        d.unit_size = 10;
        d.cores = cores;
        d.raxml_args = ToolArgs::parse("--model GTR+G");
        d
    }

    fn fixture() -> (BTreeMap<String, Dataset>, RunConfig, PathBuf) {
        let root = scratch_dir("batch");
        let mut ds = BTreeMap::new();
        ds.insert("small".to_string(), dataset("small", 5, 1));
        ds.insert("big".to_string(), dataset("big", 80, 6));
        let mut bad = dataset("bad", 0, 0);
        bad.valid = false;
        ds.insert("bad".to_string(), bad);
        let config = RunConfig {
            output_dir: root.clone(),
            cores: 8,
            ..RunConfig::default()
        };
        (ds, config, root)
    }

    #[test]
    fn parse_jobs_are_single_core_and_pin_threads() {
        let (ds, config, root) = fixture();
        let batch = compile_parse(&ds, &root.join("parse_run/results"), &config).expect("batch");
        assert_eq!(batch.len(), 2);
        let line = batch.jobs()[0].to_line();
        assert!(line.starts_with("parse_big 1 1 --parse --log DEBUG --msa /msas/big.fasta --model GTR+G --prefix "));
        assert!(line.ends_with("--threads 1"));
        assert!(root.join("parse_run/results/small").is_dir());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn modeltest_weight_is_taxa_times_patterns() {
        let (ds, mut config, root) = fixture();
        config.modeltest_cores = 8;
        let batch = compile_modeltest(&ds, &root.join("mt"), &config).expect("batch");
        let first = &batch.jobs()[0];
        assert_eq!(first.name, "modeltest_big");
        assert_eq!(first.cores, 8);
        assert_eq!(first.weight, 80 * 50);
        assert!(first.args.contains("-t mp"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn mlsearch_line_count_matches_replicates_plus_chunks() {
        let (ds, mut config, root) = fixture();
        config.random_starting_trees = 2;
        config.parsimony_starting_trees = 1;
        config.bootstraps = 5;
        config.bootstrap_chunk_size = Some(2);
        let paths = config.paths();
        let batch = compile_mlsearch(&ds, &paths, &config).expect("batch");
        // 2 valid datasets x (3 replicates + ceil(5 / 2) chunks)
        assert_eq!(batch.len(), 2 * (3 + 3));
        let names: Vec<&str> = batch.jobs().iter().map(|j| j.name.as_str()).collect();
        assert_eq!(&names[..6], &[
            "mlsearch_big_0",
            "mlsearch_big_1",
            "mlsearch_big_2",
            "mlsearch_big_bs0",
            "mlsearch_big_bs1",
            "mlsearch_big_bs2",
        ]);
        let jobs = batch.jobs();
        assert!(jobs[0].args.contains("--tree rand{1}"));
        assert!(jobs[0].args.contains("--seed 1"));
        assert!(jobs[2].args.contains("--tree pars{1}"));
        assert!(jobs[2].args.contains("multiple_runs/2/big"));
        assert_eq!(jobs[3].cores, 3);
        assert_eq!(jobs[3].weight, 800 * 2);
        assert!(jobs[3].args.contains("--bs-trees 2"));
        assert!(jobs[5].args.contains("--bs-trees 1"));
        let small_bs = jobs.iter().find(|j| j.name == "mlsearch_small_bs0").expect("bs");
        assert_eq!(small_bs.cores, 1);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn single_replicate_writes_to_dataset_dir_and_fork_mode_skips_threads() {
        let (ds, mut config, root) = fixture();
        config.scheduler = SchedulerMode::Fork;
        config.seed = 41;
        let paths = config.paths();
        let batch = compile_mlsearch(&ds, &paths, &config).expect("batch");
        assert_eq!(batch.len(), 2);
        let job = &batch.jobs()[0];
        assert!(!job.args.contains("--threads"));
        assert!(!job.args.contains("multiple_runs"));
        assert!(job.args.contains("--seed 42"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn chunk_size_turns_coarse_above_threshold() {
        let mut config = RunConfig {
            bootstraps: 100,
            ..RunConfig::default()
        };
        assert_eq!(bootstrap_chunk_size(&config, 50), 1);
        assert_eq!(bootstrap_chunk_size(&config, 51), 2);
        config.auto_mre = true;
        assert_eq!(bootstrap_jobs_per_dataset(&config, 2), 1);
        config.auto_mre = false;
        assert_eq!(bootstrap_jobs_per_dataset(&config, 2), 50);
        assert_eq!(bootstrap_jobs_per_dataset(&config, 3), 34);
    }

    #[test]
    fn supports_skip_datasets_without_bootstrap_trees() {
        let (ds, mut config, root) = fixture();
        config.tbe_support = true;
        let paths = config.paths();
        fs::create_dir_all(paths.concatenated_bootstraps()).expect("dir");
        fs::write(paths.concatenated_bootstrap("big"), "(a,b);\n").expect("bs");
        fs::write(paths.concatenated_bootstrap("small"), "").expect("empty bs");
        write_best_tree(&paths, "big");
        write_best_tree(&paths, "small");
        let batch = compile_supports(&ds, &paths, &config).expect("batch");
        let names: Vec<&str> = batch.jobs().iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, vec!["support_big", "support_big_tbe"]);
        assert!(batch.jobs()[1].args.contains("--bs-metric tbe"));
        assert!(batch.jobs()[1].args.contains("big.support.tbe"));
        let _ = fs::remove_dir_all(root);
    }

    fn write_best_tree(paths: &RunPaths, name: &str) {
        let tree = best_tree_path(paths, name);
        fs::create_dir_all(tree.parent().expect("parent")).expect("dir");
        fs::write(tree, "(a,b,c);\n").expect("tree");
    }

    #[test]
    fn supports_skip_datasets_without_a_best_tree() {
        let (ds, config, root) = fixture();
        let paths = config.paths();
        fs::create_dir_all(paths.concatenated_bootstraps()).expect("dir");
        fs::write(paths.concatenated_bootstrap("big"), "(a,b);\n").expect("bs");
        fs::write(paths.concatenated_bootstrap("small"), "(a,b);\n").expect("bs");
        write_best_tree(&paths, "small");
        let big_tree = best_tree_path(&paths, "big");
        fs::create_dir_all(big_tree.parent().expect("parent")).expect("dir");
        fs::write(&big_tree, "").expect("empty tree");
        let batch = compile_supports(&ds, &paths, &config).expect("batch");
        let names: Vec<&str> = batch.jobs().iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, vec!["support_small"]);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn constraint_batches_carry_dataset_arguments() {
        let (ds, config, root) = fixture();
        let parsimony = root.join("constrain_run/parsimony/results");
        let consensus = root.join("constrain_run/consensus/results");
        let parsi = compile_constraint_parsimony(&ds, &parsimony, &config).expect("parsi");
        let cons = compile_constraint_consensus(&ds, &parsimony, &consensus, &config)
            .expect("consensus");
        assert_eq!(parsi.len(), 2);
        assert_eq!(cons.len(), 2);
        let line = cons.jobs()[0].to_line();
        assert!(line.starts_with("consensus_big 1 1 --prefix "));
        assert!(line.contains("big.raxml.startTree"));
        assert!(line.contains("--consense STRICT --model GTR+G"));
        assert!(parsi.jobs()[0].args.contains("--tree pars{100} --start"));
        let _ = fs::remove_dir_all(root);
    }
}
