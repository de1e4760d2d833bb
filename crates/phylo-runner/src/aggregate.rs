//! Post-search aggregation: best-replicate selection and bootstrap
//! concatenation. Both run per dataset on a bounded local thread pool.

use crate::config::{RunConfig, RunPaths, AGGREGATION_POOL_CAP};
use crate::log::RunLog;
use phylo_core::{atomic_write_bytes, ensure_dir, Dataset, PipelineError, Result};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const LIKELIHOOD_LABEL: &str = "Final LogLikelihood:";

fn aggregation_pool(cores: u32) -> Result<rayon::ThreadPool> {
    let threads = (cores.max(1) as usize).min(AGGREGATION_POOL_CAP);
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .map_err(|e| {
            PipelineError::io(
                "aggregation pool",
                io::Error::new(io::ErrorKind::Other, e.to_string()),
            )
        })
}

/// Last `Final LogLikelihood:` value of a search log. Missing or unreadable
/// values rank below every real likelihood.
pub fn extract_log_likelihood(text: &str) -> f64 {
    let mut ll = f64::NEG_INFINITY;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix(LIKELIHOOD_LABEL) {
            ll = rest
                .split_whitespace()
                .next()
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|v| !v.is_nan())
                .unwrap_or(f64::NEG_INFINITY);
        }
    }
    ll
}

/// Index of the highest likelihood; ties keep the earliest replicate.
pub fn select_best_replicate(likelihoods: &[f64]) -> usize {
    let mut best = 0;
    for (i, ll) in likelihoods.iter().enumerate() {
        if *ll > likelihoods[best] {
            best = i;
        }
    }
    best
}

fn replicate_dir(dataset_dir: &Path, replicate: u32) -> PathBuf {
    dataset_dir.join("multiple_runs").join(replicate.to_string())
}

fn read_or_neg_inf(path: &Path) -> f64 {
    fs::read_to_string(path)
        .map(|t| extract_log_likelihood(&t))
        .unwrap_or(f64::NEG_INFINITY)
}

/// Promote the best replicate of one dataset into its results directory and
/// write the trees of all replicates ranked by likelihood.
pub fn select_best_tree(results_dir: &Path, name: &str, replicates: u32) -> Result<usize> {
    let dataset_dir = results_dir.join(name);
    let likelihoods: Vec<f64> = (0..replicates)
        .map(|r| read_or_neg_inf(&replicate_dir(&dataset_dir, r).join(format!("{}.raxml.log", name))))
        .collect();
    let best = select_best_replicate(&likelihoods);

    let source = replicate_dir(&dataset_dir, best as u32);
    let entries = fs::read_dir(&source).map_err(|e| PipelineError::io(&source, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| PipelineError::io(&source, e))?;
        let from = entry.path();
        if from.is_file() {
            let to = dataset_dir.join(entry.file_name());
            fs::copy(&from, &to).map_err(|e| PipelineError::io(&to, e))?;
        }
    }

    let mut ranked: Vec<(f64, u32)> = likelihoods
        .iter()
        .enumerate()
        .map(|(i, ll)| (*ll, i as u32))
        .collect();
    ranked.sort_by(|a, b| b.0.total_cmp(&a.0));
    let mut trees = String::new();
    let mut trees_ll = String::new();
    for (ll, replicate) in ranked {
        let tree_file = replicate_dir(&dataset_dir, replicate).join(format!("{}.raxml.bestTree", name));
        let Ok(tree) = fs::read_to_string(&tree_file) else {
            continue;
        };
        trees.push_str(&tree);
        trees_ll.push_str(&format!("{} {}", ll, tree));
    }
    atomic_write_bytes(&dataset_dir.join("sorted_ml_trees.newick"), trees.as_bytes())?;
    atomic_write_bytes(&dataset_dir.join("sorted_ml_trees_ll.newick"), trees_ll.as_bytes())?;
    Ok(best)
}

/// Best-tree selection for every valid dataset. Datasets whose replicates
/// left nothing to promote are logged and skipped.
pub fn select_best_trees(
    datasets: &BTreeMap<String, Dataset>,
    paths: &RunPaths,
    config: &RunConfig,
    log: &RunLog,
) -> Result<BTreeMap<String, usize>> {
    let results = paths.mlsearch_results();
    let replicates = config.starting_trees();
    let names: Vec<&str> = datasets
        .values()
        .filter(|d| d.valid)
        .map(|d| d.name.as_str())
        .collect();
    let pool = aggregation_pool(config.cores)?;
    let outcomes: Vec<(String, Result<usize>)> = pool.install(|| {
        names
            .par_iter()
            .map(|name| (name.to_string(), select_best_tree(&results, name, replicates)))
            .collect()
    });
    let mut selected = BTreeMap::new();
    for (name, outcome) in outcomes {
        match outcome {
            Ok(best) => {
                selected.insert(name, best);
            }
            Err(e) => log.warn(format!("best-tree selection skipped {}: {}", name, e)),
        }
    }
    Ok(selected)
}

/// Concatenate `*bootstraps` files of one dataset into `<name>.bs`.
/// Returns false and leaves no file when there was nothing to concatenate.
pub fn concatenate_bootstraps_for(bootstraps_dir: &Path, target: &Path) -> Result<bool> {
    let mut parts: Vec<PathBuf> = match fs::read_dir(bootstraps_dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.is_file()
                    && p.file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| n.ends_with("bootstraps"))
                        .unwrap_or(false)
            })
            .collect(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(PipelineError::io(bootstraps_dir, e)),
    };
    parts.sort();
    let mut out = fs::File::create(target).map_err(|e| PipelineError::io(target, e))?;
    let mut written = 0u64;
    for part in &parts {
        let mut reader = fs::File::open(part).map_err(|e| PipelineError::io(part, e))?;
        written += io::copy(&mut reader, &mut out).map_err(|e| PipelineError::io(target, e))?;
    }
    out.flush().map_err(|e| PipelineError::io(target, e))?;
    drop(out);
    if written == 0 {
        fs::remove_file(target).map_err(|e| PipelineError::io(target, e))?;
        return Ok(false);
    }
    Ok(true)
}

/// Returns the datasets that ended up with a non-empty bootstrap file.
pub fn concatenate_bootstraps(
    datasets: &BTreeMap<String, Dataset>,
    paths: &RunPaths,
    config: &RunConfig,
    log: &RunLog,
) -> Result<Vec<String>> {
    let target_dir = paths.concatenated_bootstraps();
    ensure_dir(&target_dir)?;
    let source_dir = paths.mlsearch_bootstraps();
    let names: Vec<&str> = datasets
        .values()
        .filter(|d| d.valid)
        .map(|d| d.name.as_str())
        .collect();
    let pool = aggregation_pool(config.cores)?;
    let outcomes: Vec<(String, Result<bool>)> = pool.install(|| {
        names
            .par_iter()
            .map(|name| {
                let found = concatenate_bootstraps_for(
                    &source_dir.join(name),
                    &paths.concatenated_bootstrap(name),
                );
                (name.to_string(), found)
            })
            .collect()
    });
    let mut concatenated = Vec::new();
    for (name, outcome) in outcomes {
        match outcome? {
            true => concatenated.push(name),
            false => log.warn(format!("no bootstrap trees found for {}", name)),
        }
    }
    Ok(concatenated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use phylo_core::scratch_dir;

    #[test]
    fn last_likelihood_line_wins() {
        let log = "Final LogLikelihood: -20.5\nother\nFinal LogLikelihood: -12.25\n";
        assert_eq!(extract_log_likelihood(log), -12.25);
        assert_eq!(extract_log_likelihood("nothing here"), f64::NEG_INFINITY);
        assert_eq!(
            extract_log_likelihood("Final LogLikelihood: oops"),
            f64::NEG_INFINITY
        );
    }

    #[test]
    fn best_replicate_is_the_highest_with_first_tie() {
        assert_eq!(select_best_replicate(&[-12.3, -10.1, -15.0]), 1);
        assert_eq!(select_best_replicate(&[-5.0, -5.0]), 0);
        assert_eq!(
            select_best_replicate(&[f64::NEG_INFINITY, f64::NEG_INFINITY]),
            0
        );
    }

    #[test]
    fn best_tree_files_are_promoted_and_ranked() {
        let results = scratch_dir("best_tree");
        for (r, ll) in [(0, -12.3), (1, -10.1), (2, -15.0)] {
            let dir = replicate_dir(&results.join("g"), r);
            ensure_dir(&dir).expect("dir");
            fs::write(dir.join("g.raxml.log"), format!("Final LogLikelihood: {}\n", ll)).expect("log");
            fs::write(dir.join("g.raxml.bestTree"), format!("(r{});\n", r)).expect("tree");
        }
        let best = select_best_tree(&results, "g", 3).expect("select");
        assert_eq!(best, 1);
        let promoted = fs::read_to_string(results.join("g/g.raxml.bestTree")).expect("promoted");
        assert_eq!(promoted, "(r1);\n");
        let sorted = fs::read_to_string(results.join("g/sorted_ml_trees.newick")).expect("sorted");
        assert_eq!(sorted, "(r1);\n(r0);\n(r2);\n");
        let sorted_ll =
            fs::read_to_string(results.join("g/sorted_ml_trees_ll.newick")).expect("sorted ll");
        assert_eq!(sorted_ll.lines().next(), Some("-10.1 (r1);"));
        let _ = fs::remove_dir_all(results);
    }

    #[test]
    fn bootstrap_chunks_are_concatenated_and_empty_results_removed() {
        let root = scratch_dir("concat");
        let bs = root.join("bs");
        ensure_dir(&bs).expect("dir");
        fs::write(bs.join("g_bs0.raxml.bootstraps"), "(a);\n").expect("bs0");
        fs::write(bs.join("g_bs1.raxml.bootstraps"), "(b);\n").expect("bs1");
        fs::write(bs.join("g_bs0.raxml.log"), "log").expect("log");
        let target = root.join("g.bs");
        assert!(concatenate_bootstraps_for(&bs, &target).expect("concat"));
        assert_eq!(fs::read_to_string(&target).expect("read"), "(a);\n(b);\n");

        let empty = root.join("empty");
        ensure_dir(&empty).expect("dir");
        fs::write(empty.join("e.raxml.bootstraps"), "").expect("empty");
        let target = root.join("e.bs");
        assert!(!concatenate_bootstraps_for(&empty, &target).expect("concat"));
        assert!(!target.exists());
        assert!(!concatenate_bootstraps_for(&root.join("absent"), &root.join("x.bs")).expect("absent"));
        let _ = fs::remove_dir_all(root);
    }
}
