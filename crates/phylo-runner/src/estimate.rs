//! Per-dataset size and core estimates scraped from the parser's logs.
//!
//! The parser prints labeled lines such as
//! `Loaded alignment with 24 taxa and 1200 sites`,
//! `Alignment sites / patterns: 1200 / 877`,
//! `Per-taxon CLV size (elements)                : 3508` and
//! `Recommended number of threads / MPI processes: 4`. Those labels are the
//! contract with the tool; anything else in the log is ignored.

use crate::config::{CoreAssignment, RunConfig};
use crate::log::RunLog;
use phylo_core::{atomic_write_bytes, read_tool_log, Dataset, Result, ScrapeError};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParsedMetrics {
    pub taxa: u64,
    pub patterns: u64,
    pub unit_size: u64,
    pub cores: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorePrediction {
    pub total_cost: u64,
    pub worst_per_core_cost: u64,
    pub predicted_cores: u64,
    pub recommended_max: u64,
}

fn normalize(line: &str) -> String {
    line.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn parse_num<T: std::str::FromStr>(raw: &str, line: &str) -> std::result::Result<T, ScrapeError> {
    raw.trim().parse::<T>().map_err(|_| ScrapeError::Malformed {
        line: line.to_string(),
        reason: format!("expected an integer, found '{}'", raw.trim()),
    })
}

fn after_colon(line: &str) -> &str {
    line.rsplit_once(':').map(|(_, v)| v).unwrap_or("")
}

fn threads_label(policy: CoreAssignment) -> &'static str {
    match policy {
        CoreAssignment::High => "Maximum number of threads / MPI processes:",
        CoreAssignment::Medium => "Recommended number of threads / MPI processes:",
        CoreAssignment::Low => "Minimum number of threads / MPI processes:",
    }
}

/// Pull the size metrics and the policy's core suggestion out of a parse log.
/// Absent lines leave the field at zero; unreadable numbers are an error.
pub fn scrape_parse_log(
    text: &str,
    policy: CoreAssignment,
) -> std::result::Result<ParsedMetrics, ScrapeError> {
    let mut metrics = ParsedMetrics::default();
    let label = threads_label(policy);
    for raw in text.lines() {
        let line = normalize(raw);
        if line.contains("Loaded alignment") && line.contains("taxa") {
            let tokens: Vec<&str> = line.split(' ').collect();
            let pos = tokens.iter().position(|t| *t == "taxa").unwrap_or(0);
            let value = if pos > 0 { tokens[pos - 1] } else { "" };
            metrics.taxa = parse_num(value, raw)?;
        } else if line.contains("Alignment sites / patterns:") {
            let value = after_colon(&line);
            let patterns = value.split('/').nth(1).unwrap_or("");
            metrics.patterns = parse_num(patterns, raw)?;
        } else if line.contains("Per-taxon CLV size") {
            metrics.unit_size = parse_num(after_colon(&line), raw)?;
        } else if line.contains(label) {
            metrics.cores = parse_num(after_colon(&line), raw)?;
        }
    }
    Ok(metrics)
}

pub fn parse_log_path(parse_results: &Path, name: &str) -> PathBuf {
    parse_results.join(name).join(format!("{}.raxml.log", name))
}

pub fn binary_alignment_path(parse_results: &Path, name: &str) -> PathBuf {
    parse_results.join(name).join(format!("{}.raxml.rba", name))
}

/// Fill size and core fields from the parse run, flagging datasets whose log
/// is missing, malformed or reports zero-sized metrics.
pub fn apply_parse_results(
    datasets: &mut BTreeMap<String, Dataset>,
    parse_results: &Path,
    policy: CoreAssignment,
) -> Result<()> {
    for (name, dataset) in datasets.iter_mut() {
        if !dataset.valid {
            continue;
        }
        let rba = binary_alignment_path(parse_results, name);
        dataset.binary_path = if rba.exists() { Some(rba) } else { None };
        let scraped = match read_tool_log(&parse_log_path(parse_results, name))? {
            Ok(text) => scrape_parse_log(&text, policy),
            Err(e) => Err(e),
        };
        match scraped {
            Ok(m) => {
                dataset.taxa = m.taxa;
                dataset.patterns = m.patterns;
                dataset.unit_size = m.unit_size;
                dataset.cores = m.cores;
                dataset.refresh_validity();
            }
            Err(e) => dataset.reject(format!("parse: {}", e)),
        }
    }
    Ok(())
}

/// Halve the cores of datasets below the `(1 - p)` taxon-count quantile.
/// Returns how many datasets were adjusted.
pub fn skew_correct(datasets: &mut BTreeMap<String, Dataset>, percentage_double: f64) -> usize {
    if percentage_double <= 0.0 {
        return 0;
    }
    let mut taxa: Vec<u64> = datasets
        .values()
        .filter(|d| d.valid)
        .map(|d| d.taxa)
        .collect();
    if taxa.is_empty() {
        return 0;
    }
    taxa.sort_unstable();
    let ratio = 1.0 - percentage_double;
    let index = ((taxa.len() as f64 * ratio) as usize).min(taxa.len() - 1);
    let limit = taxa[index];
    let mut halved = 0;
    for d in datasets.values_mut().filter(|d| d.valid) {
        if d.taxa < limit && d.cores > 1 {
            d.cores /= 2;
            halved += 1;
        }
    }
    halved
}

/// Advisory estimate of how many cores the whole run could use.
pub fn predict_cores(datasets: &BTreeMap<String, Dataset>, runs_per_dataset: u64) -> CorePrediction {
    let mut total_cost = 0u64;
    let mut worst = 1u64;
    for d in datasets.values().filter(|d| d.valid) {
        total_cost += d.cost();
        worst = worst.max(d.cost() / u64::from(d.cores.max(1)));
    }
    let predicted_cores = (total_cost / worst) * runs_per_dataset;
    CorePrediction {
        total_cost,
        worst_per_core_cost: worst,
        predicted_cores,
        recommended_max: (predicted_cores / 4).max(1),
    }
}

fn log_population(datasets: &BTreeMap<String, Dataset>, log: &RunLog) {
    let valid: Vec<&Dataset> = datasets.values().filter(|d| d.valid).collect();
    let n = valid.len().max(1) as u64;
    let sum_taxa: u64 = valid.iter().map(|d| d.taxa).sum();
    let sum_sites: u64 = valid.iter().map(|d| d.patterns).sum();
    let max_taxa = valid.iter().map(|d| d.taxa).max().unwrap_or(0);
    let max_sites = valid.iter().map(|d| d.patterns).max().unwrap_or(0);
    log.info(format!("  Number of families: {}", valid.len()));
    log.info(format!("  Average number of taxa: {}", sum_taxa / n));
    log.info(format!("  Max number of taxa: {}", max_taxa));
    log.info(format!("  Average number of sites: {}", sum_sites / n));
    log.info(format!("  Max number of sites: {}", max_sites));
}

/// Write the rejection report. One `<name> <reason>` line per invalid dataset.
pub fn write_rejections(datasets: &BTreeMap<String, Dataset>, path: &Path) -> Result<usize> {
    let lines: Vec<String> = datasets
        .values()
        .filter(|d| !d.valid)
        .map(|d| {
            format!(
                "{} {}",
                d.name,
                d.rejection.as_deref().unwrap_or("invalid")
            )
        })
        .collect();
    if lines.is_empty() {
        return Ok(0);
    }
    atomic_write_bytes(path, format!("{}\n", lines.join("\n")).as_bytes())?;
    Ok(lines.len())
}

/// Full analysis of a parse run: scrape, skew-correct, predict, report.
pub fn analyse_parse_run(
    datasets: &mut BTreeMap<String, Dataset>,
    parse_results: &Path,
    rejected_path: &Path,
    config: &RunConfig,
    log: &RunLog,
) -> Result<CorePrediction> {
    apply_parse_results(datasets, parse_results, config.core_assignment)?;
    log_population(datasets, log);
    let halved = skew_correct(datasets, config.percentage_jobs_double_cores);
    if halved > 0 {
        log.info(format!(
            "  Halved the core assignment of {} small dataset(s)",
            halved
        ));
    }
    let prediction = predict_cores(datasets, config.runs_per_dataset());
    log.info(format!(
        "  Recommended MAXIMUM number of cores: {}",
        prediction.recommended_max
    ));
    let rejected = write_rejections(datasets, rejected_path)?;
    if rejected > 0 {
        log.warn(format!(
            "found {} invalid dataset(s) (see {})",
            rejected,
            rejected_path.display()
        ));
    }
    Ok(prediction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use phylo_core::scratch_dir;
    use std::fs;

    const LOG: &str = "\
RAxML-NG v. 1.2.0 released on 09.05.2023
[00:00:00] Loaded alignment with 24 taxa and 1200 sites
Alignment sites / patterns: 1200 / 877
Per-taxon CLV size (elements)                : 3508
Maximum     number of threads / MPI processes: 8
Recommended number of threads / MPI processes: 4
Minimum     number of threads / MPI processes: 1
";

    fn dataset(name: &str, taxa: u64, cores: u32) -> Dataset {
        let mut d = Dataset::new(name, format!("/msas/{}", name));
        d.taxa = taxa;
        d.unit_size = 10;
        d.cores = cores;
        d
    }

    #[test]
    fn scrape_reads_labeled_lines_per_policy() {
        let m = scrape_parse_log(LOG, CoreAssignment::Medium).expect("scrape");
        assert_eq!(
            m,
            ParsedMetrics {
                taxa: 24,
                patterns: 877,
                unit_size: 3508,
                cores: 4
            }
        );
        assert_eq!(scrape_parse_log(LOG, CoreAssignment::High).expect("high").cores, 8);
        assert_eq!(scrape_parse_log(LOG, CoreAssignment::Low).expect("low").cores, 1);
    }

    #[test]
    fn scrape_flags_malformed_numbers() {
        let bad = "Per-taxon CLV size (elements) : lots\n";
        let err = scrape_parse_log(bad, CoreAssignment::Medium).expect_err("malformed");
        assert!(matches!(err, ScrapeError::Malformed { .. }));
    }

    #[test]
    fn skew_correction_halves_bottom_quantile() {
        let mut ds = BTreeMap::new();
        ds.insert("a".to_string(), dataset("a", 5, 4));
        ds.insert("b".to_string(), dataset("b", 5, 3));
        ds.insert("c".to_string(), dataset("c", 5, 1));
        ds.insert("d".to_string(), dataset("d", 100, 8));
        let halved = skew_correct(&mut ds, 0.25);
        assert_eq!(halved, 2);
        assert_eq!(ds["a"].cores, 2);
        assert_eq!(ds["b"].cores, 1);
        assert_eq!(ds["c"].cores, 1);
        assert_eq!(ds["d"].cores, 8);
    }

    #[test]
    fn default_share_keeps_full_cores_for_the_largest_datasets_only() {
        let mut ds = BTreeMap::new();
        for taxa in 1..=10u64 {
            let name = format!("d{:02}", taxa);
            ds.insert(name.clone(), dataset(&name, taxa, 4));
        }
        let share = crate::config::RunConfig::default().percentage_jobs_double_cores;
        assert_eq!(share, 0.05);
        assert_eq!(skew_correct(&mut ds, share), 9);
        assert_eq!(ds["d10"].cores, 4);
        assert_eq!(ds["d01"].cores, 2);
        assert_eq!(ds["d09"].cores, 2);
    }

    #[test]
    fn skew_correction_disabled_at_zero() {
        let mut ds = BTreeMap::new();
        ds.insert("a".to_string(), dataset("a", 5, 4));
        ds.insert("d".to_string(), dataset("d", 100, 8));
        assert_eq!(skew_correct(&mut ds, 0.0), 0);
        assert_eq!(ds["a"].cores, 4);
    }

    #[test]
    fn prediction_scales_with_runs() {
        let mut ds = BTreeMap::new();
        ds.insert("a".to_string(), dataset("a", 10, 2));
        ds.insert("b".to_string(), dataset("b", 30, 3));
        let mut invalid = dataset("x", 1000, 1);
        invalid.valid = false;
        ds.insert("x".to_string(), invalid);
        let p = predict_cores(&ds, 4);
        assert_eq!(p.total_cost, 400);
        assert_eq!(p.worst_per_core_cost, 100);
        assert_eq!(p.predicted_cores, 16);
        assert_eq!(p.recommended_max, 4);
    }

    #[test]
    fn apply_parse_results_classifies_missing_and_zero_logs() {
        let root = scratch_dir("estimate");
        let results = root.join("results");
        for (name, text) in [("good", LOG), ("zero", "Loaded alignment with 0 taxa\n")] {
            let dir = results.join(name);
            fs::create_dir_all(&dir).expect("dir");
            fs::write(dir.join(format!("{}.raxml.log", name)), text).expect("log");
        }
        fs::write(results.join("good").join("good.raxml.rba"), b"rba").expect("rba");
        let mut ds = BTreeMap::new();
        for name in ["good", "zero", "gone"] {
            ds.insert(name.to_string(), Dataset::new(name, format!("/msas/{}", name)));
        }
        apply_parse_results(&mut ds, &results, CoreAssignment::Medium).expect("apply");
        assert!(ds["good"].valid);
        assert_eq!(ds["good"].cores, 4);
        assert!(ds["good"].binary_path.is_some());
        assert!(!ds["zero"].valid);
        assert!(!ds["gone"].valid);
        assert!(ds["gone"].rejection.as_deref().unwrap().contains("missing"));

        let rejected = root.join("rejected.txt");
        assert_eq!(write_rejections(&ds, &rejected).expect("write"), 2);
        let text = fs::read_to_string(&rejected).expect("read");
        assert!(text.starts_with("gone "));
        let _ = fs::remove_dir_all(root);
    }
}
