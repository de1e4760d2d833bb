//! Best-fit model extraction from the model-selection run.

use crate::config::ModelCriterion;
use crate::log::RunLog;
use phylo_core::{atomic_write_bytes, read_tool_log, Dataset, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub fn modeltest_output_path(results_dir: &Path, name: &str) -> PathBuf {
    results_dir.join(name).join(format!("{}.out", name))
}

/// The model listed after `Best model according to <criterion>`.
pub fn selected_model(text: &str, criterion: ModelCriterion) -> Option<String> {
    let header = format!("Best model according to {}", criterion.as_str());
    let mut armed = false;
    for line in text.lines() {
        if line.starts_with(&header) {
            armed = true;
        }
        if armed && line.starts_with("Model") {
            return line.split_whitespace().last().map(str::to_string);
        }
    }
    None
}

/// Set each valid dataset's model from its model-selection output and write
/// `summary.txt` (models by frequency). Datasets without a result are rejected.
pub fn apply_selected_models(
    datasets: &mut BTreeMap<String, Dataset>,
    run_dir: &Path,
    criterion: ModelCriterion,
    log: &RunLog,
) -> Result<BTreeMap<String, usize>> {
    let results = run_dir.join("results");
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for (name, dataset) in datasets.iter_mut() {
        if !dataset.valid {
            continue;
        }
        let text = match read_tool_log(&modeltest_output_path(&results, name))? {
            Ok(text) => text,
            Err(e) => {
                dataset.reject(format!("model-select: {}", e));
                continue;
            }
        };
        match selected_model(&text, criterion) {
            Some(model) => {
                dataset.set_model(&model);
                *counts.entry(model).or_default() += 1;
            }
            None => dataset.reject(format!(
                "model-select: no best model according to {}",
                criterion.as_str()
            )),
        }
    }
    let mut ranked: Vec<(&String, &usize)> = counts.iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(a.1));
    let mut summary = String::new();
    for (model, count) in ranked {
        summary.push_str(&format!("{} {}\n", model, count));
    }
    atomic_write_bytes(&run_dir.join("summary.txt"), summary.as_bytes())?;
    log.info(format!(
        "model selection picked {} distinct model(s)",
        counts.len()
    ));
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use phylo_core::{ensure_dir, scratch_dir};
    use std::fs;

    const OUT: &str = "\
Best model according to BIC
---------------------------
Model:              HKY+G4
lnL:                -1234.5

Best model according to AICc
---------------------------
Model:              GTR+I+G4
lnL:                -1200.1
";

    #[test]
    fn picks_the_model_for_the_requested_criterion() {
        assert_eq!(selected_model(OUT, ModelCriterion::AICc).as_deref(), Some("GTR+I+G4"));
        assert_eq!(selected_model(OUT, ModelCriterion::Bic).as_deref(), Some("HKY+G4"));
        assert_eq!(selected_model(OUT, ModelCriterion::Aic), None);
    }

    #[test]
    fn results_set_models_and_reject_missing_outputs() {
        let run = scratch_dir("models");
        let results = run.join("results");
        ensure_dir(&results.join("a")).expect("dir");
        fs::write(modeltest_output_path(&results, "a"), OUT).expect("out");
        let mut datasets = BTreeMap::new();
        datasets.insert("a".to_string(), Dataset::new("a", "/msas/a"));
        datasets.insert("b".to_string(), Dataset::new("b", "/msas/b"));

        let counts = apply_selected_models(&mut datasets, &run, ModelCriterion::AICc, &RunLog::detached())
            .expect("apply");
        assert_eq!(counts.get("GTR+I+G4"), Some(&1));
        assert_eq!(datasets["a"].model(), Some("GTR+I+G4"));
        assert!(!datasets["b"].valid);
        let summary = fs::read_to_string(run.join("summary.txt")).expect("summary");
        assert_eq!(summary, "GTR+I+G4 1\n");
        let _ = fs::remove_dir_all(run);
    }
}
