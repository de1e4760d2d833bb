use crate::config::{Datatype, RunConfig};
use crate::log::RunLog;
use phylo_core::{dataset_name, Dataset, PipelineError, Result, ToolArgs};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

#[derive(Debug, Default)]
pub struct Inventory {
    pub datasets: BTreeMap<String, Dataset>,
    /// Filter entries with no matching file in the alignment directory.
    pub orphan_filter_entries: Vec<String>,
    /// Dataset names in override files that match no dataset.
    pub unknown_override_names: Vec<String>,
}

fn read_text(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))
}

/// Parameter files carry their arguments on the first line.
pub fn read_first_line(path: &Path) -> Result<String> {
    Ok(read_text(path)?
        .lines()
        .next()
        .unwrap_or("")
        .trim()
        .to_string())
}

fn read_filter(path: &Path) -> Result<BTreeSet<String>> {
    Ok(read_text(path)?
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

/// `<file name> <args...>` per line, keyed by normalized dataset name.
fn read_overrides(path: &Path) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    for line in read_text(path)?.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (file, tail) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        out.push((dataset_name(file), tail.trim().to_string()));
    }
    Ok(out)
}

fn list_alignment_files(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let entries = fs::read_dir(dir).map_err(|e| PipelineError::io(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| PipelineError::io(dir, e))?;
        let file_type = entry.file_type().map_err(|e| PipelineError::io(entry.path(), e))?;
        if file_type.is_dir() {
            continue;
        }
        names.push(entry.file_name().to_string_lossy().to_string());
    }
    names.sort();
    Ok(names)
}

fn apply_overrides(
    datasets: &mut BTreeMap<String, Dataset>,
    path: &Path,
    modeltest: bool,
    unknown: &mut Vec<String>,
    log: &RunLog,
) -> Result<()> {
    for (name, tail) in read_overrides(path)? {
        match datasets.get_mut(&name) {
            Some(d) if modeltest => d.modeltest_args.append_raw(&tail),
            Some(d) => d.raxml_args.append_raw(&tail),
            None => {
                log.warn(format!(
                    "found dataset {} in options file {} but not in the alignment directory",
                    name,
                    path.display()
                ));
                unknown.push(name);
            }
        }
    }
    Ok(())
}

/// Build the dataset set from the alignment directory, the optional
/// allow-list and the argument override files.
pub fn load_inventory(config: &RunConfig, log: &RunLog) -> Result<Inventory> {
    let mut raxml_global = ToolArgs::new();
    if let Some(p) = &config.raxml_global_parameters {
        raxml_global.append_raw(&read_first_line(p)?);
    }
    if let Some(s) = &config.raxml_global_parameters_string {
        raxml_global.append_raw(s);
    }
    let mut modeltest_global = ToolArgs::new();
    if let Some(p) = &config.modeltest_global_parameters {
        modeltest_global.append_raw(&read_first_line(p)?);
    }
    if config.datatype == Datatype::Aa {
        modeltest_global.push_opt("-d", "aa");
    }

    let files = list_alignment_files(&config.alignments_dir)?;
    if files.is_empty() {
        return Err(PipelineError::config(format!(
            "alignment directory {} is empty",
            config.alignments_dir.display()
        )));
    }
    let mut remaining_filter = match &config.msa_filter {
        Some(p) => Some(read_filter(p)?),
        None => None,
    };

    let mut inventory = Inventory::default();
    let mut sources: BTreeMap<String, String> = BTreeMap::new();
    for file in files {
        if let Some(filter) = remaining_filter.as_mut() {
            if !filter.remove(&file) {
                continue;
            }
        }
        let name = dataset_name(&file);
        if let Some(previous) = sources.insert(name.clone(), file.clone()) {
            return Err(PipelineError::config(format!(
                "files {} and {} both map to dataset name {}",
                previous, file, name
            )));
        }
        let mut dataset = Dataset::new(&name, config.alignments_dir.join(&file));
        dataset.raxml_args = raxml_global.clone();
        dataset.modeltest_args = modeltest_global.clone();
        dataset.disable_sorting = config.disable_job_sorting;
        inventory.datasets.insert(name, dataset);
    }
    if let Some(filter) = remaining_filter {
        for orphan in filter {
            log.warn(format!(
                "file {} was found in the filter file, but not in the alignment directory",
                orphan
            ));
            inventory.orphan_filter_entries.push(orphan);
        }
    }
    if inventory.datasets.is_empty() {
        return Err(PipelineError::config(
            "no alignment selected: the filter matched nothing in the alignment directory",
        ));
    }

    if let Some(p) = &config.per_msa_raxml_parameters {
        apply_overrides(
            &mut inventory.datasets,
            p,
            false,
            &mut inventory.unknown_override_names,
            log,
        )?;
    }
    if let Some(p) = &config.per_msa_modeltest_parameters {
        apply_overrides(
            &mut inventory.datasets,
            p,
            true,
            &mut inventory.unknown_override_names,
            log,
        )?;
    }

    if !config.use_modeltest {
        let missing: Vec<&str> = inventory
            .datasets
            .values()
            .filter(|d| d.model().is_none())
            .map(|d| d.name.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(PipelineError::config(format!(
                "no substitution model for {} dataset(s) ({}) and model selection is disabled; pass --model in the raxml parameters or enable model selection",
                missing.len(),
                missing.join(", ")
            )));
        }
    }
    log.info(format!(
        "inventory: {} dataset(s) from {}",
        inventory.datasets.len(),
        config.alignments_dir.display()
    ));
    Ok(inventory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use phylo_core::scratch_dir;
    use std::path::PathBuf;

    fn setup(files: &[&str]) -> (RunConfig, PathBuf) {
        let root = scratch_dir("inventory");
        let msas = root.join("msas");
        fs::create_dir_all(&msas).expect("msas");
        for f in files {
            fs::write(msas.join(f), ">t\nACGT\n").expect("msa");
        }
        let config = RunConfig {
            alignments_dir: msas,
            output_dir: root.join("out"),
            cores: 4,
            raxml_global_parameters_string: Some("--model GTR+G".to_string()),
            ..RunConfig::default()
        };
        (config, root)
    }

    #[test]
    fn filter_is_a_strict_allow_list_with_orphan_warnings() {
        let (mut config, root) = setup(&["A", "B", "C"]);
        let filter = root.join("filter.txt");
        fs::write(&filter, "A\nD\n").expect("filter");
        config.msa_filter = Some(filter);
        let log = RunLog::detached();
        let inv = load_inventory(&config, &log).expect("inventory");
        assert_eq!(inv.datasets.keys().collect::<Vec<_>>(), vec!["A"]);
        assert_eq!(inv.orphan_filter_entries, vec!["D".to_string()]);
        assert!(log.warnings().iter().any(|w| w.contains("D")));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn overrides_append_per_dataset_and_warn_on_unknown_names() {
        let (mut config, root) = setup(&["g1.fasta", "g2.fasta"]);
        let overrides = root.join("per_msa.txt");
        fs::write(&overrides, "g1.fasta --model LG+G4 --blmin 1e-5\nnope.fasta --x 1\n")
            .expect("overrides");
        config.per_msa_raxml_parameters = Some(overrides);
        config.datatype = Datatype::Aa;
        let log = RunLog::detached();
        let inv = load_inventory(&config, &log).expect("inventory");
        let g1 = &inv.datasets["g1_fasta"];
        assert_eq!(g1.model(), Some("LG+G4"));
        assert_eq!(g1.raxml_args.get("--blmin"), Some("1e-5"));
        assert_eq!(g1.modeltest_args.render(), "-d aa");
        assert_eq!(inv.datasets["g2_fasta"].model(), Some("GTR+G"));
        assert_eq!(inv.unknown_override_names, vec!["nope_fasta".to_string()]);
        assert_eq!(log.warnings().len(), 1);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_model_without_model_selection_is_fatal() {
        let (mut config, root) = setup(&["g1.fasta"]);
        config.raxml_global_parameters_string = None;
        let err = load_inventory(&config, &RunLog::detached()).expect_err("no model");
        assert!(matches!(err, PipelineError::Config { .. }));

        config.use_modeltest = true;
        let inv = load_inventory(&config, &RunLog::detached()).expect("model selection on");
        assert_eq!(inv.datasets.len(), 1);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn colliding_names_are_rejected() {
        let (config, root) = setup(&["a.b", "a_b"]);
        let err = load_inventory(&config, &RunLog::detached()).expect_err("collision");
        assert!(err.to_string().contains("a_b"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn filter_matching_nothing_is_fatal() {
        let (mut config, root) = setup(&["A"]);
        let filter = root.join("filter.txt");
        fs::write(&filter, "Z\n").expect("filter");
        config.msa_filter = Some(filter);
        assert!(load_inventory(&config, &RunLog::detached()).is_err());
        let _ = fs::remove_dir_all(root);
    }
}
