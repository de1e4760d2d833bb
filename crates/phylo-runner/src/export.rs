//! Flat export of a finished run's per-dataset results.

use crate::batch::best_tree_path;
use crate::config::{RunConfig, RunPaths};
use crate::log::RunLog;
use crate::species::{gene_tree_sources, GENE_TREES_FILE, SPECIES_TREE_FILE};
use phylo_core::{atomic_copy, atomic_write_bytes, ensure_dir, PipelineError, Result};
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const EXPORTED_SPECIES_TREE: &str = "species_tree.newick";

/// What to export. An empty selection exports everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExportSelection {
    pub best_ml_tree: bool,
    pub best_ml_model: bool,
    pub sorted_ml_trees: bool,
    pub bootstrap_trees: bool,
    pub support_trees: bool,
    pub species_tree: bool,
    pub gene_trees: bool,
}

impl ExportSelection {
    pub fn everything() -> Self {
        Self {
            best_ml_tree: true,
            best_ml_model: true,
            sorted_ml_trees: true,
            bootstrap_trees: true,
            support_trees: true,
            species_tree: true,
            gene_trees: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    pub export_dir: PathBuf,
    pub families: Vec<String>,
    pub exported: Vec<String>,
    pub missing: Vec<PathBuf>,
}

/// The configuration a run was executed with.
pub fn load_resolved_config(paths: &RunPaths) -> Result<RunConfig> {
    let path = paths.resolved_config();
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(PipelineError::config(format!(
                "{} does not look like a run output directory ({} is missing)",
                paths.root.display(),
                path.display()
            )))
        }
        Err(e) => return Err(PipelineError::io(&path, e)),
    };
    Ok(serde_json::from_str(&raw)?)
}

/// Datasets with an ml-search results directory, sorted by name.
pub fn export_families(paths: &RunPaths) -> Result<Vec<String>> {
    let dir = paths.mlsearch_results();
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(PipelineError::io(&dir, e)),
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .collect();
    names.sort();
    Ok(names)
}

struct Exporter<'a> {
    target: &'a Path,
    log: &'a RunLog,
    exported: Vec<String>,
    missing: Vec<PathBuf>,
}

impl Exporter<'_> {
    fn copy(&mut self, source: &Path, name: String) -> Result<()> {
        if !source.is_file() {
            self.log.warn(format!("could not find {}", source.display()));
            self.missing.push(source.to_path_buf());
            return Ok(());
        }
        atomic_copy(source, &self.target.join(&name))?;
        self.exported.push(name);
        Ok(())
    }

    fn bundle(&mut self, sources: &[PathBuf], name: &str) -> Result<()> {
        let mut out = String::new();
        for source in sources {
            let tree = fs::read_to_string(source).map_err(|e| PipelineError::io(source, e))?;
            out.push_str(&tree);
        }
        if out.is_empty() {
            self.log.warn("no gene trees to bundle");
            return Ok(());
        }
        atomic_write_bytes(&self.target.join(name), out.as_bytes())?;
        self.exported.push(name.to_string());
        Ok(())
    }
}

/// Copy the selected results of the run in `run_dir` into `export_dir`,
/// which is created and must not exist beforehand.
pub fn export_run(
    run_dir: &Path,
    export_dir: &Path,
    selection: ExportSelection,
    log: &RunLog,
) -> Result<ExportSummary> {
    let paths = RunPaths::new(run_dir);
    let config = load_resolved_config(&paths)?;
    if export_dir.exists() {
        return Err(PipelineError::config(format!(
            "the export directory {} already exists",
            export_dir.display()
        )));
    }
    let selection = if selection.is_empty() {
        ExportSelection::everything()
    } else {
        selection
    };
    ensure_dir(export_dir)?;
    let families = export_families(&paths)?;
    log.info(format!(
        "exporting {} dataset(s) from {} into {}",
        families.len(),
        run_dir.display(),
        export_dir.display()
    ));

    let mut exporter = Exporter {
        target: export_dir,
        log,
        exported: Vec::new(),
        missing: Vec::new(),
    };
    let supports = paths.supports_run().join("results");
    for f in &families {
        let dir = paths.mlsearch_results().join(f);
        if selection.best_ml_tree {
            exporter.copy(&best_tree_path(&paths, f), format!("{}.raxml.bestTree", f))?;
        }
        if selection.best_ml_model {
            let name = format!("{}.raxml.bestModel", f);
            exporter.copy(&dir.join(&name), name)?;
        }
        if selection.sorted_ml_trees && config.starting_trees() > 1 {
            for stem in ["sorted_ml_trees", "sorted_ml_trees_ll"] {
                exporter.copy(
                    &dir.join(format!("{}.newick", stem)),
                    format!("{}.{}.newick", f, stem),
                )?;
            }
        }
        if selection.bootstrap_trees && config.bootstraps > 0 {
            exporter.copy(&paths.concatenated_bootstrap(f), format!("{}.bs", f))?;
        }
        if selection.support_trees && config.bootstraps > 0 {
            let name = format!("{}.support.raxml.support", f);
            exporter.copy(&supports.join(&name), name)?;
            if config.tbe_support {
                let name = format!("{}.support.tbe.raxml.support", f);
                exporter.copy(&supports.join(&name), name)?;
            }
        }
    }
    if selection.species_tree {
        if let Some(tool) = &config.species_tree {
            exporter.copy(
                &paths.species_run(tool).join(SPECIES_TREE_FILE),
                EXPORTED_SPECIES_TREE.to_string(),
            )?;
        }
    }
    if selection.gene_trees {
        exporter.bundle(&gene_tree_sources(&paths)?, GENE_TREES_FILE)?;
    }

    log.info(format!(
        "exported {} file(s), {} missing",
        exporter.exported.len(),
        exporter.missing.len()
    ));
    Ok(ExportSummary {
        export_dir: export_dir.to_path_buf(),
        families,
        exported: exporter.exported,
        missing: exporter.missing,
    })
}
