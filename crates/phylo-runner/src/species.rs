//! Species-tree inference from the per-dataset gene trees.

use crate::config::{RunConfig, RunPaths, SpeciesTreeTool};
use crate::inventory::read_first_line;
use crate::log::RunLog;
use phylo_core::{atomic_write_bytes, ensure_dir, PipelineError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

pub const GENE_TREES_FILE: &str = "gene_trees.newick";
pub const SPECIES_TREE_FILE: &str = "output_species_tree.newick";

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(PipelineError::io(dir, e)),
    };
    out.sort();
    Ok(out)
}

fn is_plain_support(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with(".raxml.support") && !n.contains("tbe"))
        .unwrap_or(false)
}

/// Gene-tree files feeding the species-tree tool: support trees when a
/// support run exists, ML best trees otherwise.
pub fn gene_tree_sources(paths: &RunPaths) -> Result<Vec<PathBuf>> {
    if paths.supports_run().is_dir() {
        return Ok(sorted_entries(&paths.supports_run().join("results"))?
            .into_iter()
            .filter(|p| p.is_file() && is_plain_support(p))
            .collect());
    }
    Ok(sorted_entries(&paths.mlsearch_results())?
        .into_iter()
        .filter(|p| p.is_dir())
        .filter_map(|dir| {
            let name = dir.file_name()?.to_str()?.to_string();
            let tree = dir.join(format!("{}.raxml.bestTree", name));
            tree.is_file().then_some(tree)
        })
        .collect())
}

/// Concatenate the gene trees into `target`. Returns the tree count.
pub fn collect_gene_trees(paths: &RunPaths, tool: &SpeciesTreeTool, target: &Path) -> Result<usize> {
    let sources = gene_tree_sources(paths)?;
    let mut out = String::new();
    for source in &sources {
        let tree = fs::read_to_string(source).map_err(|e| PipelineError::io(source, e))?;
        match tool {
            // ASTER rejects '@' in labels.
            SpeciesTreeTool::Aster { .. } => out.push_str(&tree.replace('@', "at")),
            SpeciesTreeTool::Astral { .. } => out.push_str(&tree),
        }
    }
    atomic_write_bytes(target, out.as_bytes())?;
    Ok(sources.len())
}

pub fn species_tree_command(
    tool: &SpeciesTreeTool,
    gene_trees: &Path,
    output: &Path,
    extra: &[String],
) -> Vec<String> {
    let mut argv = match tool {
        SpeciesTreeTool::Astral { jar } => vec![
            "java".to_string(),
            "-jar".to_string(),
            jar.display().to_string(),
        ],
        SpeciesTreeTool::Aster { bin } => vec![bin.display().to_string()],
    };
    argv.push("-i".to_string());
    argv.push(gene_trees.display().to_string());
    argv.push("-o".to_string());
    argv.push(output.display().to_string());
    argv.extend(extra.iter().cloned());
    argv
}

pub fn run_species_tree(
    tool: &SpeciesTreeTool,
    config: &RunConfig,
    paths: &RunPaths,
    log: &RunLog,
) -> Result<PathBuf> {
    let run_dir = paths.species_run(tool);
    ensure_dir(&run_dir)?;
    let extra: Vec<String> = match &config.species_tree_parameters {
        Some(p) => read_first_line(p)?
            .split_whitespace()
            .map(str::to_string)
            .collect(),
        None => Vec::new(),
    };
    let gene_trees = run_dir.join(GENE_TREES_FILE);
    let count = collect_gene_trees(paths, tool, &gene_trees)?;
    log.info(format!("{}: {} gene tree(s) collected", tool, count));
    if count == 0 {
        return Err(PipelineError::tool(
            tool.to_string(),
            "no gene trees were found in the output directory",
        ));
    }

    let output = run_dir.join(SPECIES_TREE_FILE);
    let argv = species_tree_command(tool, &gene_trees, &output, &extra);
    let logs = run_dir.join(format!("{}_logs.txt", tool));
    let out = fs::File::create(&logs).map_err(|e| PipelineError::io(&logs, e))?;
    let err = out.try_clone().map_err(|e| PipelineError::io(&logs, e))?;
    log.info(format!(
        "starting {}, logs redirected to {}",
        tool,
        logs.display()
    ));
    let status = Command::new(&argv[0])
        .args(&argv[1..])
        .stdout(out)
        .stderr(err)
        .status()
        .map_err(|e| PipelineError::tool(tool.to_string(), format!("cannot start {}: {}", argv[0], e)))?;
    if !status.success() {
        log.error(format!("{} execution failed, see {}", tool, logs.display()));
        return Err(PipelineError::tool(
            tool.to_string(),
            format!("exited with {}", status),
        ));
    }
    Ok(output)
}
