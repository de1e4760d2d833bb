//! Diagnostic bundle written when a run aborts.

use crate::config::RunPaths;
use crate::log::MAIN_LOG_NAME;
use chrono::Utc;
use phylo_core::{atomic_write_bytes, Result};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone, Default)]
pub struct ReportContext {
    pub version: String,
    pub args: Vec<String>,
    pub cores: Option<u32>,
    pub error: Option<String>,
}

fn write_header(out: &mut String, title: &str) {
    let title = format!("** [REPORT] {} **", title);
    let stars = "*".repeat(title.len());
    out.push_str(&format!("\n{}\n{}\n{}\n\n", stars, title, stars));
}

fn extract_file(out: &mut String, path: &Path, title: &str) {
    write_header(out, title);
    match fs::read_to_string(path) {
        Ok(text) => {
            out.push_str(&text);
            out.push('\n');
        }
        Err(e) => out.push_str(&format!("failed to extract {}: {}\n", path.display(), e)),
    }
}

/// Files in `dir` (not recursive) whose name satisfies `keep`, sorted.
fn matching_files(dir: &Path, keep: impl Fn(&str) -> bool) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.file_name().to_str().map(&keep).unwrap_or(false))
        .map(|e| e.into_path())
        .collect();
    out.sort();
    out
}

fn is_incremental(name: &str, stem: &str) -> bool {
    let Some(rest) = name.strip_prefix(stem) else {
        return false;
    };
    let Some(rest) = rest.strip_suffix(".txt") else {
        return false;
    };
    rest.is_empty()
        || rest
            .strip_prefix('_')
            .map(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
            .unwrap_or(false)
}

fn environment(ctx: &ReportContext) -> String {
    let mut out = String::new();
    out.push_str(&format!("generated_at: {}\n", Utc::now().to_rfc3339()));
    out.push_str(&format!("version: {}\n", ctx.version));
    out.push_str(&format!(
        "platform: {}/{}\n",
        std::env::consts::OS,
        std::env::consts::ARCH
    ));
    if !ctx.args.is_empty() {
        out.push_str(&format!("args: {}\n", ctx.args.join(" ")));
    }
    match ctx.cores {
        Some(c) => out.push_str(&format!("core_budget: {}\n", c)),
        None => out.push_str("core_budget: unknown\n"),
    }
    if let Ok(parallelism) = std::thread::available_parallelism() {
        out.push_str(&format!("available_parallelism: {}\n", parallelism));
    }
    if let Some(err) = &ctx.error {
        out.push_str(&format!("error: {}\n", err));
    }
    out
}

/// Render the report for an output directory without writing it.
pub fn render_report(output_dir: &Path, ctx: &ReportContext) -> String {
    let paths = RunPaths::new(output_dir);
    let mut out = format!("phylolab report file for run {}\n", output_dir.display());
    write_header(&mut out, "Environment");
    out.push_str(&environment(ctx));

    for log in matching_files(output_dir, |n| is_incremental(n, MAIN_LOG_NAME)) {
        extract_file(&mut out, &log, "MainLogs");
    }
    let run_dirs = paths.engine_run_dirs();
    for (step, dir) in &run_dirs {
        for log in matching_files(dir, |n| is_incremental(n, "logs")) {
            extract_file(&mut out, &log, &format!("{} logs", step));
        }
    }
    for (step, dir) in &run_dirs {
        for batch in matching_files(dir, |n| n.ends_with("_command.txt")) {
            extract_file(&mut out, &batch, &format!("{} commands", step));
        }
        let failures = dir.join("failed_commands.txt");
        if failures.is_file() {
            extract_file(&mut out, &failures, &format!("{} failed commands", step));
        }
    }
    let rejected = paths.rejected();
    if rejected.is_file() {
        extract_file(&mut out, &rejected, "rejected datasets");
    }
    out
}

pub fn write_report(output_dir: &Path, ctx: &ReportContext) -> Result<PathBuf> {
    let target = RunPaths::new(output_dir).report();
    atomic_write_bytes(&target, render_report(output_dir, ctx).as_bytes())?;
    Ok(target)
}
