use crate::error::{PipelineError, Result};
use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| PipelineError::io(path, e))
}

fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "staged".to_string());
    path.with_file_name(format!(
        ".{}.partial.{}.{}",
        name,
        std::process::id(),
        Utc::now().timestamp_micros()
    ))
}

/// Fill a staging file next to `path` with `fill`, then rename it into
/// place. Readers see either the old file or the complete new one.
fn replace_with<T>(path: &Path, fill: impl FnOnce(&mut fs::File) -> std::io::Result<T>) -> Result<T> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        ensure_dir(parent)?;
    }
    let staged = staging_path(path);
    let outcome = fs::File::create(&staged).and_then(|mut file| {
        let value = fill(&mut file)?;
        file.sync_all()?;
        fs::rename(&staged, path)?;
        Ok(value)
    });
    let value = outcome.map_err(|e| {
        let _ = fs::remove_file(&staged);
        PipelineError::io(path, e)
    })?;
    if let Some(dir) = parent.and_then(|p| fs::File::open(p).ok()) {
        let _ = dir.sync_all();
    }
    Ok(value)
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    replace_with(path, |file| file.write_all(bytes))
}

/// Stream `from` into `to` atomically. Returns the number of bytes copied.
pub fn atomic_copy(from: &Path, to: &Path) -> Result<u64> {
    let mut source = fs::File::open(from).map_err(|e| PipelineError::io(from, e))?;
    replace_with(to, |file| std::io::copy(&mut source, file))
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

pub fn append_lines(path: &Path, lines: &[String]) -> Result<()> {
    if lines.is_empty() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| PipelineError::io(path, e))?;
    for line in lines {
        writeln!(file, "{}", line).map_err(|e| PipelineError::io(path, e))?;
    }
    Ok(())
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Digest of a JSON value with object keys in sorted order.
pub fn canonical_json_digest(value: &Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    sha256_bytes(&bytes)
}

/// `<dir>/<name>.<ext>`, or `<dir>/<name>_<n>.<ext>` for the first free `n`,
/// so a resumed run never overwrites the logs of an earlier attempt.
pub fn incremental_path(dir: &Path, name: &str, ext: &str) -> PathBuf {
    let mut candidate = dir.join(format!("{}.{}", name, ext));
    let mut index = 1;
    while candidate.exists() {
        candidate = dir.join(format!("{}_{}.{}", name, index, ext));
        index += 1;
    }
    candidate
}

/// Fresh scratch directory under the system temp dir.
pub fn scratch_dir(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "phylolab_{}_{}_{}",
        label,
        std::process::id(),
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    let _ = fs::create_dir_all(&dir);
    dir
}
