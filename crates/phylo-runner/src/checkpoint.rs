//! Checkpoint counter and persisted dataset state.

use phylo_core::{
    atomic_write_bytes, Dataset, PipelineError, Result, DATASET_SCHEMA_VERSION,
    TERMINAL_CHECKPOINT,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Last completed phase index. A missing or unreadable file means nothing
/// has completed yet.
pub fn read_checkpoint(path: &Path) -> Result<u8> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(PipelineError::io(path, e)),
    };
    let value = raw.trim().parse::<u64>().unwrap_or(0);
    Ok(value.min(u64::from(TERMINAL_CHECKPOINT)) as u8)
}

pub fn write_checkpoint(path: &Path, value: u8) -> Result<()> {
    atomic_write_bytes(path, format!("{}\n", value).as_bytes())
}

#[derive(Serialize, Deserialize)]
struct DatasetRecord {
    schema_version: String,
    #[serde(flatten)]
    dataset: Dataset,
}

pub fn save_datasets(path: &Path, datasets: &BTreeMap<String, Dataset>) -> Result<()> {
    let mut out = String::new();
    for dataset in datasets.values() {
        let record = DatasetRecord {
            schema_version: DATASET_SCHEMA_VERSION.to_string(),
            dataset: dataset.clone(),
        };
        out.push_str(&serde_json::to_string(&record)?);
        out.push('\n');
    }
    atomic_write_bytes(path, out.as_bytes())
}

pub fn load_datasets(path: &Path) -> Result<BTreeMap<String, Dataset>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(PipelineError::config(format!(
                "cannot resume: dataset state {} is missing",
                path.display()
            )))
        }
        Err(e) => return Err(PipelineError::io(path, e)),
    };
    let mut datasets = BTreeMap::new();
    for (idx, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: DatasetRecord = serde_json::from_str(line)?;
        if record.schema_version != DATASET_SCHEMA_VERSION {
            return Err(PipelineError::config(format!(
                "{} line {}: unsupported schema_version '{}'",
                path.display(),
                idx + 1,
                record.schema_version
            )));
        }
        datasets.insert(record.dataset.name.clone(), record.dataset);
    }
    Ok(datasets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use phylo_core::scratch_dir;

    #[test]
    fn checkpoint_defaults_and_clamps() {
        let root = scratch_dir("checkpoint");
        let path = root.join("checkpoint");
        assert_eq!(read_checkpoint(&path).expect("missing"), 0);
        fs::write(&path, "garbage").expect("write");
        assert_eq!(read_checkpoint(&path).expect("garbage"), 0);
        fs::write(&path, "99\n").expect("write");
        assert_eq!(read_checkpoint(&path).expect("clamped"), TERMINAL_CHECKPOINT);
        write_checkpoint(&path, 3).expect("write");
        assert_eq!(read_checkpoint(&path).expect("read"), 3);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn dataset_state_survives_a_reload() {
        let root = scratch_dir("dataset_state");
        let path = root.join("datasets.jsonl");
        let mut datasets = BTreeMap::new();
        let mut a = Dataset::new("a", "/msas/a.fasta");
        a.taxa = 12;
        a.unit_size = 40;
        a.cores = 2;
        a.set_model("GTR+G");
        let mut b = Dataset::new("b", "/msas/b.fasta");
        b.reject("parse: missing log");
        datasets.insert("a".to_string(), a);
        datasets.insert("b".to_string(), b);
        save_datasets(&path, &datasets).expect("save");

        let text = fs::read_to_string(&path).expect("read");
        assert_eq!(text.lines().count(), 2);
        assert!(text.lines().all(|l| l.contains("\"schema_version\":\"dataset_v1\"")));
        assert_eq!(load_datasets(&path).expect("load"), datasets);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn unknown_schema_version_is_rejected() {
        let root = scratch_dir("dataset_schema");
        let path = root.join("datasets.jsonl");
        let mut datasets = BTreeMap::new();
        datasets.insert("a".to_string(), Dataset::new("a", "/msas/a"));
        save_datasets(&path, &datasets).expect("save");
        let text = fs::read_to_string(&path)
            .expect("read")
            .replace("dataset_v1", "dataset_v9");
        fs::write(&path, text).expect("rewrite");
        let err = load_datasets(&path).expect_err("schema");
        assert!(err.to_string().contains("dataset_v9"));
        assert!(load_datasets(&root.join("absent.jsonl")).is_err());
        let _ = fs::remove_dir_all(root);
    }
}
