use crate::args::ToolArgs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DATASET_SCHEMA_VERSION: &str = "dataset_v1";

/// One alignment and everything derived about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    pub path: PathBuf,
    pub valid: bool,
    #[serde(default)]
    pub rejection: Option<String>,
    pub taxa: u64,
    pub patterns: u64,
    /// Per-taxon computational unit size reported by the parser.
    pub unit_size: u64,
    pub cores: u32,
    pub raxml_args: ToolArgs,
    pub modeltest_args: ToolArgs,
    #[serde(default)]
    pub binary_path: Option<PathBuf>,
    #[serde(default)]
    pub disable_sorting: bool,
}

impl Dataset {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            valid: true,
            rejection: None,
            taxa: 0,
            patterns: 0,
            unit_size: 0,
            cores: 0,
            raxml_args: ToolArgs::new(),
            modeltest_args: ToolArgs::new(),
            binary_path: None,
            disable_sorting: false,
        }
    }

    pub fn model(&self) -> Option<&str> {
        self.raxml_args.model()
    }

    pub fn set_model(&mut self, model: &str) {
        self.raxml_args.set_model(model);
    }

    pub fn has_metrics(&self) -> bool {
        self.taxa > 0 && self.unit_size > 0 && self.cores > 0
    }

    /// Flag the dataset invalid; the first reason sticks.
    pub fn reject(&mut self, reason: impl Into<String>) {
        if self.valid {
            self.rejection = Some(reason.into());
        }
        self.valid = false;
    }

    /// Re-evaluate validity from the size fields after a parse run.
    pub fn refresh_validity(&mut self) {
        if self.valid && !self.has_metrics() {
            self.reject(format!(
                "zero-sized metrics (taxa={}, unit_size={}, cores={})",
                self.taxa, self.unit_size, self.cores
            ));
        }
    }

    pub fn cost(&self) -> u64 {
        self.taxa * self.unit_size
    }

    /// Load-balancing weight for search jobs.
    pub fn weight(&self) -> u64 {
        if self.disable_sorting {
            1
        } else {
            self.cost().max(1)
        }
    }

    /// The compiled binary alignment when the parser produced one.
    pub fn alignment_input(&self) -> &Path {
        match &self.binary_path {
            Some(p) if p.exists() => p,
            _ => &self.path,
        }
    }
}

/// Derive a stable dataset name from an input file name.
pub fn dataset_name(file_name: &str) -> String {
    file_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
