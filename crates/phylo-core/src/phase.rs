use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Parse,
    ModelSelect,
    MlSearch,
    BestTreeSelect,
    BootstrapConcat,
    SupportCompute,
    SpeciesTree,
}

pub const TERMINAL_CHECKPOINT: u8 = 7;

impl Phase {
    pub const ALL: [Phase; 7] = [
        Phase::Parse,
        Phase::ModelSelect,
        Phase::MlSearch,
        Phase::BestTreeSelect,
        Phase::BootstrapConcat,
        Phase::SupportCompute,
        Phase::SpeciesTree,
    ];

    /// Checkpoint value written once this phase has committed.
    pub fn index(self) -> u8 {
        match self {
            Phase::Parse => 1,
            Phase::ModelSelect => 2,
            Phase::MlSearch => 3,
            Phase::BestTreeSelect => 4,
            Phase::BootstrapConcat => 5,
            Phase::SupportCompute => 6,
            Phase::SpeciesTree => 7,
        }
    }

    pub fn from_index(index: u8) -> Option<Phase> {
        Phase::ALL.iter().copied().find(|p| p.index() == index)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Parse => "parse",
            Phase::ModelSelect => "model-select",
            Phase::MlSearch => "ml-search",
            Phase::BestTreeSelect => "best-tree-select",
            Phase::BootstrapConcat => "bootstrap-concat",
            Phase::SupportCompute => "support-compute",
            Phase::SpeciesTree => "species-tree",
        }
    }

    /// Prefix used for job names and batch file names of engine-driven phases.
    pub fn job_prefix(self) -> &'static str {
        match self {
            Phase::Parse => "parse",
            Phase::ModelSelect => "modeltest",
            Phase::MlSearch => "mlsearch",
            Phase::BestTreeSelect => "select",
            Phase::BootstrapConcat => "concat",
            Phase::SupportCompute => "support",
            Phase::SpeciesTree => "species",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
