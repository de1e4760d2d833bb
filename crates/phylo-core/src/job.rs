//! Job descriptors and the batch file the execution engine consumes.
//!
//! One line per job: `<name> <cores> <weight> <args...>`. The engine splits on
//! whitespace and uses `name` verbatim for its per-job output paths, so the
//! column layout must not drift.

use crate::error::{PipelineError, Result};
use crate::fsutil::atomic_write_bytes;
use std::collections::BTreeSet;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDescriptor {
    pub name: String,
    pub cores: u32,
    pub weight: u64,
    pub args: String,
}

impl JobDescriptor {
    pub fn new(name: impl Into<String>, cores: u32, weight: u64, args: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cores,
            weight,
            args: args.into(),
        }
    }

    pub fn to_line(&self) -> String {
        let args = self.args.split_whitespace().collect::<Vec<_>>().join(" ");
        if args.is_empty() {
            format!("{} {} {}", self.name, self.cores, self.weight)
        } else {
            format!("{} {} {} {}", self.name, self.cores, self.weight, args)
        }
    }

    pub fn parse_line(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let name = parts
            .next()
            .ok_or_else(|| PipelineError::config("empty job line"))?;
        let cores = parts
            .next()
            .and_then(|s| s.parse::<u32>().ok())
            .ok_or_else(|| PipelineError::config(format!("job line missing cores: {}", line)))?;
        let weight = parts
            .next()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| PipelineError::config(format!("job line missing weight: {}", line)))?;
        Ok(Self {
            name: name.to_string(),
            cores,
            weight,
            args: parts.collect::<Vec<_>>().join(" "),
        })
    }
}

/// All jobs of one phase. Names are unique within a batch.
#[derive(Debug, Clone, Default)]
pub struct JobBatch {
    jobs: Vec<JobDescriptor>,
    names: BTreeSet<String>,
}

impl JobBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, job: JobDescriptor) -> Result<()> {
        if job.name.is_empty() || job.name.chars().any(char::is_whitespace) {
            return Err(PipelineError::config(format!(
                "invalid job name '{}'",
                job.name
            )));
        }
        if job.cores == 0 {
            return Err(PipelineError::config(format!(
                "job {} requests zero cores",
                job.name
            )));
        }
        if !self.names.insert(job.name.clone()) {
            return Err(PipelineError::config(format!(
                "duplicate job name '{}'",
                job.name
            )));
        }
        self.jobs.push(job);
        Ok(())
    }

    pub fn jobs(&self) -> &[JobDescriptor] {
        &self.jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for job in &self.jobs {
            out.push_str(&job.to_line());
            out.push('\n');
        }
        out
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        atomic_write_bytes(path, self.render().as_bytes())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        let mut batch = Self::new();
        for line in data.lines() {
            if line.trim().is_empty() {
                continue;
            }
            batch.push(JobDescriptor::parse_line(line)?)?;
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_layout_is_name_cores_weight_args() {
        let job = JobDescriptor::new("mlsearch_g1_0", 4, 1200, " --msa  a.rba --seed 1 ");
        assert_eq!(job.to_line(), "mlsearch_g1_0 4 1200 --msa a.rba --seed 1");
        let back = JobDescriptor::parse_line(&job.to_line()).expect("parse");
        assert_eq!(back.name, "mlsearch_g1_0");
        assert_eq!(back.cores, 4);
        assert_eq!(back.weight, 1200);
        assert_eq!(back.args, "--msa a.rba --seed 1");
    }

    #[test]
    fn batch_rejects_duplicate_and_blank_names() {
        let mut batch = JobBatch::new();
        batch
            .push(JobDescriptor::new("parse_a", 1, 1, "--parse"))
            .expect("first");
        assert!(batch
            .push(JobDescriptor::new("parse_a", 1, 1, "--parse"))
            .is_err());
        assert!(batch.push(JobDescriptor::new("bad name", 1, 1, "")).is_err());
        assert!(batch.push(JobDescriptor::new("zero", 0, 1, "")).is_err());
        assert_eq!(batch.len(), 1);
    }
}
