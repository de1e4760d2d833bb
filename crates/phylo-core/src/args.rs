//! Structured tool arguments.
//!
//! Arguments coming from global parameter files, per-dataset override files
//! and the pipeline itself are kept as a list of entries and only flattened
//! into a string when a job line is emitted.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const MODEL_FLAG: &str = "--model";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArgEntry {
    Opt { key: String, value: Option<String> },
    Positional { value: String },
}

impl ArgEntry {
    fn render_into(&self, out: &mut Vec<String>) {
        match self {
            ArgEntry::Opt { key, value } => {
                out.push(key.clone());
                if let Some(v) = value {
                    out.push(v.clone());
                }
            }
            ArgEntry::Positional { value } => out.push(value.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolArgs {
    entries: Vec<ArgEntry>,
}

fn looks_like_flag(token: &str) -> bool {
    token.starts_with('-') && token.parse::<f64>().is_err()
}

impl ToolArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(raw: &str) -> Self {
        let mut args = Self::new();
        args.append_raw(raw);
        args
    }

    /// Append a whitespace-separated argument tail, e.g. one line of an
    /// override file. `--key value` pairs become one entry.
    pub fn append_raw(&mut self, raw: &str) {
        let tokens: Vec<&str> = raw.split_whitespace().collect();
        let mut i = 0;
        while i < tokens.len() {
            let tok = tokens[i];
            if looks_like_flag(tok) {
                let value = tokens
                    .get(i + 1)
                    .filter(|next| !looks_like_flag(next))
                    .map(|s| s.to_string());
                i += if value.is_some() { 2 } else { 1 };
                self.entries.push(ArgEntry::Opt {
                    key: tok.to_string(),
                    value,
                });
            } else {
                self.entries.push(ArgEntry::Positional {
                    value: tok.to_string(),
                });
                i += 1;
            }
        }
    }

    pub fn push_flag(&mut self, key: &str) {
        self.entries.push(ArgEntry::Opt {
            key: key.to_string(),
            value: None,
        });
    }

    pub fn push_opt(&mut self, key: &str, value: impl Into<String>) {
        self.entries.push(ArgEntry::Opt {
            key: key.to_string(),
            value: Some(value.into()),
        });
    }

    /// Value of the last occurrence of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.iter().rev().find_map(|e| match e {
            ArgEntry::Opt { key: k, value } if k == key => value.as_deref(),
            _ => None,
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .iter()
            .any(|e| matches!(e, ArgEntry::Opt { key: k, .. } if k == key))
    }

    /// Replace every occurrence of `key` with `value`, or append it.
    pub fn set(&mut self, key: &str, value: &str) {
        let mut found = false;
        for entry in self.entries.iter_mut() {
            if let ArgEntry::Opt { key: k, value: v } = entry {
                if k == key {
                    *v = Some(value.to_string());
                    found = true;
                }
            }
        }
        if !found {
            self.push_opt(key, value);
        }
    }

    pub fn model(&self) -> Option<&str> {
        self.get(MODEL_FLAG)
    }

    pub fn set_model(&mut self, model: &str) {
        self.set(MODEL_FLAG, model);
    }

    pub fn extend(&mut self, other: &ToolArgs) {
        self.entries.extend(other.entries.iter().cloned());
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ArgEntry] {
        &self.entries
    }

    pub fn tokens(&self) -> Vec<String> {
        let mut out = Vec::new();
        for e in &self.entries {
            e.render_into(&mut out);
        }
        out
    }

    pub fn render(&self) -> String {
        self.tokens().join(" ")
    }
}

impl fmt::Display for ToolArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pairs_flags_and_negative_numbers() {
        let args = ToolArgs::parse("--model GTR+G --blopt nr_safe --force -x -1.5 extra");
        assert_eq!(args.model(), Some("GTR+G"));
        assert_eq!(args.get("--blopt"), Some("nr_safe"));
        assert!(args.contains("--force"));
        assert_eq!(args.get("-x"), Some("-1.5"));
        assert_eq!(
            args.render(),
            "--model GTR+G --blopt nr_safe --force -x -1.5 extra"
        );
    }

    #[test]
    fn set_model_replaces_existing_value() {
        let mut args = ToolArgs::parse("--model GTR --seed 3");
        args.set_model("LG+G4");
        assert_eq!(args.render(), "--model LG+G4 --seed 3");
    }

    #[test]
    fn set_model_appends_when_absent() {
        let mut args = ToolArgs::parse("--blmin 1e-6");
        args.set_model("WAG");
        assert_eq!(args.render(), "--blmin 1e-6 --model WAG");
    }

    #[test]
    fn append_raw_accumulates_overrides() {
        let mut args = ToolArgs::parse("--model GTR");
        args.append_raw("  --prob-msa on  ");
        args.append_raw("");
        assert_eq!(args.entries().len(), 2);
        assert_eq!(args.render(), "--model GTR --prob-msa on");
    }
}
