//! Run-scoped logging context.
//!
//! One `RunLog` is built per run and handed to every component. Events go to
//! `tracing` (whatever subscriber the binary installed) and are mirrored into
//! the run's own log file, so the output directory is self-describing.

use chrono::Utc;
use phylo_core::{ensure_dir, incremental_path, PipelineError, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const MAIN_LOG_NAME: &str = "phylo_logs";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Info,
    Warn,
    Error,
}

pub struct RunLog {
    started: Instant,
    path: Option<PathBuf>,
    sink: Option<Mutex<fs::File>>,
    warnings: Mutex<Vec<String>>,
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

impl RunLog {
    /// Log into `<dir>/phylo_logs.txt`, or the next free incremental name.
    pub fn in_dir(dir: &Path) -> Result<Self> {
        ensure_dir(dir)?;
        let path = incremental_path(dir, MAIN_LOG_NAME, "txt");
        let file = fs::File::create(&path).map_err(|e| PipelineError::io(&path, e))?;
        Ok(Self {
            started: Instant::now(),
            path: Some(path),
            sink: Some(Mutex::new(file)),
            warnings: Mutex::new(Vec::new()),
        })
    }

    /// Forward to `tracing` only.
    pub fn detached() -> Self {
        Self {
            started: Instant::now(),
            path: None,
            sink: None,
            warnings: Mutex::new(Vec::new()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn emit(&self, level: Level, msg: &str) {
        match level {
            Level::Info => tracing::info!("{}", msg),
            Level::Warn => tracing::warn!("{}", msg),
            Level::Error => tracing::error!("{}", msg),
        }
        if let Some(sink) = &self.sink {
            let tag = match level {
                Level::Info => "",
                Level::Warn => "[Warning] ",
                Level::Error => "[Error] ",
            };
            if let Ok(mut file) = sink.lock() {
                let _ = writeln!(file, "{}{}", tag, msg);
            }
        }
    }

    pub fn info(&self, msg: impl AsRef<str>) {
        self.emit(Level::Info, msg.as_ref());
    }

    pub fn warn(&self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        if let Ok(mut w) = self.warnings.lock() {
            w.push(msg.to_string());
        }
        self.emit(Level::Warn, msg);
    }

    pub fn error(&self, msg: impl AsRef<str>) {
        self.emit(Level::Error, msg.as_ref());
    }

    /// Info line prefixed with the time elapsed since the run started.
    pub fn timed(&self, msg: impl AsRef<str>) {
        let line = format!("[{}] {}", format_elapsed(self.elapsed()), msg.as_ref());
        self.emit(Level::Info, &line);
    }

    pub fn header(&self, version: &str, args: &[String]) {
        self.info("########################");
        self.info(format!("#   PHYLOLAB {:<8}  #", version));
        self.info("########################");
        self.info(format!("started at {}", Utc::now().to_rfc3339()));
        if !args.is_empty() {
            self.info(format!("called as: {}", args.join(" ")));
        }
    }

    pub fn warnings(&self) -> Vec<String> {
        self.warnings.lock().map(|w| w.clone()).unwrap_or_default()
    }
}
