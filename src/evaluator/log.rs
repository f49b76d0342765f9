use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::errors::EvalError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalResult {
    /// Pipeline run that produced the result. Weight versions restart at 1
    /// every run, so records are only comparable within one run.
    #[serde(default)]
    pub run_id: Uuid,
    pub dataset_name: String,
    pub weight_version: u64,
    pub step: u64,
    /// Mean score over the prompts that produced a completion.
    pub aggregate_score: f64,
    pub num_prompts: usize,
    pub num_failed: usize,
}

/// Append-only record of evaluation results, one JSON object per line.
///
/// Each log value belongs to one run. Within that run results are keyed by
/// `(dataset_name, weight_version)`; records left in the file by earlier runs
/// are checked and kept but never collide with the current run.
#[derive(Debug)]
pub struct EvalLog {
    path: Option<PathBuf>,
    run_id: Uuid,
    results: Vec<EvalResult>,
    keys: HashSet<(String, u64)>,
}

impl EvalLog {
    /// Keep results in memory only.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            run_id: Uuid::new_v4(),
            results: Vec::new(),
            keys: HashSet::new(),
        }
    }

    /// Open (or create) the log at `path` for a new run, appending after
    /// whatever earlier runs recorded.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EvalError> {
        let path = path.as_ref().to_path_buf();
        let io = |source| EvalError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io)?;
        }

        let mut earlier = 0usize;
        if path.exists() {
            let text = fs::read_to_string(&path).map_err(io)?;
            for (idx, line) in text.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                serde_json::from_str::<EvalResult>(line)
                    .map_err(|source| EvalError::Corrupt { line: idx + 1, source })?;
                earlier += 1;
            }
        }

        let log = Self {
            path: Some(path),
            ..Self::in_memory()
        };
        info!(run_id = %log.run_id, earlier, "opened evaluation log");
        Ok(log)
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn results(&self) -> &[EvalResult] {
        &self.results
    }

    pub fn contains(&self, dataset_name: &str, weight_version: u64) -> bool {
        self.keys.contains(&(dataset_name.to_string(), weight_version))
    }

    /// Record `result` under this run. A second record for the same key is
    /// rejected.
    pub fn append(&mut self, mut result: EvalResult) -> Result<(), EvalError> {
        result.run_id = self.run_id;
        if self.contains(&result.dataset_name, result.weight_version) {
            return Err(EvalError::Duplicate {
                dataset: result.dataset_name,
                version: result.weight_version,
            });
        }

        if let Some(path) = &self.path {
            let line = serde_json::to_string(&result)?;
            let io = |source| EvalError::Io {
                path: path.clone(),
                source,
            };
            let mut file = OpenOptions::new().create(true).append(true).open(path).map_err(io)?;
            writeln!(file, "{line}").map_err(io)?;
        }
        self.insert(result)
    }

    fn insert(&mut self, result: EvalResult) -> Result<(), EvalError> {
        let key = (result.dataset_name.clone(), result.weight_version);
        if !self.keys.insert(key) {
            return Err(EvalError::Duplicate {
                dataset: result.dataset_name,
                version: result.weight_version,
            });
        }
        self.results.push(result);
        Ok(())
    }
}
