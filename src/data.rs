//! Prompt datasets and the feed that cycles through them.
//!
//! A dataset file is `<data_dir>/<name>.jsonl`, one prompt object per line:
//! `{"id": "...", "tokens": [..], "answer": [..]}`.

use std::path::{Path, PathBuf};

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::rollout::Prompt;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("failed to read dataset {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}:{line}: {source}")]
    Parse {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("dataset {0} has no prompts")]
    Empty(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub name: String,
    pub prompts: Vec<Prompt>,
}

impl Dataset {
    /// Tags every prompt with the dataset name.
    pub fn new(name: impl Into<String>, mut prompts: Vec<Prompt>) -> Self {
        let name = name.into();
        for p in &mut prompts {
            p.dataset = name.clone();
        }
        Self { name, prompts }
    }

    pub fn load_jsonl(path: impl AsRef<Path>, name: &str) -> Result<Self, DataError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| DataError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut prompts = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let prompt: Prompt = serde_json::from_str(line).map_err(|source| DataError::Parse {
                path: path.to_path_buf(),
                line: idx + 1,
                source,
            })?;
            prompts.push(prompt);
        }
        if prompts.is_empty() {
            return Err(DataError::Empty(name.to_string()));
        }
        debug!(dataset = name, prompts = prompts.len(), "loaded dataset");
        Ok(Self::new(name, prompts))
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }
}

/// Load `<dir>/<name>.jsonl` for every name.
pub fn load_datasets(dir: &Path, names: &[String]) -> Result<Vec<Dataset>, DataError> {
    names
        .iter()
        .map(|name| Dataset::load_jsonl(dir.join(format!("{name}.jsonl")), name))
        .collect()
}

/// Send the training prompts forever, reshuffled every epoch.
///
/// Each draw is sent `group_size` times under one id so the copies form an
/// advantage group. Returns the number of draws once the feed is dropped.
pub async fn feed_prompts(datasets: Vec<Dataset>, group_size: usize, seed: u64, tx: mpsc::Sender<Prompt>) -> u64 {
    let mut pool: Vec<&Prompt> = datasets.iter().flat_map(|d| d.prompts.iter()).collect();
    if pool.is_empty() {
        return 0;
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut draws = 0u64;
    let mut epoch = 0u64;
    loop {
        pool.shuffle(&mut rng);
        debug!(epoch, prompts = pool.len(), "starting prompt epoch");
        for prompt in &pool {
            let mut draw = (*prompt).clone();
            draw.id = format!("{}@{}", prompt.id, draws);
            for _ in 0..group_size.max(1) {
                if tx.send(draw.clone()).await.is_err() {
                    info!(draws, epoch, "prompt feed closed");
                    return draws;
                }
            }
            draws += 1;
        }
        epoch += 1;
    }
}
