//! Tracing setup and metric formatting.

use std::fs::{self, File};
use std::path::Path;
use std::sync::Mutex;

use serde_json::Value;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber: console output filtered by `RUST_LOG`
/// (default `info`), plus a plain-text copy in `<log_dir>/info.log` when a
/// directory is given.
///
/// A second call leaves the first subscriber in place.
pub fn init(log_dir: Option<&Path>) -> std::io::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let console = fmt::layer().with_target(false);

    let file = match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let file = File::create(dir.join("info.log"))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    if tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .is_err()
    {
        debug!("tracing subscriber already installed");
    }
    Ok(())
}

/// Render metrics as `name=value` pairs with three decimals.
pub fn format_metrics(metrics: &[(&str, f64)]) -> String {
    metrics
        .iter()
        .map(|(name, value)| format!("{name}={value:.3}"))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn log_metrics(step: u64, metrics: &[(&str, f64)]) {
    info!(step, metrics = %format_metrics(metrics), "train step");
}

/// Flatten a JSON value into dotted keys, sorted.
pub fn flatten_config(value: &Value) -> Vec<(String, String)> {
    fn walk(prefix: &str, value: &Value, out: &mut Vec<(String, String)>) {
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    let path = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{prefix}.{key}")
                    };
                    walk(&path, child, out);
                }
            }
            other => out.push((prefix.to_string(), other.to_string())),
        }
    }

    let mut out = Vec::new();
    walk("", value, &mut out);
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_format_metrics() {
        let line = format_metrics(&[("loss", 0.12345), ("lr", 1.0), ("kl", -0.5)]);
        assert_eq!(line, "loss=0.123 lr=1.000 kl=-0.500");
    }

    #[test]
    fn test_flatten_config() {
        let flat = flatten_config(&json!({
            "seed": 42,
            "actor": {"chunk_size": 8, "submit_delay": 1.0},
            "finetune": {"max_lag": null},
            "train_dataset_names": ["a", "b"]
        }));
        assert_eq!(
            flat,
            vec![
                ("actor.chunk_size".to_string(), "8".to_string()),
                ("actor.submit_delay".to_string(), "1.0".to_string()),
                ("finetune.max_lag".to_string(), "null".to_string()),
                ("seed".to_string(), "42".to_string()),
                ("train_dataset_names".to_string(), "[\"a\",\"b\"]".to_string()),
            ]
        );
    }

    #[test]
    fn test_init_creates_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("log");
        init(Some(&log_dir)).unwrap();
        assert!(log_dir.join("info.log").exists());
        // Idempotent.
        init(None).unwrap();
    }
}
