//! Standalone async job executor process
//!
//! Deploys the process definitions found in a directory and runs an
//! [`AsyncExecutor`](bpmflow_engine::AsyncExecutor) against the configured
//! store until shutdown.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bpmflow_engine::model::ProcessDefinition;
use bpmflow_engine::ProcessEngine;

/// Worker process configuration
#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    /// PostgreSQL connection string; in-memory store when unset
    pub database_url: Option<String>,

    /// Directory of JSON process definitions to deploy at startup
    pub definitions_dir: Option<PathBuf>,

    /// Apply the schema migrations before starting
    pub run_migrations: bool,
}

impl WorkerConfig {
    /// Read `DATABASE_URL`, `DEFINITIONS_DIR` and `RUN_MIGRATIONS`
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            definitions_dir: std::env::var("DEFINITIONS_DIR").ok().map(PathBuf::from),
            run_migrations: std::env::var("RUN_MIGRATIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(true),
        }
    }
}

/// Parse every `*.json` file of a directory, sorted by file name
pub fn load_definitions(dir: &Path) -> Result<Vec<ProcessDefinition>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read definitions directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    paths
        .iter()
        .map(|path| {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("invalid process definition in {}", path.display()))
        })
        .collect()
}

/// Deploy every definition of `dir`; returns how many were deployed
pub fn deploy_directory(engine: &ProcessEngine, dir: &Path) -> Result<usize> {
    let definitions = load_definitions(dir)?;
    let count = definitions.len();
    for definition in definitions {
        let key = definition.key.clone();
        engine
            .deploy(definition)
            .with_context(|| format!("failed to deploy '{key}'"))?;
    }
    Ok(count)
}
