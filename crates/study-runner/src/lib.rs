//! Sweep orchestration and measurement for the genre-reveal-party
//! k-means scaling study: enumerate configuration points per execution
//! variant, time the external targets, persist CSV records, and render
//! comparison charts.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

pub mod config;
pub mod driver;
pub mod error;
pub mod exec;
pub mod plot;
pub mod queue;
pub mod store;
pub mod sweep;
pub mod target;

pub use config::StudyConfig;
pub use driver::{StudyDriver, StudyReport};
pub use error::StudyError;
pub use exec::{ExecutionContext, ExecutionRunner, RunFailure, TimingSample};
pub use plot::{ClusterScatter, ScalingChart};
pub use queue::{QueueClient, QueueJob};
pub use store::{ResultStore, ResultTable, SchemaFamily};
pub use sweep::{ConfigurationPoint, SweepPlan};
pub use target::{TargetRegistry, TargetSpec, Variant};

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("cannot create directory {}", path.display()))?;
    Ok(())
}
