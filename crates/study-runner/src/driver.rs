use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use crate::config::StudyConfig;
use crate::ensure_dir;
use crate::error::StudyError;
use crate::exec::{ExecutionContext, ExecutionRunner};
use crate::plot::ScalingChart;
use crate::queue::{QueueClient, QueueJob};
use crate::store::{self, ResultStore, ResultTable};
use crate::sweep::SweepPlan;
use crate::target::{TargetRegistry, Variant};

const X_AXIS_LABEL: &str = "Number of Processes / Threads";
const Y_AXIS_LABEL: &str = "Average Execution Time (s)";

/// Aggregate outcome of one study run: where the records and chart
/// landed, and how many configuration points failed along the way.
#[derive(Debug)]
pub struct StudyReport {
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub tables: Vec<PathBuf>,
    pub chart: Option<PathBuf>,
    pub measured_points: usize,
    pub failed_points: usize,
}

/// Owns the study lifecycle: enumerate, execute, persist, render.
/// Strictly sequential; one configuration's repetitions finish before
/// the next starts, and one variant's sweep finishes before the next
/// variant begins.
pub struct StudyDriver {
    config: StudyConfig,
    config_path: PathBuf,
    ctx: ExecutionContext,
    registry: TargetRegistry,
    store: ResultStore,
}

impl StudyDriver {
    /// Study-wide setup. A results directory that cannot be created is
    /// fatal to the whole study, unlike any per-point failure.
    pub fn new(config: StudyConfig, config_path: &Path) -> Result<StudyDriver> {
        let ctx = ExecutionContext::from_config(&config);
        ensure_dir(&ctx.artifact_dir)
            .map_err(|err| StudyError::Setup(err.to_string()))?;
        let registry = TargetRegistry::from_config(&config);
        let store = ResultStore::new(&ctx.artifact_dir);
        Ok(StudyDriver {
            config,
            config_path: config_path.to_path_buf(),
            ctx,
            registry,
            store,
        })
    }

    pub fn config(&self) -> &StudyConfig {
        &self.config
    }

    /// Runs the full study over the requested variants (all configured
    /// variants when empty) and renders the comparison chart. Errors
    /// local to one variant's sweep are reported and skipped; the chart
    /// is best-effort over whatever succeeded.
    pub fn run(&self, variants: &[Variant], interrupt: &AtomicBool) -> Result<StudyReport> {
        let started_at = Utc::now();
        let variants = if variants.is_empty() {
            self.config.configured_variants()
        } else {
            variants.to_vec()
        };

        let mut chart = ScalingChart::new(X_AXIS_LABEL, Y_AXIS_LABEL, true);
        let mut report = StudyReport {
            started_at,
            tables: Vec::new(),
            chart: None,
            measured_points: 0,
            failed_points: 0,
        };

        for variant in variants {
            let tables = if variant.is_distributed() && self.config.queue.enabled {
                match self.run_variant_queued(variant, interrupt) {
                    Ok(tables) => tables,
                    Err(err)
                        if matches!(
                            err.downcast_ref::<StudyError>(),
                            Some(StudyError::Submission { .. }) | Some(StudyError::Interrupted)
                        ) =>
                    {
                        // Cancellation already ran; nothing further can
                        // complete, so the study aborts.
                        return Err(err);
                    }
                    Err(err) => {
                        warn!(target: "study", "{}: sweep skipped: {}", variant, err);
                        continue;
                    }
                }
            } else {
                match self.run_variant_local(variant) {
                    Ok(tables) => tables,
                    Err(err) => {
                        warn!(target: "study", "{}: sweep skipped: {}", variant, err);
                        continue;
                    }
                }
            };

            for table in tables {
                report.measured_points += table.len() - table.failed_count();
                report.failed_points += table.failed_count();
                match self.store.write(&table) {
                    Ok(path) => report.tables.push(path),
                    Err(err) => warn!(target: "study", "{}: cannot persist record: {}", variant, err),
                }
                add_table_series(&mut chart, &table);
            }
        }

        let chart_path = self.chart_path();
        match chart.finalize(&chart_path) {
            Ok(()) => {
                info!(target: "study", "chart written to {}", chart_path.display());
                report.chart = Some(chart_path);
            }
            Err(err) => warn!(target: "study", "chart rendering failed: {}", err),
        }
        Ok(report)
    }

    /// One variant, local execution. Direct variants produce a single
    /// table; the distributed family produces one per declared node
    /// count.
    fn run_variant_local(&self, variant: Variant) -> Result<Vec<ResultTable>> {
        let spec = self.registry.resolve(variant)?;
        let runner = ExecutionRunner::new(&self.ctx);
        if variant.is_distributed() {
            let node_counts = &self.config.sweeps.node_counts;
            if node_counts.is_empty() {
                return Err(StudyError::Config(format!(
                    "no sweep range declared for `sweeps.node_counts` (target `{}`)",
                    variant
                ))
                .into());
            }
            let mut tables = Vec::with_capacity(node_counts.len());
            for &node_count in node_counts {
                let plan = SweepPlan::distributed_at(node_count, &self.config.sweeps)?;
                tables.push(runner.run_sweep(spec, &plan, Some(node_count)));
            }
            Ok(tables)
        } else {
            let plan = SweepPlan::for_variant(variant, &self.config.sweeps)?;
            Ok(vec![runner.run_sweep(spec, &plan, None)])
        }
    }

    /// One distributed variant through the batch queue: submit a job
    /// per node count, block until the queue drains, then collect
    /// whatever records the remote runs left behind. A missing record
    /// is a gap, not a failure.
    fn run_variant_queued(
        &self,
        variant: Variant,
        interrupt: &AtomicBool,
    ) -> Result<Vec<ResultTable>> {
        self.registry.resolve(variant)?;
        let node_counts = &self.config.sweeps.node_counts;
        if node_counts.is_empty() {
            return Err(StudyError::Config(format!(
                "no sweep range declared for `sweeps.node_counts` (target `{}`)",
                variant
            ))
            .into());
        }
        let client = QueueClient::from_config(&self.config.queue)?;
        let jobs = self.queue_jobs(variant, node_counts)?;
        client.submit_all(&jobs)?;
        client.wait_for_drain(interrupt)?;

        let mut tables = Vec::new();
        for &node_count in node_counts {
            let table = self.store.read(variant, Some(node_count))?;
            if table.is_empty() {
                warn!(
                    target: "study",
                    "{}: no record for {} node(s); remote job may have failed",
                    variant,
                    node_count
                );
                continue;
            }
            tables.push(table);
        }
        Ok(tables)
    }

    /// Runs the queued sweep for one distributed variant and returns
    /// the collected tables without touching the chart. The public
    /// entry behind `study submit`.
    pub fn submit_distributed(
        &self,
        variant: Variant,
        interrupt: &AtomicBool,
    ) -> Result<Vec<PathBuf>> {
        if !variant.is_distributed() {
            return Err(StudyError::Config(format!(
                "target `{}` is not a distributed variant; use `study run` or `study time`",
                variant
            ))
            .into());
        }
        let tables = self.run_variant_queued(variant, interrupt)?;
        Ok(tables
            .iter()
            .map(|t| self.store.record_path(t.variant, t.node_count))
            .collect())
    }

    /// The standalone timing tool: one variant sweep, local execution,
    /// record written to an explicit path. Also what queue jobs
    /// re-invoke on their allocation.
    pub fn run_time_target(
        &self,
        variant: Variant,
        node_count: Option<u32>,
        output: &Path,
    ) -> Result<ResultTable> {
        let spec = self.registry.resolve(variant)?;
        if variant.is_distributed() && node_count.is_none() {
            return Err(StudyError::Config(format!(
                "--nodes is required for target `{}`",
                variant
            ))
            .into());
        }
        let plan = match node_count {
            Some(n) if variant.is_distributed() => {
                SweepPlan::distributed_at(n, &self.config.sweeps)?
            }
            _ => SweepPlan::for_variant(variant, &self.config.sweeps)?,
        };
        let runner = ExecutionRunner::new(&self.ctx);
        let table = runner.run_sweep(spec, &plan, node_count.filter(|_| variant.is_distributed()));
        store::write_table(output, &table)
            .with_context(|| format!("cannot write timing record {}", output.display()))?;
        info!(
            target: "study",
            "{}: {} point(s) recorded to {} ({} failed)",
            variant,
            table.len() - table.failed_count(),
            output.display(),
            table.failed_count()
        );
        Ok(table)
    }

    /// Re-renders the comparison chart from persisted records without
    /// re-running anything. Missing records are skipped as gaps.
    pub fn replot(&self, output: Option<&Path>) -> Result<PathBuf> {
        let mut chart = ScalingChart::new(X_AXIS_LABEL, Y_AXIS_LABEL, true);
        for variant in self.config.configured_variants() {
            if variant.is_distributed() {
                for &node_count in &self.config.sweeps.node_counts {
                    let table = self.store.read(variant, Some(node_count))?;
                    if table.is_empty() {
                        continue;
                    }
                    add_table_series(&mut chart, &table);
                }
            } else {
                let table = self.store.read(variant, None)?;
                if table.is_empty() {
                    continue;
                }
                add_table_series(&mut chart, &table);
            }
        }
        let path = output
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.chart_path());
        chart.finalize(&path)?;
        Ok(path)
    }

    fn chart_path(&self) -> PathBuf {
        self.ctx.resolve(&self.config.study.chart_path)
    }

    fn queue_jobs(&self, variant: Variant, node_counts: &[u32]) -> Result<Vec<QueueJob>> {
        let per_node = &self.config.sweeps.processes_per_node;
        if per_node.is_empty() {
            return Err(StudyError::Config(
                "no sweep range declared for `sweeps.processes_per_node`".to_string(),
            )
            .into());
        }
        let tasks_per_node = per_node.iter().copied().max().unwrap_or(1);
        let harness = std::env::current_exe()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "study".to_string());
        Ok(node_counts
            .iter()
            .map(|&node_count| QueueJob {
                node_count,
                tasks_per_node,
                time_limit: self.config.queue.time_limit.clone(),
                partition: self.config.queue.partition.clone(),
                account: self.config.queue.account.clone(),
                wrapped_command: format!(
                    "{} time --target {} --nodes {} --output {} --config {}",
                    harness,
                    variant,
                    node_count,
                    self.store.record_path(variant, Some(node_count)).display(),
                    self.config_path.display()
                ),
            })
            .collect())
    }
}

fn add_table_series(chart: &mut ScalingChart, table: &ResultTable) {
    let points = table.plot_points();
    if points.is_empty() {
        return;
    }
    let label = match table.node_count {
        Some(n) => format!("{} ({} nodes)", table.variant.label(), n),
        None => table.variant.label().to_string(),
    };
    chart.add_series(label, points);
}
