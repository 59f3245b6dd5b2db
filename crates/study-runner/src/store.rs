use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ensure_dir;
use crate::exec::TimingSample;
use crate::sweep::ConfigurationPoint;
use crate::target::Variant;

/// Column schema per variant family. A compile-time contract: rows are
/// typed records, never string-keyed maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaFamily {
    /// `thread_count,execution_time` (serial, omp)
    Thread,
    /// `processes_per_node,total_processes,execution_time` (mpi, cuda_mpi)
    Process,
    /// `block_size,execution_time` (cuda)
    Block,
}

#[derive(Debug, Serialize, Deserialize)]
struct ThreadRow {
    thread_count: u32,
    execution_time: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ProcessRow {
    processes_per_node: u32,
    total_processes: u32,
    execution_time: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct BlockRow {
    block_size: u32,
    execution_time: f64,
}

/// Timing rows for one variant (and, for the distributed family, one
/// node count), in the order the sweep produced them.
#[derive(Debug, Clone)]
pub struct ResultTable {
    pub variant: Variant,
    pub node_count: Option<u32>,
    rows: Vec<(ConfigurationPoint, TimingSample)>,
}

impl ResultTable {
    pub fn new(variant: Variant, node_count: Option<u32>) -> ResultTable {
        ResultTable {
            variant,
            node_count,
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, point: ConfigurationPoint, sample: TimingSample) {
        self.rows.push((point, sample));
    }

    pub fn rows(&self) -> &[(ConfigurationPoint, TimingSample)] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn failed_count(&self) -> usize {
        self.rows.iter().filter(|(_, s)| !s.is_success()).count()
    }

    /// Successful rows as chart points. X is the total process count
    /// for the distributed family, the swept value otherwise.
    pub fn plot_points(&self) -> Vec<(f64, f64)> {
        self.rows
            .iter()
            .filter_map(|(point, sample)| {
                let x = point.total_processes().unwrap_or_else(|| point.axis_value());
                sample.seconds().map(|y| (f64::from(x), y))
            })
            .collect()
    }
}

/// Tabular persistence of timing records, one CSV file per variant and,
/// for the distributed family, per node count.
#[derive(Debug, Clone)]
pub struct ResultStore {
    dir: PathBuf,
}

impl ResultStore {
    pub fn new(dir: impl Into<PathBuf>) -> ResultStore {
        ResultStore { dir: dir.into() }
    }

    pub fn record_path(&self, variant: Variant, node_count: Option<u32>) -> PathBuf {
        match node_count {
            Some(n) => self.dir.join(format!("{}_nodes_{}.csv", variant, n)),
            None => self.dir.join(format!("{}.csv", variant)),
        }
    }

    /// Replaces the table's backing record with its current rows.
    /// Failed samples are omitted entirely; a failure never serializes
    /// as a zero or null execution time.
    pub fn write(&self, table: &ResultTable) -> Result<PathBuf> {
        ensure_dir(&self.dir)?;
        let path = self.record_path(table.variant, table.node_count);
        write_table(&path, table)?;
        Ok(path)
    }

    /// Reconstructs a table by reparsing the persisted record. A
    /// missing record is a non-fatal gap: the read yields an empty
    /// table so partial studies can still be plotted.
    pub fn read(&self, variant: Variant, node_count: Option<u32>) -> Result<ResultTable> {
        let path = self.record_path(variant, node_count);
        read_table(&path, variant, node_count)
    }
}

/// Writes a table to an explicit path, outside the store's naming
/// convention. Used by the standalone timing tool.
pub fn write_table(path: &Path, table: &ResultTable) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_dir(parent)?;
        }
    }
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("cannot open record {}", path.display()))?;
    for (point, sample) in table.rows() {
        let seconds = match sample.seconds() {
            Some(seconds) => seconds,
            None => continue,
        };
        match table.variant.schema() {
            SchemaFamily::Thread => writer.serialize(ThreadRow {
                thread_count: point.axis_value(),
                execution_time: seconds,
            })?,
            SchemaFamily::Process => writer.serialize(ProcessRow {
                processes_per_node: point.axis_value(),
                total_processes: point.total_processes().unwrap_or_else(|| point.axis_value()),
                execution_time: seconds,
            })?,
            SchemaFamily::Block => writer.serialize(BlockRow {
                block_size: point.axis_value(),
                execution_time: seconds,
            })?,
        }
    }
    writer
        .flush()
        .with_context(|| format!("cannot flush record {}", path.display()))?;
    Ok(())
}

pub fn read_table(
    path: &Path,
    variant: Variant,
    node_count: Option<u32>,
) -> Result<ResultTable> {
    let mut table = ResultTable::new(variant, node_count);
    if !path.exists() {
        return Ok(table);
    }
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("cannot open record {}", path.display()))?;
    match variant.schema() {
        SchemaFamily::Thread => {
            for row in reader.deserialize() {
                let row: ThreadRow =
                    row.with_context(|| format!("malformed row in {}", path.display()))?;
                table.push(
                    ConfigurationPoint::ThreadCount(row.thread_count),
                    TimingSample::Success {
                        seconds: row.execution_time,
                    },
                );
            }
        }
        SchemaFamily::Process => {
            for row in reader.deserialize() {
                let row: ProcessRow =
                    row.with_context(|| format!("malformed row in {}", path.display()))?;
                let nodes = node_count.unwrap_or_else(|| {
                    if row.processes_per_node == 0 {
                        1
                    } else {
                        row.total_processes / row.processes_per_node
                    }
                });
                table.push(
                    ConfigurationPoint::Processes {
                        per_node: row.processes_per_node,
                        node_count: nodes,
                    },
                    TimingSample::Success {
                        seconds: row.execution_time,
                    },
                );
            }
        }
        SchemaFamily::Block => {
            for row in reader.deserialize() {
                let row: BlockRow =
                    row.with_context(|| format!("malformed row in {}", path.display()))?;
                table.push(
                    ConfigurationPoint::BlockSize(row.block_size),
                    TimingSample::Success {
                        seconds: row.execution_time,
                    },
                );
            }
        }
    }
    Ok(table)
}
