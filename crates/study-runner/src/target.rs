use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::Deserialize;

use crate::config::StudyConfig;
use crate::error::StudyError;
use crate::exec::ExecutionContext;
use crate::store::SchemaFamily;
use crate::sweep::ConfigurationPoint;

const DEFAULT_LAUNCHER: &str = "mpirun";

/// One execution flavor of the clustering workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    Serial,
    Omp,
    Mpi,
    Cuda,
    CudaMpi,
}

impl Variant {
    pub const ALL: [Variant; 5] = [
        Variant::Serial,
        Variant::Omp,
        Variant::Mpi,
        Variant::Cuda,
        Variant::CudaMpi,
    ];

    /// Display label used for chart legends.
    pub fn label(&self) -> &'static str {
        match self {
            Variant::Serial => "Serial",
            Variant::Omp => "OpenMP",
            Variant::Mpi => "MPI",
            Variant::Cuda => "CUDA",
            Variant::CudaMpi => "CUDA+MPI",
        }
    }

    /// Stable identifier used in record file names and on the CLI.
    pub fn file_stem(&self) -> &'static str {
        match self {
            Variant::Serial => "serial",
            Variant::Omp => "omp",
            Variant::Mpi => "mpi",
            Variant::Cuda => "cuda",
            Variant::CudaMpi => "cuda_mpi",
        }
    }

    pub fn schema(&self) -> SchemaFamily {
        match self {
            Variant::Serial | Variant::Omp => SchemaFamily::Thread,
            Variant::Mpi | Variant::CudaMpi => SchemaFamily::Process,
            Variant::Cuda => SchemaFamily::Block,
        }
    }

    pub fn invocation(&self) -> InvocationStyle {
        match self {
            Variant::Mpi | Variant::CudaMpi => InvocationStyle::MpiLaunch,
            _ => InvocationStyle::Direct,
        }
    }

    pub fn is_distributed(&self) -> bool {
        self.invocation() == InvocationStyle::MpiLaunch
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_stem())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationStyle {
    /// Plain child process.
    Direct,
    /// Wrapped with a process-launcher prefix and a total-process flag.
    MpiLaunch,
}

/// Resolved description of one target: where its executable lives and
/// how to build its argument list. Pure data, nothing is executed.
#[derive(Debug, Clone)]
pub struct TargetSpec {
    pub variant: Variant,
    pub executable: PathBuf,
    pub launcher: Option<String>,
}

impl TargetSpec {
    /// Ordered argv for one configuration point. Positional-argument
    /// conventions are fixed per variant:
    /// serial `<exe> <data>`, omp `<exe> <data> <threads>`,
    /// cuda `<exe> <data> <block_size>`, and the distributed family
    /// `mpirun -n <total> --map-by :OVERSUBSCRIBE <exe> <data>`.
    pub fn command_line(
        &self,
        point: &ConfigurationPoint,
        ctx: &ExecutionContext,
    ) -> Vec<String> {
        let exe = self.executable.display().to_string();
        let data = ctx.data_file.display().to_string();
        match self.variant {
            Variant::Serial => vec![exe, data],
            Variant::Omp => vec![exe, data, point.axis_value().to_string()],
            Variant::Cuda => vec![exe, data, point.axis_value().to_string()],
            Variant::Mpi | Variant::CudaMpi => {
                let total = point.total_processes().unwrap_or_else(|| point.axis_value());
                vec![
                    self.launcher
                        .clone()
                        .unwrap_or_else(|| DEFAULT_LAUNCHER.to_string()),
                    "-n".to_string(),
                    total.to_string(),
                    "--map-by".to_string(),
                    ":OVERSUBSCRIBE".to_string(),
                    exe,
                    data,
                ]
            }
        }
    }
}

/// Static lookup from variant to target description, built once from
/// the study configuration.
#[derive(Debug, Clone)]
pub struct TargetRegistry {
    targets: BTreeMap<Variant, TargetSpec>,
}

impl TargetRegistry {
    pub fn from_config(config: &StudyConfig) -> TargetRegistry {
        let targets = config
            .targets
            .iter()
            .map(|(&variant, section)| {
                (
                    variant,
                    TargetSpec {
                        variant,
                        executable: section.executable.clone(),
                        launcher: section.launcher.clone(),
                    },
                )
            })
            .collect();
        TargetRegistry { targets }
    }

    /// Unconfigured variant is a configuration error, fatal to the
    /// requesting sweep only.
    pub fn resolve(&self, variant: Variant) -> Result<&TargetSpec, StudyError> {
        self.targets.get(&variant).ok_or_else(|| {
            StudyError::Config(format!("target `{}` is not configured for this study", variant))
        })
    }
}
