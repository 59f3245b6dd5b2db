use crate::config::SweepSection;
use crate::error::StudyError;
use crate::target::Variant;

/// One coordinate in a sweep's parameter space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigurationPoint {
    ThreadCount(u32),
    BlockSize(u32),
    Processes { per_node: u32, node_count: u32 },
}

impl ConfigurationPoint {
    /// The swept parameter value, which is also the persisted key and
    /// the default chart x value.
    pub fn axis_value(&self) -> u32 {
        match *self {
            ConfigurationPoint::ThreadCount(n) => n,
            ConfigurationPoint::BlockSize(n) => n,
            ConfigurationPoint::Processes { per_node, .. } => per_node,
        }
    }

    pub fn node_count(&self) -> Option<u32> {
        match *self {
            ConfigurationPoint::Processes { node_count, .. } => Some(node_count),
            _ => None,
        }
    }

    /// Derived total for the distributed family:
    /// processes-per-node × node-count.
    pub fn total_processes(&self) -> Option<u32> {
        match *self {
            ConfigurationPoint::Processes {
                per_node,
                node_count,
            } => Some(per_node * node_count),
            _ => None,
        }
    }

    pub fn describe(&self) -> String {
        match *self {
            ConfigurationPoint::ThreadCount(n) => format!("{} thread(s)", n),
            ConfigurationPoint::BlockSize(n) => format!("block size {}", n),
            ConfigurationPoint::Processes {
                per_node,
                node_count,
            } => format!(
                "{} process(es)/node on {} node(s), {} total",
                per_node,
                node_count,
                per_node * node_count
            ),
        }
    }
}

/// Ordered, deterministic set of configuration points for one variant.
/// The same declared ranges always yield the same sequence.
#[derive(Debug, Clone)]
pub enum SweepPlan {
    Threads(Vec<u32>),
    Blocks(Vec<u32>),
    Distributed {
        node_counts: Vec<u32>,
        processes_per_node: Vec<u32>,
    },
}

impl SweepPlan {
    /// Plan for a variant from the declared ranges. An empty range for
    /// the requested variant is a configuration error fatal to this
    /// sweep only.
    pub fn for_variant(variant: Variant, sweeps: &SweepSection) -> Result<SweepPlan, StudyError> {
        let plan = match variant {
            Variant::Serial | Variant::Omp => SweepPlan::Threads(sweeps.thread_counts.clone()),
            Variant::Cuda => SweepPlan::Blocks(sweeps.block_sizes.clone()),
            Variant::Mpi | Variant::CudaMpi => SweepPlan::Distributed {
                node_counts: sweeps.node_counts.clone(),
                processes_per_node: sweeps.processes_per_node.clone(),
            },
        };
        if plan.is_empty() {
            return Err(StudyError::Config(format!(
                "no sweep range declared for target `{}`",
                variant
            )));
        }
        Ok(plan)
    }

    /// Distributed plan pinned to one node count, as run on a single
    /// queue allocation.
    pub fn distributed_at(
        node_count: u32,
        sweeps: &SweepSection,
    ) -> Result<SweepPlan, StudyError> {
        if sweeps.processes_per_node.is_empty() {
            return Err(StudyError::Config(
                "no sweep range declared for `sweeps.processes_per_node`".to_string(),
            ));
        }
        Ok(SweepPlan::Distributed {
            node_counts: vec![node_count],
            processes_per_node: sweeps.processes_per_node.clone(),
        })
    }

    /// Ordered points: outer loop over node counts, inner loop over
    /// processes-per-node for the distributed family.
    pub fn points(&self) -> Vec<ConfigurationPoint> {
        match self {
            SweepPlan::Threads(counts) => counts
                .iter()
                .map(|&n| ConfigurationPoint::ThreadCount(n))
                .collect(),
            SweepPlan::Blocks(sizes) => sizes
                .iter()
                .map(|&n| ConfigurationPoint::BlockSize(n))
                .collect(),
            SweepPlan::Distributed {
                node_counts,
                processes_per_node,
            } => {
                let mut points = Vec::with_capacity(node_counts.len() * processes_per_node.len());
                for &node_count in node_counts {
                    for &per_node in processes_per_node {
                        points.push(ConfigurationPoint::Processes {
                            per_node,
                            node_count,
                        });
                    }
                }
                points
            }
        }
    }

    pub fn len(&self) -> usize {
        match self {
            SweepPlan::Threads(counts) => counts.len(),
            SweepPlan::Blocks(sizes) => sizes.len(),
            SweepPlan::Distributed {
                node_counts,
                processes_per_node,
            } => node_counts.len() * processes_per_node.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sweeps() -> SweepSection {
        SweepSection {
            thread_counts: vec![1, 16, 32, 64, 1024],
            processes_per_node: vec![1, 8, 16, 32],
            node_counts: vec![2, 3, 4],
            block_sizes: vec![1, 64, 128, 1023],
        }
    }

    #[test]
    fn thread_plan_preserves_declared_order() {
        let plan = SweepPlan::for_variant(Variant::Omp, &sweeps()).expect("plan");
        let points = plan.points();
        assert_eq!(points.len(), 5);
        assert_eq!(
            points
                .iter()
                .map(ConfigurationPoint::axis_value)
                .collect::<Vec<_>>(),
            vec![1, 16, 32, 64, 1024]
        );
    }

    #[test]
    fn distributed_plan_is_cartesian_product() {
        let plan = SweepPlan::for_variant(Variant::Mpi, &sweeps()).expect("plan");
        assert_eq!(plan.len(), 12);
        assert_eq!(plan.points().len(), 12);
    }

    #[test]
    fn distributed_points_iterate_nodes_outer() {
        let section = SweepSection {
            node_counts: vec![2, 3],
            processes_per_node: vec![1, 8],
            ..SweepSection::default()
        };
        let plan = SweepPlan::for_variant(Variant::Mpi, &section).expect("plan");
        let points = plan.points();
        assert_eq!(
            points[0],
            ConfigurationPoint::Processes {
                per_node: 1,
                node_count: 2
            }
        );
        assert_eq!(
            points[1],
            ConfigurationPoint::Processes {
                per_node: 8,
                node_count: 2
            }
        );
        assert_eq!(
            points[2],
            ConfigurationPoint::Processes {
                per_node: 1,
                node_count: 3
            }
        );
    }

    #[test]
    fn derived_totals_multiply_per_node_by_nodes() {
        let section = SweepSection {
            node_counts: vec![2],
            processes_per_node: vec![1, 2],
            ..SweepSection::default()
        };
        let plan = SweepPlan::for_variant(Variant::Mpi, &section).expect("plan");
        let totals: Vec<u32> = plan
            .points()
            .iter()
            .map(|p| p.total_processes().expect("distributed point"))
            .collect();
        assert_eq!(totals, vec![2, 4]);
    }

    #[test]
    fn plans_are_restartable() {
        let plan = SweepPlan::for_variant(Variant::Cuda, &sweeps()).expect("plan");
        assert_eq!(plan.points(), plan.points());
    }

    #[test]
    fn empty_range_is_a_config_error() {
        let section = SweepSection::default();
        let err = SweepPlan::for_variant(Variant::Omp, &section).expect_err("must fail");
        assert!(matches!(err, StudyError::Config(_)));
    }

    #[test]
    fn distributed_at_pins_node_count() {
        let plan = SweepPlan::distributed_at(3, &sweeps()).expect("plan");
        assert_eq!(plan.len(), 4);
        assert!(plan
            .points()
            .iter()
            .all(|p| p.node_count() == Some(3)));
    }
}
