use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::Instant;

use tracing::{info, warn};

use crate::config::StudyConfig;
use crate::store::ResultTable;
use crate::sweep::SweepPlan;
use crate::target::{TargetSpec, Variant};
use crate::ensure_dir;

/// Explicit execution-context value threaded through the runner instead
/// of a process-wide working-directory change.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub base_dir: PathBuf,
    pub data_file: PathBuf,
    /// Fixed path every target writes its clustering artifact to.
    pub cluster_output: PathBuf,
    /// Where relocated artifacts and records live.
    pub artifact_dir: PathBuf,
    pub repetitions: u32,
}

impl ExecutionContext {
    pub fn from_config(config: &StudyConfig) -> ExecutionContext {
        let base_dir = config.context.base_dir.clone();
        let artifact_dir = resolve_in(&base_dir, &config.study.results_dir);
        ExecutionContext {
            base_dir,
            data_file: config.context.data_file.clone(),
            cluster_output: config.context.cluster_output_file.clone(),
            artifact_dir,
            repetitions: config.study.repetitions.max(1),
        }
    }

    /// Resolves a configured path against the context base directory.
    /// Child processes run with `base_dir` as their working directory,
    /// but the harness's own file operations must not rely on the
    /// process cwd.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        resolve_in(&self.base_dir, path)
    }
}

fn resolve_in(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Why one configuration point produced no timing. Failing to find or
/// spawn the target is a distinct kind from the target exiting
/// non-zero; both are reported, never silently skipped.
#[derive(Debug, Clone)]
pub enum RunFailure {
    Resolution { command: String, detail: String },
    Runtime { code: Option<i32>, output: String },
}

/// Averaged (or failed) timing measurement for one configuration point.
#[derive(Debug, Clone)]
pub enum TimingSample {
    Success { seconds: f64 },
    Failed(RunFailure),
}

impl TimingSample {
    pub fn seconds(&self) -> Option<f64> {
        match self {
            TimingSample::Success { seconds } => Some(*seconds),
            TimingSample::Failed(_) => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TimingSample::Success { .. })
    }
}

pub struct ExecutionRunner<'a> {
    ctx: &'a ExecutionContext,
}

impl<'a> ExecutionRunner<'a> {
    pub fn new(ctx: &'a ExecutionContext) -> ExecutionRunner<'a> {
        ExecutionRunner { ctx }
    }

    /// Runs one configuration point `repetitions` times back to back
    /// and averages the wall-clock durations. Elapsed time covers the
    /// whole external-process lifetime; startup and teardown overhead
    /// is part of the measured quantity. The first failing repetition
    /// fails the whole sample, so a partial average never leaks out.
    pub fn run_point(&self, command: &[String]) -> TimingSample {
        let mut elapsed = 0.0;
        for _ in 0..self.ctx.repetitions {
            let started = Instant::now();
            let output = match Command::new(&command[0])
                .args(&command[1..])
                .current_dir(&self.ctx.base_dir)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output()
            {
                Ok(output) => output,
                Err(err) => {
                    return TimingSample::Failed(RunFailure::Resolution {
                        command: command[0].clone(),
                        detail: err.to_string(),
                    })
                }
            };
            let seconds = started.elapsed().as_secs_f64();
            if !output.status.success() {
                return TimingSample::Failed(RunFailure::Runtime {
                    code: output.status.code(),
                    output: merged_output(&output),
                });
            }
            elapsed += seconds;
        }
        TimingSample::Success {
            seconds: elapsed / f64::from(self.ctx.repetitions),
        }
    }

    /// Runs every point of the plan in order. A failed point is
    /// recorded and the sweep moves on; one bad configuration never
    /// aborts the study.
    pub fn run_sweep(
        &self,
        spec: &TargetSpec,
        plan: &SweepPlan,
        node_count: Option<u32>,
    ) -> ResultTable {
        let mut table = ResultTable::new(spec.variant, node_count);
        for point in plan.points() {
            let command = spec.command_line(&point, self.ctx);
            info!(target: "sweep", "{}: {}", spec.variant, point.describe());
            let sample = self.run_point(&command);
            match &sample {
                TimingSample::Success { seconds } => {
                    info!(target: "sweep", "{}: {} -> {:.4}s", spec.variant, point.describe(), seconds);
                    self.relocate_artifact(spec.variant);
                }
                TimingSample::Failed(RunFailure::Runtime { code, output }) => {
                    warn!(
                        target: "sweep",
                        "{}: {} failed (exit {:?})\n{}",
                        spec.variant,
                        point.describe(),
                        code,
                        output
                    );
                }
                TimingSample::Failed(RunFailure::Resolution { command, detail }) => {
                    warn!(
                        target: "sweep",
                        "{}: command or file not found: {} ({})",
                        spec.variant,
                        command,
                        detail
                    );
                }
            }
            table.push(point, sample);
        }
        table
    }

    /// Every target writes its clustering artifact to the same fixed
    /// path, so it must be moved aside before the next run overwrites
    /// it. Strict sequencing of runs is the only mutual exclusion here.
    fn relocate_artifact(&self, variant: Variant) {
        let src = self.ctx.resolve(&self.ctx.cluster_output);
        if !src.exists() {
            warn!(
                target: "sweep",
                "{}: expected clustering artifact {} was not produced",
                variant,
                src.display()
            );
            return;
        }
        let dest = self
            .ctx
            .artifact_dir
            .join(format!("clusters_{}.csv", variant));
        if let Err(err) = ensure_dir(&self.ctx.artifact_dir) {
            warn!(target: "sweep", "cannot prepare artifact dir: {}", err);
            return;
        }
        if let Err(err) = std::fs::rename(&src, &dest) {
            warn!(
                target: "sweep",
                "cannot relocate {} to {}: {}",
                src.display(),
                dest.display(),
                err
            );
        }
    }
}

pub(crate) fn merged_output(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let mut merged = String::new();
    merged.push_str(stdout.trim_end());
    if !stderr.trim().is_empty() {
        if !merged.is_empty() {
            merged.push('\n');
        }
        merged.push_str(stderr.trim_end());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::fs;

    fn scratch_dir(prefix: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "{}_{}_{}",
            prefix,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("scratch dir");
        dir
    }

    fn test_ctx(base: &Path, repetitions: u32) -> ExecutionContext {
        ExecutionContext {
            base_dir: base.to_path_buf(),
            data_file: PathBuf::from("data.csv"),
            cluster_output: PathBuf::from("clusters.csv"),
            artifact_dir: base.join("out"),
            repetitions,
        }
    }

    #[cfg(unix)]
    fn write_stub(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write stub");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod stub");
        path
    }

    #[cfg(unix)]
    fn omp_spec(exe: &Path) -> TargetSpec {
        TargetSpec {
            variant: Variant::Omp,
            executable: exe.to_path_buf(),
            launcher: None,
        }
    }

    #[test]
    fn missing_executable_is_a_resolution_failure() {
        let dir = scratch_dir("study_exec_missing");
        let ctx = test_ctx(&dir, 1);
        let runner = ExecutionRunner::new(&ctx);
        let sample = runner.run_point(&["./does_not_exist".to_string()]);
        match sample {
            TimingSample::Failed(RunFailure::Resolution { command, .. }) => {
                assert_eq!(command, "./does_not_exist");
            }
            other => panic!("expected resolution failure, got {:?}", other),
        }
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn nonzero_exit_is_a_runtime_failure_with_captured_output() {
        let dir = scratch_dir("study_exec_runtime");
        let exe = write_stub(&dir, "fail.sh", "echo boom >&2\nexit 7");
        let ctx = test_ctx(&dir, 3);
        let runner = ExecutionRunner::new(&ctx);
        let sample = runner.run_point(&[exe.display().to_string()]);
        match sample {
            TimingSample::Failed(RunFailure::Runtime { code, output }) => {
                assert_eq!(code, Some(7));
                assert!(output.contains("boom"), "captured: {}", output);
            }
            other => panic!("expected runtime failure, got {:?}", other),
        }
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn one_failing_point_does_not_abort_the_sweep() {
        let dir = scratch_dir("study_exec_isolation");
        // Fails only when the thread-count argument is 4.
        let exe = write_stub(&dir, "selective.sh", "[ \"$2\" = \"4\" ] && exit 3\nexit 0");
        let ctx = test_ctx(&dir, 1);
        let runner = ExecutionRunner::new(&ctx);
        let plan = SweepPlan::Threads(vec![1, 4, 16]);
        let table = runner.run_sweep(&omp_spec(&exe), &plan, None);
        assert_eq!(table.len(), 3);
        let rows = table.rows();
        assert!(rows[0].1.is_success());
        assert!(!rows[1].1.is_success());
        assert!(rows[2].1.is_success());
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn sleep_stub_times_scale_with_thread_count() {
        let dir = scratch_dir("study_exec_sleep");
        let exe = write_stub(
            &dir,
            "sleepy.sh",
            "case \"$2\" in\n  1) t=0.01 ;;\n  4) t=0.04 ;;\n  16) t=0.16 ;;\n  *) t=0.01 ;;\nesac\nexec sleep $t",
        );
        let ctx = test_ctx(&dir, 1);
        let runner = ExecutionRunner::new(&ctx);
        let plan = SweepPlan::Threads(vec![1, 4, 16]);
        let table = runner.run_sweep(&omp_spec(&exe), &plan, None);
        let times: Vec<f64> = table
            .rows()
            .iter()
            .map(|(_, sample)| sample.seconds().expect("all points succeed"))
            .collect();
        assert_eq!(times.len(), 3);
        assert!(times[0] < times[1] && times[1] < times[2], "times: {:?}", times);
        for (expected, measured) in [0.01, 0.04, 0.16].iter().zip(&times) {
            assert!(
                *measured >= expected * 0.5 && *measured <= expected * 1.5,
                "expected ~{}s, measured {}s",
                expected,
                measured
            );
        }
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn successful_run_relocates_the_clustering_artifact() {
        let dir = scratch_dir("study_exec_artifact");
        let artifact = dir.join("clusters.csv");
        let exe = write_stub(
            &dir,
            "writer.sh",
            &format!("echo cluster > {}", artifact.display()),
        );
        let ctx = test_ctx(&dir, 1);
        let runner = ExecutionRunner::new(&ctx);
        let plan = SweepPlan::Threads(vec![1]);
        let table = runner.run_sweep(&omp_spec(&exe), &plan, None);
        assert!(table.rows()[0].1.is_success());
        assert!(!artifact.exists(), "artifact should have been moved");
        assert!(dir.join("out").join("clusters_omp.csv").exists());
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn failed_repetition_aborts_remaining_repetitions() {
        let dir = scratch_dir("study_exec_repfail");
        let marker = dir.join("attempts");
        // Counts invocations, fails on the second.
        let exe = write_stub(
            &dir,
            "flaky.sh",
            &format!(
                "echo x >> {m}\n[ $(wc -l < {m}) -ge 2 ] && exit 1\nexit 0",
                m = marker.display()
            ),
        );
        let ctx = test_ctx(&dir, 5);
        let runner = ExecutionRunner::new(&ctx);
        let sample = runner.run_point(&[exe.display().to_string()]);
        assert!(!sample.is_success());
        let attempts = fs::read_to_string(&marker).expect("marker").lines().count();
        assert_eq!(attempts, 2, "should stop at the failing repetition");
        let _ = fs::remove_dir_all(dir);
    }
}
