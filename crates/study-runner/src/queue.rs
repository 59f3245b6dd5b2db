use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use tracing::{info, warn};

use crate::config::QueueSection;
use crate::error::StudyError;
use crate::exec::merged_output;

/// How often the drain loop re-checks the interrupt flag while waiting
/// out the poll interval.
const INTERRUPT_CHECK_INTERVAL: Duration = Duration::from_millis(200);

/// One batch-queue job: resource shape plus the wrapped re-invocation
/// of the timing tool that runs on the allocation.
#[derive(Debug, Clone)]
pub struct QueueJob {
    pub node_count: u32,
    pub tasks_per_node: u32,
    pub time_limit: String,
    pub partition: String,
    pub account: String,
    pub wrapped_command: String,
}

impl QueueJob {
    pub fn submit_args(&self) -> Vec<String> {
        let mut args = vec![
            "--nodes".to_string(),
            self.node_count.to_string(),
            "--ntasks-per-node".to_string(),
            self.tasks_per_node.to_string(),
            "--time".to_string(),
            self.time_limit.clone(),
        ];
        if !self.partition.is_empty() {
            args.push("--partition".to_string());
            args.push(self.partition.clone());
        }
        if !self.account.is_empty() {
            args.push("--account".to_string());
            args.push(self.account.clone());
        }
        args.push("--wrap".to_string());
        args.push(self.wrapped_command.clone());
        args
    }
}

/// Batch-queue backend for the distributed family. Submits one job per
/// node count, then blocks until the scheduler reports no outstanding
/// jobs for the study user.
///
/// Hard invariant: no submission-error or interrupt path returns
/// without attempting a user-scoped cancel-all first, so an aborted
/// study never leaves orphaned jobs holding cluster resources.
#[derive(Debug, Clone)]
pub struct QueueClient {
    submit_command: String,
    query_command: String,
    cancel_command: String,
    user: String,
    poll_interval: Duration,
}

impl QueueClient {
    pub fn new(
        submit_command: impl Into<String>,
        query_command: impl Into<String>,
        cancel_command: impl Into<String>,
        user: impl Into<String>,
        poll_interval: Duration,
    ) -> QueueClient {
        QueueClient {
            submit_command: submit_command.into(),
            query_command: query_command.into(),
            cancel_command: cancel_command.into(),
            user: user.into(),
            poll_interval,
        }
    }

    pub fn from_config(queue: &QueueSection) -> Result<QueueClient, StudyError> {
        let user = match &queue.user {
            Some(user) => user.clone(),
            None => std::env::var("USER").map_err(|_| {
                StudyError::Setup(
                    "queue.user is not configured and USER is not set".to_string(),
                )
            })?,
        };
        Ok(QueueClient::new(
            queue.submit_command.clone(),
            queue.query_command.clone(),
            queue.cancel_command.clone(),
            user,
            Duration::from_secs(queue.poll_interval_seconds.max(1)),
        ))
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Submits every job in order. The first submission failure
    /// triggers a cancel-all (covering the jobs already submitted) and
    /// propagates without attempting further submissions.
    pub fn submit_all(&self, jobs: &[QueueJob]) -> Result<(), StudyError> {
        for job in jobs {
            if let Err(err) = self.submit(job) {
                self.cancel_all_best_effort();
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn submit(&self, job: &QueueJob) -> Result<(), StudyError> {
        let output = Command::new(&self.submit_command)
            .args(job.submit_args())
            .output()
            .map_err(|err| StudyError::Submission {
                node_count: job.node_count,
                code: None,
                detail: format!("{}: {}", self.submit_command, err),
            })?;
        if !output.status.success() {
            return Err(StudyError::Submission {
                node_count: job.node_count,
                code: output.status.code(),
                detail: merged_output(&output),
            });
        }
        info!(
            target: "queue",
            "submitted {} node(s) x {} task(s): {}",
            job.node_count,
            job.tasks_per_node,
            job.wrapped_command
        );
        Ok(())
    }

    /// Number of jobs the scheduler still reports for the study user.
    /// One line of query output per outstanding job; empty output means
    /// the queue has drained.
    pub fn outstanding_jobs(&self) -> Result<usize> {
        let output = Command::new(&self.query_command)
            .args(["-u", &self.user, "-h"])
            .output()
            .map_err(|err| anyhow!("queue query `{}` failed: {}", self.query_command, err))?;
        if !output.status.success() {
            return Err(anyhow!(
                "queue query `{}` exited {:?}: {}",
                self.query_command,
                output.status.code(),
                merged_output(&output)
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|line| !line.trim().is_empty())
            .count())
    }

    pub fn cancel_all(&self) -> Result<()> {
        let output = Command::new(&self.cancel_command)
            .args(["-u", &self.user])
            .output()
            .map_err(|err| anyhow!("cancel `{}` failed: {}", self.cancel_command, err))?;
        if !output.status.success() {
            return Err(anyhow!(
                "cancel `{}` exited {:?}: {}",
                self.cancel_command,
                output.status.code(),
                merged_output(&output)
            ));
        }
        Ok(())
    }

    /// Blocks until the queue reports no outstanding jobs for the
    /// study user. An interrupt observed at any point cancels all jobs
    /// before propagating.
    pub fn wait_for_drain(&self, interrupt: &AtomicBool) -> Result<()> {
        loop {
            if interrupt.load(Ordering::SeqCst) {
                self.cancel_all_best_effort();
                return Err(StudyError::Interrupted.into());
            }
            let outstanding = self.outstanding_jobs()?;
            if outstanding == 0 {
                info!(target: "queue", "queue drained for user {}", self.user);
                return Ok(());
            }
            info!(
                target: "queue",
                "{} job(s) outstanding for user {}, polling again in {:?}",
                outstanding,
                self.user,
                self.poll_interval
            );
            self.sleep_through_interval(interrupt);
        }
    }

    fn sleep_through_interval(&self, interrupt: &AtomicBool) {
        let deadline = Instant::now() + self.poll_interval;
        while Instant::now() < deadline && !interrupt.load(Ordering::SeqCst) {
            thread::sleep(INTERRUPT_CHECK_INTERVAL.min(self.poll_interval));
        }
    }

    /// Cancellation is mandatory on failure paths but its own failure
    /// must not mask the original error.
    fn cancel_all_best_effort(&self) {
        warn!(target: "queue", "cancelling all queued jobs for user {}", self.user);
        if let Err(err) = self.cancel_all() {
            warn!(target: "queue", "cancel-all failed: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensure_dir;
    use chrono::Utc;
    use std::fs;
    use std::path::{Path, PathBuf};

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

    #[cfg(unix)]
    fn write_stub(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write stub");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod stub");
        path
    }

    fn job(node_count: u32) -> QueueJob {
        QueueJob {
            node_count,
            tasks_per_node: 32,
            time_limit: "00:30:00".to_string(),
            partition: "notchpeak".to_string(),
            account: "cs6030".to_string(),
            wrapped_command: format!("study time --target mpi --nodes {}", node_count),
        }
    }

    #[test]
    fn submit_args_carry_resource_flags_and_wrapped_command() {
        let args = job(3).submit_args();
        assert_eq!(
            args,
            vec![
                "--nodes",
                "3",
                "--ntasks-per-node",
                "32",
                "--time",
                "00:30:00",
                "--partition",
                "notchpeak",
                "--account",
                "cs6030",
                "--wrap",
                "study time --target mpi --nodes 3",
            ]
        );
    }

    #[test]
    fn empty_partition_and_account_are_omitted() {
        let mut j = job(1);
        j.partition = String::new();
        j.account = String::new();
        let args = j.submit_args();
        assert!(!args.contains(&"--partition".to_string()));
        assert!(!args.contains(&"--account".to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn failed_submission_cancels_once_and_stops_submitting() {
        let dir = scratch_dir("study_queue_submitfail");
        let submit_log = dir.join("submit.log");
        let cancel_log = dir.join("cancel.log");
        fs::write(&submit_log, "").expect("seed log");
        // Succeeds once, then fails every subsequent submission.
        let submit = write_stub(
            &dir,
            "sbatch.sh",
            &format!(
                "[ $(wc -l < {log}) -ge 1 ] && exit 1\necho \"$@\" >> {log}",
                log = submit_log.display()
            ),
        );
        let cancel = write_stub(
            &dir,
            "scancel.sh",
            &format!("echo \"$@\" >> {}", cancel_log.display()),
        );
        let client = QueueClient::new(
            submit.display().to_string(),
            "true",
            cancel.display().to_string(),
            "testuser",
            Duration::from_millis(10),
        );

        let err = client
            .submit_all(&[job(2), job(3), job(4)])
            .expect_err("second submission must fail");
        match err {
            StudyError::Submission { node_count, .. } => assert_eq!(node_count, 3),
            other => panic!("expected submission error, got {:?}", other),
        }

        let submitted = fs::read_to_string(&submit_log).expect("submit log");
        assert_eq!(submitted.lines().count(), 1, "no submission after the failure");
        let cancelled = fs::read_to_string(&cancel_log).expect("cancel log");
        assert_eq!(cancelled.lines().count(), 1, "cancel-all exactly once");
        assert!(cancelled.contains("-u testuser"));
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn drain_returns_once_queue_is_empty() {
        let dir = scratch_dir("study_queue_drain");
        let query = write_stub(&dir, "squeue.sh", "exit 0");
        let client = QueueClient::new(
            "true",
            query.display().to_string(),
            "true",
            "testuser",
            Duration::from_millis(10),
        );
        let interrupt = AtomicBool::new(false);
        client.wait_for_drain(&interrupt).expect("empty queue drains");
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn interrupt_during_drain_cancels_before_propagating() {
        let dir = scratch_dir("study_queue_interrupt");
        let cancel_log = dir.join("cancel.log");
        let query = write_stub(&dir, "squeue.sh", "echo job_1");
        let cancel = write_stub(
            &dir,
            "scancel.sh",
            &format!("echo \"$@\" >> {}", cancel_log.display()),
        );
        let client = QueueClient::new(
            "true",
            query.display().to_string(),
            cancel.display().to_string(),
            "testuser",
            Duration::from_millis(10),
        );
        let interrupt = AtomicBool::new(true);
        let err = client
            .wait_for_drain(&interrupt)
            .expect_err("interrupt must abort the drain");
        assert!(err.to_string().contains("interrupted"), "got: {}", err);
        let cancelled = fs::read_to_string(&cancel_log).expect("cancel log");
        assert_eq!(cancelled.lines().count(), 1);
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn outstanding_jobs_counts_query_lines() {
        let dir = scratch_dir("study_queue_outstanding");
        let query = write_stub(&dir, "squeue.sh", "echo job_1\necho job_2");
        let client = QueueClient::new(
            "true",
            query.display().to_string(),
            "true",
            "testuser",
            Duration::from_millis(10),
        );
        assert_eq!(client.outstanding_jobs().expect("query"), 2);
        let _ = fs::remove_dir_all(dir);
    }
}
