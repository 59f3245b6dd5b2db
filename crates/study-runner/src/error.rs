use thiserror::Error;

/// Fatal error taxonomy. Per-configuration failures are not errors in
/// this sense; they travel inside [`crate::TimingSample`] so a bad
/// configuration point never aborts the enclosing sweep.
#[derive(Debug, Error)]
pub enum StudyError {
    /// Bad or incomplete study configuration. Fatal before anything is
    /// launched.
    #[error("configuration error: {0}")]
    Config(String),

    /// Study-wide setup failed (scratch/results directory, user lookup).
    #[error("study setup failed: {0}")]
    Setup(String),

    /// The batch-queue submission command failed. The adapter issues a
    /// cancel-all before this propagates.
    #[error("queue submission failed for {node_count} node(s) (exit {code:?}): {detail}")]
    Submission {
        node_count: u32,
        code: Option<i32>,
        detail: String,
    },

    /// Operator interrupt observed while jobs were outstanding. The
    /// adapter issues a cancel-all before this propagates.
    #[error("study interrupted while queue jobs were outstanding")]
    Interrupted,
}
