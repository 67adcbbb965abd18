use std::path::PathBuf;
use thiserror::Error;

/// Failures that decide the process exit status.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("`{command}` exited with status {code}")]
    CommandFailed { command: String, code: i32 },

    #[error("`{command}` timed out after {seconds}s")]
    CommandTimedOut { command: String, seconds: u64 },

    #[error("`{command}` was killed before it exited")]
    CommandKilled { command: String },

    #[error("--commit is required")]
    MissingCommit,

    #[error("failed to apply {label} {path:?} (plain and --3way)")]
    PatchFailed { label: &'static str, path: PathBuf },

    #[error("{0} instance(s) did not complete successfully")]
    IncompleteInstances(usize),

    #[error("no results found in {0:?}")]
    NoResults(PathBuf),
}

impl HarnessError {
    pub fn exit_code(&self) -> i32 {
        match self {
            HarnessError::CommandFailed { code, .. } if *code != 0 => *code,
            _ => 1,
        }
    }
}
