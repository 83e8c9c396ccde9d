//! Typed failures that callers (and the process exit code) care about.
//!
//! Most errors are plain [`anyhow::Error`] chains; a [`DeployError`]
//! is attached either as the root cause or as a context layer, and
//! [`exit_code`] finds it anywhere in the chain.

use camino::Utf8PathBuf;

/// Failures with a distinct meaning to the caller.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    /// A required partition is missing
    #[error("no partition with label {0} found")]
    NotFound(String),
    /// A filesystem type with no known mkfs
    #[error("unsupported filesystem: {0}")]
    UnsupportedFilesystem(String),
    /// An image file could not be allocated
    #[error("failed to allocate image file {0}")]
    AllocationError(Utf8PathBuf),
    /// mkfs failed
    #[error("failed to format {device} as {fs}")]
    FormatError {
        /// The device being formatted
        device: Utf8PathBuf,
        /// The filesystem type
        fs: String,
    },
    /// Secure boot files are missing from the deployed tree
    #[error("shim files not found in {0}")]
    MissingShimFiles(Utf8PathBuf),
    /// An action that needs the recovery system ran elsewhere
    #[error("{0} can only be run when booted from the recovery system")]
    WrongBootSource(&'static str),
    /// A termination signal arrived
    #[error("interrupted")]
    Interrupted,
    /// An image signature did not verify
    #[error("signature verification failed for {0}")]
    Verification(String),
    /// A hook stage failed in strict mode
    #[error("cloud init hook {stage} failed: {message}")]
    HookFailed {
        /// The hook stage that failed
        stage: String,
        /// The failure message
        message: String,
    },
    /// The planned partitions do not fit the disk
    #[error("not enough space on {disk}: {required} sectors required, {available} available")]
    NoSpace {
        /// The target disk
        disk: Utf8PathBuf,
        /// Sectors required
        required: u64,
        /// Sectors available
        available: u64,
    },
}

impl DeployError {
    /// The process exit status for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            DeployError::NotFound(_) => 11,
            DeployError::UnsupportedFilesystem(_) => 12,
            DeployError::AllocationError(_) => 13,
            DeployError::FormatError { .. } => 14,
            DeployError::MissingShimFiles(_) => 15,
            DeployError::WrongBootSource(_) => 16,
            DeployError::Interrupted => 17,
            DeployError::Verification(_) => 18,
            DeployError::HookFailed { .. } => 19,
            DeployError::NoSpace { .. } => 20,
        }
    }
}

/// Map an error chain to a process exit status; 1 for untyped failures.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<DeployError>()
        .map_or(1, DeployError::exit_code)
}
