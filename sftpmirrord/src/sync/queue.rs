use std::path::PathBuf;

/// One pending upload. Immutable; a retry is a fresh value with the
/// attempt counter bumped, never a mutation of the failed one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub local: PathBuf,
    pub remote: String,
    pub attempt: u32,
}

impl UploadRequest {
    pub fn new(local: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            remote: remote.into(),
            attempt: 0,
        }
    }

    pub fn next_attempt(&self) -> Self {
        Self {
            local: self.local.clone(),
            remote: self.remote.clone(),
            attempt: self.attempt + 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    /// Requests past the cap are dropped terminally, never requeued.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}
