//! Interfaces to components outside the sync core

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VcsOutcome {
    pub success: bool,
    pub detail: String,
}

impl VcsOutcome {
    pub fn ok(detail: impl Into<String>) -> Self {
        Self {
            success: true,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("Collaborator operation failed: {0}")]
    Failed(String),
}

/// Version control hooks called after synced batches
#[async_trait]
pub trait VersionControl: Send + Sync {
    async fn track_changes(&self, paths: &[String]) -> Result<VcsOutcome, CollaboratorError>;

    async fn commit(&self, message: &str) -> Result<VcsOutcome, CollaboratorError>;

    async fn status(&self) -> Result<VcsOutcome, CollaboratorError>;
}

/// Accepts everything and does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopVersionControl;

#[async_trait]
impl VersionControl for NoopVersionControl {
    async fn track_changes(&self, paths: &[String]) -> Result<VcsOutcome, CollaboratorError> {
        Ok(VcsOutcome::ok(format!("{} paths ignored", paths.len())))
    }

    async fn commit(&self, _message: &str) -> Result<VcsOutcome, CollaboratorError> {
        Ok(VcsOutcome::ok("nothing to commit"))
    }

    async fn status(&self) -> Result<VcsOutcome, CollaboratorError> {
        Ok(VcsOutcome::ok("no version control"))
    }
}
