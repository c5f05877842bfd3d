use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use super::RebootChecker;
use crate::error::Result;

/// Sentinel file check; needs no privileges when the sentinel's directory is mounted in
#[derive(Clone, Debug)]
pub struct FileRebootChecker {
    path: PathBuf,
}

impl FileRebootChecker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RebootChecker for FileRebootChecker {
    async fn requires_reboot(&self) -> Result<bool> {
        // An unreadable parent directory reads as "no sentinel"
        let present = tokio::fs::try_exists(&self.path).await.unwrap_or(false);
        debug!("Sentinel {} present: {}", self.path.display(), present);
        Ok(present)
    }
}
