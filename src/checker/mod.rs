//! Reboot-required detection
//!
//! A [`RebootChecker`] reports whether the local node has pending updates.
//! Only a misconfigured check mechanism is an error; every other ambiguous
//! signal is read as "no reboot needed" so the daemon never forces an
//! unplanned reboot loop.

mod command;
mod file;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::SentinelConfig;
use crate::error::Result;

pub use command::CommandRebootChecker;
pub use file::FileRebootChecker;

#[async_trait]
pub trait RebootChecker: Send + Sync {
    /// `Err` only when the check itself cannot be performed; callers treat it as fatal
    async fn requires_reboot(&self) -> Result<bool>;
}

/// The command check when one is configured, otherwise the file check
pub fn build_checker(config: &SentinelConfig) -> Result<Arc<dyn RebootChecker>> {
    Ok(match &config.command {
        Some(command) => Arc::new(CommandRebootChecker::new(
            command.clone(),
            config.host_namespace,
        )?),
        None => Arc::new(FileRebootChecker::new(&config.file)),
    })
}
