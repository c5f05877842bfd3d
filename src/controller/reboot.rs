//! Rebooting the host

use async_trait::async_trait;
use tracing::info;

use crate::config::{RebootConfig, RebootMethod};
use crate::error::{Error, Result};
use crate::exec;

#[async_trait]
pub trait Rebooter: Send + Sync {
    async fn reboot(&self) -> Result<()>;
}

/// Runs a reboot command, e.g. `/bin/systemctl reboot`
pub struct CommandRebooter {
    command: Vec<String>,
    host_namespace: bool,
}

impl CommandRebooter {
    pub fn new(command: Vec<String>, host_namespace: bool) -> Result<Self> {
        if command.is_empty() {
            return Err(Error::ConfigError("reboot command is empty".to_string()));
        }
        Ok(Self {
            command,
            host_namespace,
        })
    }
}

#[async_trait]
impl Rebooter for CommandRebooter {
    async fn reboot(&self) -> Result<()> {
        info!("Running reboot command {:?}", self.command);
        let output = exec::build_command(&self.command, self.host_namespace)?
            .output()
            .await
            .map_err(|e| {
                Error::CommandError(format!("unable to run reboot command {:?}: {e}", self.command))
            })?;

        if !output.status.success() {
            return Err(Error::CommandError(format!(
                "reboot command {:?} exited with {}: {}",
                self.command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// Delivers a signal to PID 1; systemd reboots on SIGRTMIN+5
pub struct SignalRebooter {
    signal: i32,
}

impl SignalRebooter {
    pub fn new(signal: Option<i32>) -> Self {
        Self {
            signal: signal.unwrap_or_else(|| libc::SIGRTMIN() + 5),
        }
    }

    pub fn signal(&self) -> i32 {
        self.signal
    }
}

#[async_trait]
impl Rebooter for SignalRebooter {
    async fn reboot(&self) -> Result<()> {
        info!("Sending signal {} to PID 1", self.signal);
        // SAFETY: kill(2) has no memory-safety preconditions
        let rc = unsafe { libc::kill(1, self.signal) };
        if rc != 0 {
            return Err(Error::CommandError(format!(
                "unable to signal PID 1 with {}: {}",
                self.signal,
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }
}

pub fn build_rebooter(config: &RebootConfig) -> Result<Box<dyn Rebooter>> {
    Ok(match config.method {
        RebootMethod::Command => Box::new(CommandRebooter::new(
            config.command.clone(),
            config.host_namespace,
        )?),
        RebootMethod::Signal => Box::new(SignalRebooter::new(config.signal)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::split_command;

    #[tokio::test]
    async fn test_command_rebooter_success() {
        let rebooter = CommandRebooter::new(split_command("true"), false).unwrap();
        rebooter.reboot().await.unwrap();
    }

    #[tokio::test]
    async fn test_command_rebooter_failure() {
        let rebooter = CommandRebooter::new(split_command("false"), false).unwrap();
        assert!(matches!(
            rebooter.reboot().await,
            Err(Error::CommandError(_))
        ));

        let missing = CommandRebooter::new(split_command("/nonexistent/reboot"), false).unwrap();
        assert!(missing.reboot().await.is_err());
    }

    #[test]
    fn test_default_signal_is_sigrtmin_plus_five() {
        assert_eq!(SignalRebooter::new(None).signal(), libc::SIGRTMIN() + 5);
        assert_eq!(SignalRebooter::new(Some(15)).signal(), 15);
    }

    #[test]
    fn test_build_rebooter_rejects_empty_command() {
        let config = RebootConfig {
            command: vec![],
            ..Default::default()
        };
        assert!(build_rebooter(&config).is_err());
    }
}
