use std::io::ErrorKind;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::RebootChecker;
use crate::error::{Error, Result};
use crate::exec;

/// Runs an arbitrary command: exit 0 means a reboot is required, exit 1 means
/// it is not, anything else is logged and treated as not required.
#[derive(Clone, Debug)]
pub struct CommandRebootChecker {
    command: Vec<String>,
    host_namespace: bool,
}

impl CommandRebootChecker {
    pub fn new(command: Vec<String>, host_namespace: bool) -> Result<Self> {
        if command.is_empty() {
            return Err(Error::ConfigError(
                "reboot sentinel command is empty".to_string(),
            ));
        }
        Ok(Self {
            command,
            host_namespace,
        })
    }

    /// The classic check: `test -f <path>`, typically run in the host namespace
    pub fn sentinel_file(path: &str, host_namespace: bool) -> Self {
        Self {
            command: vec!["test".to_string(), "-f".to_string(), path.to_string()],
            host_namespace,
        }
    }
}

#[async_trait]
impl RebootChecker for CommandRebootChecker {
    async fn requires_reboot(&self) -> Result<bool> {
        let mut cmd = exec::build_command(&self.command, self.host_namespace)?;
        let output = cmd.output().await.map_err(|e| {
            let hint = if e.kind() == ErrorKind::NotFound {
                " (executable not found)"
            } else {
                ""
            };
            Error::CommandError(format!(
                "unable to run sentinel command {:?}{hint}: {e}",
                self.command
            ))
        })?;

        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            code => {
                warn!(
                    "Sentinel command {:?} exited with {:?}, treating as no reboot required: {}",
                    self.command,
                    code,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                debug!("Sentinel stdout: {}", String::from_utf8_lossy(&output.stdout));
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::split_command;

    fn checker(line: &str) -> CommandRebootChecker {
        CommandRebootChecker::new(split_command(line), false).unwrap()
    }

    #[tokio::test]
    async fn test_exit_zero_requires_reboot() {
        assert!(checker("true").requires_reboot().await.unwrap());
    }

    #[tokio::test]
    async fn test_exit_one_does_not_require_reboot() {
        assert!(!checker("false").requires_reboot().await.unwrap());
    }

    #[tokio::test]
    async fn test_other_exit_codes_are_not_fatal() {
        let result = CommandRebootChecker::new(
            vec!["sh".to_string(), "-c".to_string(), "exit 3".to_string()],
            false,
        )
        .unwrap()
        .requires_reboot()
        .await;
        assert!(!result.unwrap());
    }

    #[tokio::test]
    async fn test_missing_executable_is_an_error() {
        let err = checker("/nonexistent/reboot-check")
            .requires_reboot()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CommandError(_)));
    }

    #[tokio::test]
    async fn test_sentinel_file_check() {
        let dir = tempfile::tempdir().unwrap();
        let sentinel = dir.path().join("reboot-required");
        let sentinel_check = CommandRebootChecker::sentinel_file(sentinel.to_str().unwrap(), false);
        assert!(!sentinel_check.requires_reboot().await.unwrap());

        std::fs::write(&sentinel, b"").unwrap();
        assert!(sentinel_check.requires_reboot().await.unwrap());
    }

    #[test]
    fn test_empty_command_is_a_config_error() {
        assert!(CommandRebootChecker::new(vec![], false).is_err());
    }
}
