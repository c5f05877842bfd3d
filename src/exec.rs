//! Host command construction
//!
//! When the daemon runs inside a container, sentinel checks and reboot
//! commands have to see the host's filesystem. Wrapping them in `nsenter`
//! against PID 1's mount namespace achieves that without extra privileges
//! beyond `hostPID`.

use tokio::process::Command;

use crate::error::{Error, Result};

/// Binary used to enter the host mount namespace
pub const NSENTER: &str = "/usr/bin/nsenter";

/// Final argv for `command`, prefixed with nsenter when `host_namespace` is set
pub fn host_argv(command: &[String], host_namespace: bool) -> Vec<String> {
    if host_namespace {
        let mut argv = vec![
            NSENTER.to_string(),
            "-m/proc/1/ns/mnt".to_string(),
            "--".to_string(),
        ];
        argv.extend(command.iter().cloned());
        argv
    } else {
        command.to_vec()
    }
}

/// Build a tokio [`Command`] for `command`; fails on an empty argv
pub fn build_command(command: &[String], host_namespace: bool) -> Result<Command> {
    let argv = host_argv(command, host_namespace);
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| Error::ConfigError("empty command".to_string()))?;

    let mut cmd = Command::new(program);
    cmd.args(args).kill_on_drop(true);
    Ok(cmd)
}

/// Split a command line on whitespace
pub fn split_command(line: &str) -> Vec<String> {
    line.split_whitespace().map(str::to_string).collect()
}
