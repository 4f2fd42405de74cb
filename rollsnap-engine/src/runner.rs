//! Command execution for local and remote ZFS administration
//!
//! A concrete enum with one variant per execution style avoids dyn trait
//! issues with async; the variant is selected at construction time. The
//! only per-runner state is plain values: an optional command prefix (for
//! privilege elevation) and, for the SSH variant, the connection settings.

use rollsnap_common::Result;
use std::process::Output;
use tokio::process::Command;
use tracing::debug;

/// Environment the zfs/zpool commands run under. A fixed locale keeps
/// error strings and tabular output parseable.
const COMMAND_ENV: &[(&str, &str)] = &[
    ("LC_ALL", "C"),
    ("PATH", "/usr/sbin:/sbin:/usr/bin:/bin"),
];

/// SSH connection configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SshConfig {
    /// SSH port (default 22)
    pub port: u16,
    /// SSH username
    pub username: String,
    /// SSH identity file (private key)
    pub identity_file: Option<String>,
    /// Connection timeout in seconds
    pub connect_timeout: u32,
    /// Fail instead of prompting for a password
    pub batch_mode: bool,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            port: 22,
            username: "root".to_string(),
            identity_file: None,
            connect_timeout: 30,
            batch_mode: true,
        }
    }
}

impl SshConfig {
    /// Build SSH command arguments for the given host
    pub fn build_args(&self, host: &str) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            self.port.to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout),
        ];

        if self.batch_mode {
            args.push("-o".to_string());
            args.push("BatchMode=yes".to_string());
        }

        if let Some(ref identity) = self.identity_file {
            args.push("-i".to_string());
            args.push(identity.clone());
        }

        args.push(format!("{}@{}", self.username, host));
        args
    }
}

/// Where and how ZFS commands are executed
#[derive(Debug, Clone)]
pub enum Runner {
    /// Direct subprocess on this host
    Local {
        /// Command prefix, e.g. `["sudo"]`
        prefix: Vec<String>,
    },
    /// Subprocess on a remote host via ssh
    Ssh {
        host: String,
        config: SshConfig,
        /// Prefix applied to the remote command, e.g. `["sudo"]`
        prefix: Vec<String>,
    },
}

impl Runner {
    pub fn local() -> Self {
        Runner::Local { prefix: Vec::new() }
    }

    pub fn local_with_prefix(prefix: Vec<String>) -> Self {
        Runner::Local { prefix }
    }

    pub fn ssh(host: &str, config: SshConfig) -> Self {
        Runner::Ssh {
            host: host.to_string(),
            config,
            prefix: Vec::new(),
        }
    }

    /// Build a [`Command`] for the given program and arguments without
    /// spawning it, so callers can redirect stdio for piped transfers.
    pub fn command(&self, program: &str, args: &[&str]) -> Command {
        let mut cmd = match self {
            Runner::Local { prefix } => {
                let mut argv: Vec<String> = prefix.clone();
                argv.push(program.to_string());
                argv.extend(args.iter().map(|a| a.to_string()));

                let mut cmd = Command::new(&argv[0]);
                cmd.args(&argv[1..]);
                cmd
            }
            Runner::Ssh {
                host,
                config,
                prefix,
            } => {
                let mut remote: Vec<String> = prefix.clone();
                remote.push(program.to_string());
                remote.extend(args.iter().map(|a| a.to_string()));
                let remote_cmdline = remote
                    .iter()
                    .map(|a| shell_quote(a))
                    .collect::<Vec<_>>()
                    .join(" ");

                let mut cmd = Command::new("ssh");
                cmd.args(config.build_args(host));
                cmd.arg(remote_cmdline);
                cmd
            }
        };

        cmd.env_clear();
        for (key, value) in COMMAND_ENV {
            cmd.env(key, value);
        }
        cmd
    }

    /// Run the program to completion, capturing stdout and stderr.
    pub async fn run(&self, program: &str, args: &[&str]) -> Result<Output> {
        debug!(program, ?args, runner = self.describe(), "running command");
        let output = self.command(program, args).output().await?;
        debug!(
            code = output.status.code(),
            "command exited"
        );
        Ok(output)
    }

    fn describe(&self) -> &'static str {
        match self {
            Runner::Local { .. } => "local",
            Runner::Ssh { .. } => "ssh",
        }
    }
}

/// Quote an argument for the remote shell when sent over ssh.
pub(crate) fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./@=:,".contains(c))
    {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
