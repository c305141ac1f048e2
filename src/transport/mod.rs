//! Remote execution on workers.
//!
//! A transport distinguishes connection failures, returned as
//! [`EngineError::TransientNetwork`], from commands that ran and
//! exited non-zero, which come back as a [`CommandOutput`].

use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::EngineError;
use crate::errors::Result;
use crate::model::Endpoint;

mod ssh;

pub use ssh::SshTransport;

/// A program and its arguments, quoted for a POSIX shell only when
/// sent to the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl RemoteCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn to_shell(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|word| shell_quote(word))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl std::fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_shell())
    }
}

fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./=:,+@%{}".contains(&b));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit into [`EngineError::CommandFailed`].
    pub fn check(self, command: &RemoteCommand) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(EngineError::CommandFailed {
                command: command.to_string(),
                exit_code: self.exit_code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

#[async_trait]
pub trait RemoteTransport: Send + Sync + 'static {
    async fn exec(&self, endpoint: &Endpoint, command: &RemoteCommand) -> Result<CommandOutput>;

    /// Write `data` to `remote_path` on the worker, replacing it.
    async fn upload(&self, endpoint: &Endpoint, data: &[u8], remote_path: &str) -> Result<()>;

    async fn download(&self, endpoint: &Endpoint, remote_path: &str) -> Result<Vec<u8>>;

    /// Run a command that must exit zero.
    async fn run(&self, endpoint: &Endpoint, command: &RemoteCommand) -> Result<CommandOutput> {
        self.exec(endpoint, command).await?.check(command)
    }
}

pub type SharedTransport = Arc<dyn RemoteTransport>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_only_what_needs_it() {
        let cmd = RemoteCommand::new("tar")
            .arg("-czPf")
            .arg("/tmp/a.tar.gz")
            .args(["/workspace/my notes", "it's"]);
        assert_eq!(
            cmd.to_shell(),
            r"tar -czPf /tmp/a.tar.gz '/workspace/my notes' 'it'\''s'"
        );
        assert_eq!(RemoteCommand::new("sha256sum").arg("").to_shell(), "sha256sum ''");
    }

    #[test]
    fn non_zero_exit_is_command_failure() {
        let cmd = RemoteCommand::new("false");
        let out = CommandOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: "nope\n".into(),
        };
        let err = out.check(&cmd).unwrap_err();
        assert_eq!(
            err,
            EngineError::CommandFailed {
                command: "false".into(),
                exit_code: 1,
                stderr: "nope".into()
            }
        );
    }
}
